use blocksync::config::{Args, Command};
use blocksync::engine;
use clap::Parser;
use tracing::{error, Level};
use tracing_subscriber::FmtSubscriber;

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose {
        Level::DEBUG
    } else if args.quiet {
        Level::ERROR
    } else {
        Level::INFO
    };

    // stdout stays clean for redirection; everything diagnostic goes to stderr
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("setting default subscriber failed");

    let result = match &args.command {
        Command::Build { file, blocksize } => engine::build(file, *blocksize).map(|_| ()),
        Command::Patch {
            local,
            index,
            reference,
            output,
            parallel,
        } => engine::patch(local, index, reference, output.as_deref(), *parallel),
        Command::Diff {
            local,
            index,
            parallel,
        } => engine::diff(local, index, *parallel),
    };

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }

    Ok(())
}
