use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::DEFAULT_BLOCK_SIZE;

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(4)
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Build block indexes and patch files against them", long_about = None)]
pub struct Args {
    /// Suppress non-error messages
    #[arg(short, long, global = true, default_value_t = false)]
    pub quiet: bool,

    /// Increase verbosity
    #[arg(short, long, global = true, default_value_t = false)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Build a .gosync index file for a file
    Build {
        /// File to index
        file: PathBuf,

        /// Block size to use for the index
        #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
        blocksize: u32,
    },

    /// Recreate the reference file, using an index and a local file that is
    /// believed to be similar
    Patch {
        /// Local file to reuse blocks from
        local: PathBuf,

        /// Index produced by `build`; a path or http(s) URL
        index: String,

        /// The reference source; a path or http(s) URL
        reference: String,

        /// Output path; the local file is overwritten when omitted
        output: Option<PathBuf>,

        /// Number of streams to use concurrently
        #[arg(short = 'p', long, default_value_t = default_parallelism())]
        parallel: usize,
    },

    /// Compare a local file with an index and print match statistics
    Diff {
        /// Local file to compare
        local: PathBuf,

        /// Index produced by `build`; a path or http(s) URL
        index: String,

        /// Number of streams to use concurrently
        #[arg(short = 'p', long, default_value_t = default_parallelism())]
        parallel: usize,
    },
}
