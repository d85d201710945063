pub mod chunk;
pub mod checksum;
pub mod config;
pub mod engine;
pub mod error;
pub mod index;
pub mod indexfile;
pub mod merger;
pub mod patcher;
pub mod resolver;
pub mod rollsum;
pub mod scanner;
pub mod source;
pub mod util;
pub mod window;

pub use error::BlockSyncError;
pub type Result<T> = std::result::Result<T, BlockSyncError>;

/// Block size used when none is given on the command line.
pub const DEFAULT_BLOCK_SIZE: u32 = 8192;
