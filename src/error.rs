use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlockSyncError {
    #[error("index body ended with a partial checksum record")]
    PartialChecksum,

    #[error("file header does not match the magic string; not a valid gosync index")]
    BadMagic,

    #[error("index major version {found} does not match the supported version {supported}")]
    VersionMismatch { found: u16, supported: u16 },

    #[error("ranged request not supported (server did not respond with 206 Partial Content)")]
    RangedRequestNotSupported,

    #[error("HTTP response was gzip encoded; ranges may not match those requested")]
    GzipEncoded,

    #[error("404 error on URL: {0}")]
    UrlNotFound(String),

    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("unexpected response length: requested {requested} bytes, received {received}")]
    UnexpectedResponseLength { requested: u64, received: u64 },

    #[error("block range {start_block}-{end_block} did not match the expected checksums")]
    VerificationFailed { start_block: u32, end_block: u32 },

    #[error("block {0} not found in either the missing or matched list")]
    BlockNotInEitherList(u32),

    #[error("received unexpected block {received}, expected {expected}")]
    UnexpectedBlockDelivery { expected: u32, received: u32 },

    #[error("block source was already closed")]
    AlreadyClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),
}
