use thiserror::Error;

/// Status of an upsync or downsync operation. One status per call, no
/// partial-success reporting.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("required endpoint is not configured")]
    Endpoint,
    #[error("stream does not start with a PSARC header")]
    BadHeader,
    #[error("DSAR archives are not supported")]
    DsarUnsupported,
    #[error("archive manifest is missing or malformed")]
    Manifest,
    #[error("file could not be inserted into the archive")]
    Insert,
    #[error("compression failed: {0}")]
    Compression(String),
    #[error("decompression failed: {0}")]
    Decompression(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Misc(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;
