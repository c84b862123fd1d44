use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error("no KEY line in cache header")]
    MissingKey,

    #[error("unsupported cache key format: {0}")]
    InvalidKey(String),

    #[error("no HTTP status after cache key")]
    MissingStatus,

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("sweep ended without publishing a result")]
    Aborted,
}

pub type Result<T> = std::result::Result<T, SweepError>;
