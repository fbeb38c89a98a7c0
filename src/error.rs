use thiserror::Error;

/// Everything that can abort a backup or restore run.
///
/// The pipeline never retries; each of these is surfaced verbatim to the
/// caller, who owns any retry or backoff policy.
#[derive(Debug, Error)]
pub enum Error {
    #[error("object `{name}` is too large: {len} bytes > {max} bytes")]
    ChunkTooLarge { name: String, len: usize, max: usize },

    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[source] std::io::Error),

    #[error("object `{name}` not found")]
    NotFound { name: String },

    #[error("data corruption: {reason}")]
    DataCorruption { reason: String },

    #[error("transform failed: {reason}")]
    TransformFailure { reason: String },

    #[error("stream I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("folder holds more than one backup run: `{first}` and `{other}`")]
    MixedRuns { first: String, other: String },

    #[error("input needs more than {max} chunks")]
    TooManyChunks { max: u64 },

    #[error("folder already holds {objects} objects; one backup per folder")]
    FolderNotEmpty { objects: usize },

    #[error("backup is incomplete: {reason}")]
    Incomplete { reason: String },

    #[error("run was cancelled")]
    Cancelled,

    #[error("worker task failed: {0}")]
    TaskFailed(#[from] tokio::task::JoinError),
}

impl Error {
    pub(crate) fn corruption(reason: impl Into<String>) -> Self {
        Self::DataCorruption {
            reason: reason.into(),
        }
    }

    pub(crate) fn transform(reason: impl Into<String>) -> Self {
        Self::TransformFailure {
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
