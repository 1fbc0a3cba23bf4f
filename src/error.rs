use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("tensor computation error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("missing required configuration: {0}")]
    ConfigMissing(&'static str),

    #[error("{kind} not found: {}", path.display())]
    NotFound { kind: &'static str, path: PathBuf },

    #[error("malformed {kind}: {reason}")]
    Malformed { kind: &'static str, reason: String },

    #[error("encoder unavailable: {0}")]
    EncoderUnavailable(String),

    #[error("retrieval index is not loaded")]
    NotReady,

    #[error("retrieval worker has stopped")]
    WorkerStopped,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("data directory does not exist and could not be created: {0}")]
    DataDir(PathBuf),
}

/// Coarse classification of an [`Error`], for matching without payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ConfigMissing,
    NotFound,
    Malformed,
    EncoderUnavailable,
    NotReady,
    WorkerStopped,
    Config,
    Io,
}

impl Error {
    pub(crate) fn malformed(kind: &'static str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            kind,
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ConfigMissing(_) => ErrorKind::ConfigMissing,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::Malformed { .. } | Error::Json(_) => ErrorKind::Malformed,
            Error::EncoderUnavailable(_) | Error::Tensor(_) => {
                ErrorKind::EncoderUnavailable
            }
            Error::NotReady => ErrorKind::NotReady,
            Error::WorkerStopped => ErrorKind::WorkerStopped,
            Error::Config(_) | Error::DataDir(_) => ErrorKind::Config,
            Error::Io(_) => ErrorKind::Io,
        }
    }
}
