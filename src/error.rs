use crate::measurements::TransferDirection;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Service temporarily overloaded, retry after {retry_after_secs}s")]
    Overloaded { retry_after_secs: u64 },

    #[error("Upload too large: received {received_bytes} bytes, limit is {limit_bytes} bytes")]
    PayloadTooLarge { limit_bytes: u64, received_bytes: u64 },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Test cancelled")]
    Cancelled,

    #[error("{0}")]
    NoSamples(String),

    #[error("No data transferred during {0} phase")]
    NoData(TransferDirection),
}

impl Error {
    /// Whether the same request may succeed if retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Overloaded { .. } | Error::Transport(_) | Error::Http(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
