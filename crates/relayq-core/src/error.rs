use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("broker error: {0}")]
    Broker(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("handler error: {0}")]
    Handler(String),

    #[error("task execution timed out after {0:?}")]
    Timeout(Duration),

    #[error("engine is shutting down")]
    Shutdown,
}

impl Error {
    /// True when the failure came from the per-attempt deadline, so hooks
    /// can tell a timeout apart from an ordinary handler error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
