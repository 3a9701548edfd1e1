//! Runner error types.

use thiserror::Error;

pub type RunnerResult<T> = Result<T, RunnerError>;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Control plane error: {0}")]
    Client(#[from] vconv_client::ClientError),

    #[error("Media error: {0}")]
    Media(#[from] vconv_media::MediaError),

    #[error("Storage error: {0}")]
    Storage(#[from] vconv_storage::StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunnerError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
