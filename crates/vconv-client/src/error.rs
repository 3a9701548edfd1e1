//! Client error types.

use thiserror::Error;

pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Control plane returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unexpected response shape: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Retry only connectivity faults and server-side errors.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Network(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            ClientError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ClientError::Status {
            status: 503,
            body: String::new()
        }
        .is_retryable());
        assert!(!ClientError::Status {
            status: 404,
            body: String::new()
        }
        .is_retryable());
        assert!(!ClientError::Forbidden("/runner/t1/start".into()).is_retryable());
        assert!(!ClientError::Config("BASE_URL not set".into()).is_retryable());
    }
}
