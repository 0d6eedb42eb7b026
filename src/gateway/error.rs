use thiserror::Error;

/// Typed failure taxonomy for gateway calls.
///
/// Only `Connection` is retryable; everything else reflects a definite
/// answer from the panel and retrying would not change it.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("gateway rejected request: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("gateway operation failed: {0}")]
    Operation(String),
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Connection(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, GatewayError::NotFound(_))
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() || err.is_request() {
            GatewayError::Connection(err.to_string())
        } else if err.is_decode() {
            GatewayError::Operation(format!("malformed response: {err}"))
        } else {
            GatewayError::Operation(err.to_string())
        }
    }
}
