//! Transport and protocol errors raised at the server boundary.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("connect failed: {0}")] Connect(String),
    #[error("I/O error: {0}")] Io(String),
    #[error("server error {code}: {message}")] Rpc { code: i64, message: String },
    #[error("protocol violation: {0}")] Protocol(String),
    #[error("request timed out")] Timeout,
    #[error("connection closed")] Closed,
}

impl LinkError {
    /// Whether the server answered with an error object, as opposed to the
    /// transport failing underneath the request.
    pub fn is_server_rejection(&self) -> bool {
        matches!(self, LinkError::Rpc { .. })
    }
}

impl From<serde_json::Error> for LinkError {
    fn from(e: serde_json::Error) -> Self {
        LinkError::Protocol(e.to_string())
    }
}
