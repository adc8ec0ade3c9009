//! Error types for the wakevirt operator

use thiserror::Error;

/// Main error type for wakevirt operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// I/O error (sockets, filesystem)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Validation error for WolConfig specs or CLI flags
    #[error("validation error: {0}")]
    Validation(String),

    /// Packet capture setup error
    #[error("capture error: {0}")]
    Capture(String),

    /// gRPC transport error
    #[error("transport error: {0}")]
    Transport(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Metrics registration error
    #[error("metrics error: {0}")]
    Metrics(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a capture error with the given message
    pub fn capture(msg: impl Into<String>) -> Self {
        Self::Capture(msg.into())
    }

    /// Create a transport error with the given message
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }
}

impl From<prometheus::Error> for Error {
    fn from(e: prometheus::Error) -> Self {
        Self::Metrics(e.to_string())
    }
}
