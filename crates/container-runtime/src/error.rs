//! Error types for container runtime operations

use thiserror::Error;

/// Unified error type for runtime operations
#[derive(Error, Debug)]
pub enum Error {
    /// The container or image does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// The request conflicts with the current runtime state
    /// (name already in use, removal already in progress, ...)
    #[error("conflict: {0}")]
    Conflict(String),

    /// A network or daemon failure that may succeed when retried
    #[error("transient runtime failure: {0}")]
    Transient(String),

    /// Malformed port specification
    #[error("invalid port spec '{spec}': {reason}")]
    InvalidPortSpec {
        /// The specification as given by the caller
        spec: String,
        /// Why it was rejected
        reason: String,
    },

    /// Any other failure reported by the daemon
    #[error("runtime error: {0}")]
    Other(String),
}

impl Error {
    /// Create an invalid port spec error
    pub fn invalid_port(spec: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPortSpec {
            spec: spec.into(),
            reason: reason.into(),
        }
    }

    /// Whether the target of the operation is already gone
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Whether the operation collided with existing state
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    /// Whether retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}

impl From<bollard::errors::Error> for Error {
    fn from(err: bollard::errors::Error) -> Self {
        use bollard::errors::Error as DockerError;

        match err {
            DockerError::DockerResponseServerError {
                status_code,
                message,
            } => match status_code {
                404 => Error::NotFound(message),
                409 => Error::Conflict(message),
                // registry hiccups surface as 5xx from the daemon
                500..=599 => Error::Transient(message),
                _ => Error::Other(format!("status {}: {}", status_code, message)),
            },
            DockerError::RequestTimeoutError => Error::Transient("request timed out".to_string()),
            DockerError::IOError { .. } => Error::Transient(err.to_string()),
            other => Error::Other(other.to_string()),
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
