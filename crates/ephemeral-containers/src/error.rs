//! Error types for container lifecycle operations

use crate::container::Container;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced to callers of this crate
#[derive(Error, Debug)]
pub enum Error {
    /// The container, image or port does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// The readiness strategy did not succeed within its startup timeout
    #[error("timed out after {waited:?} waiting for readiness: {last}")]
    Timeout {
        /// Time spent polling
        waited: Duration,
        /// Reason given by the last negative check
        last: String,
    },

    /// The caller cancelled the operation
    #[error("operation cancelled")]
    Cancelled,

    /// The session could not be registered with the reaper, so nothing was created
    #[error("reaper registration failed: {reason}")]
    RegistrationFailed {
        /// What went wrong
        reason: String,
    },

    /// The container runtime failed in a way that may succeed when retried
    #[error("{op} failed transiently: {source}")]
    TransientCollaborator {
        /// Operation that failed
        op: &'static str,
        /// Runtime error
        #[source]
        source: container_runtime::Error,
    },

    /// The container runtime rejected an operation
    #[error("{op} {target} failed: {source}")]
    Collaborator {
        /// Operation that failed
        op: &'static str,
        /// Container id, name or image the operation was about
        target: String,
        /// Runtime error
        #[source]
        source: container_runtime::Error,
    },

    /// Invalid request or environment
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The readiness strategy reported that the container can never become ready
    #[error("readiness check failed: {0}")]
    Strategy(String),

    /// The container started but did not become ready. It is left in place so
    /// it can still be inspected and terminated.
    #[error("container {} failed to start: {source}", .container.id())]
    StartFailed {
        /// The container that failed to become ready
        container: Container,
        /// Why it failed
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Wrap a runtime error with the operation and target it belongs to
    pub(crate) fn runtime(
        op: &'static str,
        target: impl Into<String>,
    ) -> impl FnOnce(container_runtime::Error) -> Self {
        let target = target.into();
        move |source| match source {
            container_runtime::Error::NotFound(message) => {
                Error::NotFound(format!("{} {}: {}", op, target, message))
            }
            source if source.is_transient() => Error::TransientCollaborator { op, source },
            source => Error::Collaborator { op, target, source },
        }
    }

    /// Whether the target of the operation does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Whether the runtime reported a conflict, e.g. a container name in use
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Collaborator { source, .. } if source.is_conflict())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
