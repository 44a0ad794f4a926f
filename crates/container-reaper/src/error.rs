//! Error types for the reaper

use thiserror::Error;

/// Errors raised by the reaper protocol, server and configuration
#[derive(Error, Debug)]
pub enum Error {
    /// A registration line or filter that violates the wire format
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Socket failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure reported by the container runtime
    #[error("runtime error: {0}")]
    Runtime(#[from] container_runtime::Error),

    /// Invalid configuration value
    #[error("configuration error: {0}")]
    Config(String),

    /// YAML configuration parse failure
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON configuration parse failure
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
