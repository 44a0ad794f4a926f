//! Provider configuration

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Overrides the host name under which containers are reached
pub const ENV_HOST: &str = "EPHEMERAL_HOST";
/// `true` or `1` turns the reaper off for every container
pub const ENV_REAPER_DISABLED: &str = "EPHEMERAL_REAPER_DISABLED";
/// Image of the reaper sidecar
pub const ENV_REAPER_IMAGE: &str = "EPHEMERAL_REAPER_IMAGE";
/// Address of an already running reaper; no sidecar is started when set
pub const ENV_REAPER_ADDR: &str = "EPHEMERAL_REAPER_ADDR";
/// `true` or `1` runs the reaper sidecar privileged
pub const ENV_REAPER_PRIVILEGED: &str = "EPHEMERAL_REAPER_PRIVILEGED";
/// Docker socket path mounted into the reaper sidecar
pub const ENV_DOCKER_SOCKET: &str = "EPHEMERAL_DOCKER_SOCKET";

/// Default reaper image; speaks the same registration protocol
pub const DEFAULT_REAPER_IMAGE: &str = "testcontainers/ryuk:0.5.1";

/// Settings of a [`DockerProvider`](crate::DockerProvider)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Host name to use instead of the one derived from the daemon address
    pub host_override: Option<String>,
    /// Never start or register with a reaper
    pub reaper_disabled: bool,
    /// Reaper sidecar image
    pub reaper_image: String,
    /// Connect to this reaper (`host:port`) instead of starting a sidecar
    pub reaper_addr: Option<String>,
    /// Run the sidecar privileged, needed on some SELinux hosts
    pub reaper_privileged: bool,
    /// How long to wait for the reaper to acknowledge a registration
    pub reaper_ack_timeout: Duration,
    /// Attempts after the first failed image pull
    pub pull_max_retries: usize,
    /// Docker socket on the host, mounted into the sidecar
    pub docker_socket: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            host_override: None,
            reaper_disabled: false,
            reaper_image: DEFAULT_REAPER_IMAGE.to_string(),
            reaper_addr: None,
            reaper_privileged: false,
            reaper_ack_timeout: Duration::from_secs(10),
            pull_max_retries: 5,
            docker_socket: "/var/run/docker.sock".to_string(),
        }
    }
}

impl ProviderConfig {
    /// Defaults overridden by the `EPHEMERAL_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(host) = non_empty(ENV_HOST) {
            config.host_override = Some(host);
        }
        if let Some(raw) = non_empty(ENV_REAPER_DISABLED) {
            config.reaper_disabled = parse_flag(ENV_REAPER_DISABLED, &raw)?;
        }
        if let Some(image) = non_empty(ENV_REAPER_IMAGE) {
            config.reaper_image = image;
        }
        if let Some(addr) = non_empty(ENV_REAPER_ADDR) {
            config.reaper_addr = Some(addr);
        }
        if let Some(raw) = non_empty(ENV_REAPER_PRIVILEGED) {
            config.reaper_privileged = parse_flag(ENV_REAPER_PRIVILEGED, &raw)?;
        }
        if let Some(socket) = non_empty(ENV_DOCKER_SOCKET) {
            config.docker_socket = socket;
        }
        Ok(config)
    }
}

fn parse_flag(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        other => Err(Error::Configuration(format!(
            "{} must be true or false, got '{}'",
            key, other
        ))),
    }
}
