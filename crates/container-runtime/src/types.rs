//! Runtime-neutral container types.
//!
//! These types describe what the rest of the workspace needs from a container
//! runtime without tying callers to the Docker API models.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Transport protocol of an exposed port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP (the default when none is given)
    Tcp,
    /// UDP
    Udp,
    /// SCTP
    Sctp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
            Protocol::Sctp => write!(f, "sctp"),
        }
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "sctp" => Ok(Protocol::Sctp),
            other => Err(Error::invalid_port(s, format!("unknown protocol '{}'", other))),
        }
    }
}

fn parse_port_number(spec: &str, raw: &str) -> Result<u16> {
    if raw.contains('-') {
        return Err(Error::invalid_port(spec, "port ranges are not supported"));
    }
    match raw.parse::<u16>() {
        Ok(0) => Err(Error::invalid_port(spec, "port 0 is not a valid port")),
        Ok(port) => Ok(port),
        Err(_) => Err(Error::invalid_port(spec, format!("'{}' is not a port number", raw))),
    }
}

/// A container-side port together with its protocol, e.g. `80/tcp`.
///
/// This is the key of a [`PortMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Port {
    /// Port number inside the container
    pub number: u16,
    /// Transport protocol
    pub protocol: Protocol,
}

impl Port {
    /// Create a TCP port
    pub fn tcp(number: u16) -> Self {
        Self {
            number,
            protocol: Protocol::Tcp,
        }
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.number, self.protocol)
    }
}

impl FromStr for Port {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let query: PortQuery = s.parse()?;
        Ok(Port {
            number: query.number,
            protocol: query.protocol.unwrap_or(Protocol::Tcp),
        })
    }
}

/// A port lookup key where the protocol is optional: `"80"` or `"80/udp"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortQuery {
    /// Port number inside the container
    pub number: u16,
    /// Protocol to require; any protocol matches when `None`
    pub protocol: Option<Protocol>,
}

impl PortQuery {
    /// Whether a mapped port satisfies this query
    pub fn matches(&self, port: &Port) -> bool {
        port.number == self.number && self.protocol.is_none_or(|p| p == port.protocol)
    }
}

impl FromStr for PortQuery {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let (number, protocol) = match trimmed.split_once('/') {
            Some((number, protocol)) => (number, Some(protocol.parse::<Protocol>()?)),
            None => (trimmed, None),
        };
        Ok(PortQuery {
            number: parse_port_number(s, number)?,
            protocol,
        })
    }
}

impl fmt::Display for PortQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.protocol {
            Some(protocol) => write!(f, "{}/{}", self.number, protocol),
            None => write!(f, "{}", self.number),
        }
    }
}

/// A port to expose, in the familiar `[ip:][host_port:]container_port[/proto]` form.
///
/// An absent host port lets the runtime pick a free one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSpec {
    /// Container-side port
    pub port: Port,
    /// Host interface to bind
    pub host_ip: Option<String>,
    /// Fixed host port, or `None` for a runtime-assigned one
    pub host_port: Option<u16>,
}

impl FromStr for PortSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(Error::invalid_port(s, "empty port specification"));
        }

        let (addr, protocol) = match trimmed.rsplit_once('/') {
            Some((addr, protocol)) => (addr, protocol.parse::<Protocol>()?),
            None => (trimmed, Protocol::Tcp),
        };

        let parts: Vec<&str> = addr.split(':').collect();
        let (host_ip, host_port, container_port) = match parts.as_slice() {
            [container] => (None, None, *container),
            [host, container] => (None, Some(*host), *container),
            [ip, host, container] => (Some(*ip), Some(*host), *container),
            _ => return Err(Error::invalid_port(s, "too many ':' separators")),
        };

        let host_port = match host_port {
            Some("") | None => None,
            Some(raw) => Some(parse_port_number(s, raw)?),
        };

        Ok(PortSpec {
            port: Port {
                number: parse_port_number(s, container_port)?,
                protocol,
            },
            host_ip: host_ip.filter(|ip| !ip.is_empty()).map(str::to_string),
            host_port,
        })
    }
}

/// One host-side binding of a container port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    /// Host interface the port is bound on
    pub host_ip: Option<String>,
    /// Host port number
    pub host_port: u16,
}

/// Container ports mapped to their host bindings
pub type PortMap = BTreeMap<Port, Vec<PortBinding>>;

/// A host directory mounted into the container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    /// Path on the host
    pub source: String,
    /// Path inside the container
    pub target: String,
}

/// Credentials for pulling from a private registry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryAuth {
    /// Account name
    pub username: Option<String>,
    /// Account password or token
    pub password: Option<String>,
    /// Registry address, e.g. `ghcr.io`
    pub server_address: Option<String>,
    /// Identity token issued by the registry
    pub identity_token: Option<String>,
}

/// Everything the runtime needs to create a container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Image reference
    pub image: String,
    /// Explicit container name
    pub name: Option<String>,
    /// Environment variables
    pub env: BTreeMap<String, String>,
    /// Labels attached at creation time
    pub labels: BTreeMap<String, String>,
    /// Ports to expose and publish
    pub ports: Vec<PortSpec>,
    /// Bind mounts
    pub binds: Vec<BindMount>,
    /// Command override
    pub cmd: Vec<String>,
    /// Entrypoint override
    pub entrypoint: Vec<String>,
    /// Remove the container as soon as it stops
    pub auto_remove: bool,
    /// Run in privileged mode
    pub privileged: bool,
}

/// Lifecycle status reported by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Created but never started
    Created,
    /// Running
    Running,
    /// Paused
    Paused,
    /// Restarting
    Restarting,
    /// Being removed
    Removing,
    /// Exited
    Exited,
    /// Dead
    Dead,
    /// Anything the runtime reported that we do not model
    Unknown,
}

impl ContainerStatus {
    /// Whether the container can no longer become ready without a restart
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ContainerStatus::Exited | ContainerStatus::Dead | ContainerStatus::Removing
        )
    }
}

impl FromStr for ContainerStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "created" => ContainerStatus::Created,
            "running" => ContainerStatus::Running,
            "paused" => ContainerStatus::Paused,
            "restarting" => ContainerStatus::Restarting,
            "removing" => ContainerStatus::Removing,
            "exited" => ContainerStatus::Exited,
            "dead" => ContainerStatus::Dead,
            _ => ContainerStatus::Unknown,
        })
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContainerStatus::Created => "created",
            ContainerStatus::Running => "running",
            ContainerStatus::Paused => "paused",
            ContainerStatus::Restarting => "restarting",
            ContainerStatus::Removing => "removing",
            ContainerStatus::Exited => "exited",
            ContainerStatus::Dead => "dead",
            ContainerStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Snapshot of a container's runtime state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInspection {
    /// Full container id
    pub id: String,
    /// Container name without the leading `/`
    pub name: String,
    /// Image the container was created from
    pub image: String,
    /// Lifecycle status
    pub status: ContainerStatus,
    /// Whether the main process is running
    pub running: bool,
    /// Published ports
    pub ports: PortMap,
    /// Labels
    pub labels: BTreeMap<String, String>,
}

/// One entry of a container listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    /// Full container id
    pub id: String,
    /// Names without the leading `/`
    pub names: Vec<String>,
    /// Image reference
    pub image: String,
    /// Labels
    pub labels: BTreeMap<String, String>,
    /// Lifecycle status
    pub status: ContainerStatus,
}

/// Filters for listing containers.
///
/// Keys follow the Docker list filter names (`label`, `id`, `name`); values
/// under the same key and across keys must all match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    /// Include stopped containers
    pub all: bool,
    /// Filter name to accepted values
    pub filters: BTreeMap<String, Vec<String>>,
}

impl ListFilter {
    /// Match running and stopped containers
    pub fn all() -> Self {
        Self {
            all: true,
            filters: BTreeMap::new(),
        }
    }

    /// Match only running containers
    pub fn running() -> Self {
        Self::default()
    }

    /// Add a raw filter entry
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.entry(key.into()).or_default().push(value.into());
        self
    }

    /// Require a label with the given value
    pub fn label(self, key: &str, value: &str) -> Self {
        self.with("label", format!("{}={}", key, value))
    }

    /// Require a name containing `name`
    pub fn name(self, name: impl Into<String>) -> Self {
        self.with("name", name)
    }

    /// Require an id starting with `id`
    pub fn id(self, id: impl Into<String>) -> Self {
        self.with("id", id)
    }

    /// Evaluate the filter against a summary the way the Docker daemon does
    pub fn matches(&self, summary: &ContainerSummary) -> bool {
        if !self.all && summary.status != ContainerStatus::Running {
            return false;
        }
        self.filters.iter().all(|(key, values)| {
            values.iter().all(|value| match key.as_str() {
                "label" => match value.split_once('=') {
                    Some((k, v)) => summary.labels.get(k).is_some_and(|actual| actual == v),
                    None => summary.labels.contains_key(value),
                },
                "id" => summary.id.starts_with(value.as_str()),
                "name" => summary.names.iter().any(|n| n.contains(value.as_str())),
                _ => false,
            })
        })
    }
}

/// Options for removing a container
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoveOptions {
    /// Kill the container first if it is running
    pub force: bool,
    /// Also remove anonymous volumes
    pub volumes: bool,
}

/// Strip the `/` prefix the daemon puts in front of container names
pub fn normalize_name(name: &str) -> String {
    name.trim_start_matches('/').to_string()
}
