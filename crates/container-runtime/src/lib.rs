//! Container runtime collaborator
//!
//! This crate hides the container engine behind the [`ContainerRuntime`]
//! trait. The rest of the workspace only ever talks to the trait, so the same
//! lifecycle and cleanup logic runs against a real Docker daemon
//! ([`DockerRuntime`]) or, in tests, against [`MemoryRuntime`].

#![warn(missing_docs)]

pub mod docker;
pub mod error;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
pub mod types;

pub use docker::DockerRuntime;
pub use error::{Error, Result};
#[cfg(any(test, feature = "test-utils"))]
pub use memory::MemoryRuntime;
pub use types::{
    BindMount, ContainerInspection, ContainerSpec, ContainerStatus, ContainerSummary, ListFilter,
    Port, PortBinding, PortMap, PortQuery, PortSpec, Protocol, RegistryAuth, RemoveOptions,
};

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

/// Operations the lifecycle layer needs from a container engine.
///
/// Every call is a single round-trip to the engine; implementations never
/// retry on their own.
#[async_trait]
pub trait ContainerRuntime: Send + Sync + fmt::Debug {
    /// Address of the daemon connection, e.g. `unix:///var/run/docker.sock`
    fn daemon_host(&self) -> &str;

    /// Create a container and return its id
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;

    /// Start a created container
    async fn start(&self, id: &str) -> Result<()>;

    /// Stop a running container, killing it after `timeout`
    async fn stop(&self, id: &str, timeout: Option<Duration>) -> Result<()>;

    /// Remove a container
    async fn remove(&self, id: &str, options: RemoveOptions) -> Result<()>;

    /// Fetch the current state of a container by id or name
    async fn inspect(&self, id: &str) -> Result<ContainerInspection>;

    /// Whether the image is already present locally
    async fn image_exists(&self, image: &str) -> Result<bool>;

    /// Pull an image, returning once the download finished
    async fn pull_image(&self, image: &str, auth: Option<&RegistryAuth>) -> Result<()>;

    /// Snapshot of everything the container wrote to stdout and stderr so far
    async fn logs(&self, id: &str) -> Result<Vec<u8>>;

    /// List containers matching a filter
    async fn list(&self, filter: &ListFilter) -> Result<Vec<ContainerSummary>>;
}
