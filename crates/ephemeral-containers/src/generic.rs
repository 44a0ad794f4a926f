//! One-call entry points

use crate::container::Container;
use crate::error::{Error, Result};
use crate::provider::{ContainerProvider, DockerProvider};
use crate::request::ContainerRequest;
use tokio::sync::OnceCell;
use tracing::info;

static DOCKER_PROVIDER: OnceCell<DockerProvider> = OnceCell::const_new();

/// Which provider backs a [`GenericContainerRequest`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProviderType {
    /// The local Docker daemon
    #[default]
    Docker,
}

impl ProviderType {
    /// The process-wide provider of this type, created on first use.
    ///
    /// It is [detached](DockerProvider::detached), so it keeps working for
    /// callers on any runtime, including after the first caller's runtime
    /// shut down.
    pub async fn provider(&self) -> Result<DockerProvider> {
        match self {
            ProviderType::Docker => DOCKER_PROVIDER
                .get_or_try_init(|| async { DockerProvider::new()?.detached() })
                .await
                .cloned(),
        }
    }
}

/// A container request plus how to fulfil it
#[derive(Debug, Clone, Default)]
pub struct GenericContainerRequest {
    /// The container to create
    pub request: ContainerRequest,
    /// Start it (and wait for readiness) before returning
    pub started: bool,
    /// Provider to use
    pub provider: ProviderType,
}

impl From<ContainerRequest> for GenericContainerRequest {
    fn from(request: ContainerRequest) -> Self {
        Self {
            request,
            ..Default::default()
        }
    }
}

impl GenericContainerRequest {
    /// Start the container before returning
    pub fn started(mut self) -> Self {
        self.started = true;
        self
    }
}

/// Create, and optionally start, a container with the process-wide provider
pub async fn generic_container(request: GenericContainerRequest) -> Result<Container> {
    let provider = request.provider.provider().await?;
    generic_container_on(&provider, request).await
}

/// Create, and optionally start, a container with `provider`
pub async fn generic_container_on<P>(
    provider: &P,
    request: GenericContainerRequest,
) -> Result<Container>
where
    P: ContainerProvider + ?Sized,
{
    if request.started {
        provider.run_container(request.request).await
    } else {
        provider.create_container(request.request).await
    }
}

/// Reuse the container named in the request if it exists, otherwise create it.
///
/// A reused container is started when `started` is set and it is not running.
pub async fn use_existing<P>(provider: &P, request: GenericContainerRequest) -> Result<Container>
where
    P: ContainerProvider + ?Sized,
{
    let Some(name) = request.request.name.clone() else {
        return Err(Error::Configuration(
            "reusing a container requires a name".to_string(),
        ));
    };

    if !provider.container_exists(&name).await? {
        return generic_container_on(provider, request).await;
    }

    let container = provider.create_from_existing(&name).await?;
    info!(container_id = %container.id(), name = %name, "Reusing existing container");
    if request.started && !container.is_running().await? {
        container.start().await?;
    }
    Ok(container)
}
