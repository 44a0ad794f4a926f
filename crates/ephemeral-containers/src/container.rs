//! Handle to a container created through a provider

use crate::error::{Error, Result};
use crate::provider::DockerProvider;
use crate::session::SessionId;
use crate::wait::{WaitStrategy, WaitTarget, wait_until_ready};
use async_trait::async_trait;
use container_reaper::Filter;
use container_runtime::{
    ContainerInspection, ContainerRuntime, Port, PortMap, PortQuery, RemoveOptions,
};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

struct ContainerInner {
    id: String,
    session: SessionId,
    wait_for: Option<Arc<dyn WaitStrategy>>,
    guarded: bool,
    provider: DockerProvider,
    cache: Mutex<Option<Arc<ContainerInspection>>>,
    removed: AtomicBool,
}

/// A container owned by a test session.
///
/// Cloning is cheap and clones share the cached inspection. State-changing
/// calls invalidate the cache; accessors fill it on first use.
#[derive(Clone)]
pub struct Container {
    inner: Arc<ContainerInner>,
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.inner.id)
            .field("session", &self.inner.session)
            .field("guarded", &self.inner.guarded)
            .field("wait_for", &self.inner.wait_for)
            .finish()
    }
}

impl Container {
    pub(crate) fn new(
        id: String,
        provider: DockerProvider,
        wait_for: Option<Arc<dyn WaitStrategy>>,
        guarded: bool,
    ) -> Self {
        Self {
            inner: Arc::new(ContainerInner {
                id,
                session: provider.session_id(),
                wait_for,
                guarded,
                provider,
                cache: Mutex::new(None),
                removed: AtomicBool::new(false),
            }),
        }
    }

    /// Runtime id
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Session the container belongs to
    pub fn session_id(&self) -> SessionId {
        self.inner.session
    }

    /// Whether the session reaper will remove this container
    pub fn is_guarded(&self) -> bool {
        self.inner.guarded
    }

    /// Readiness condition checked on start
    pub fn wait_strategy(&self) -> Option<&Arc<dyn WaitStrategy>> {
        self.inner.wait_for.as_ref()
    }

    fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        self.inner.provider.runtime()
    }

    fn short_id(&self) -> &str {
        &self.inner.id[..self.inner.id.len().min(12)]
    }

    fn ensure_present(&self) -> Result<()> {
        if self.inner.removed.load(Ordering::SeqCst) {
            return Err(Error::NotFound(format!(
                "container {} has been removed",
                self.short_id()
            )));
        }
        Ok(())
    }

    fn cached(&self) -> Option<Arc<ContainerInspection>> {
        self.inner
            .cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn store(&self, inspection: Option<Arc<ContainerInspection>>) {
        *self
            .inner
            .cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = inspection;
    }

    async fn inspection(&self) -> Result<Arc<ContainerInspection>> {
        self.ensure_present()?;
        if let Some(inspection) = self.cached() {
            return Ok(inspection);
        }

        let inspection = Arc::new(
            self.runtime()
                .inspect(self.id())
                .await
                .map_err(Error::runtime("inspect", self.id()))?,
        );
        self.store(Some(inspection.clone()));
        Ok(inspection)
    }

    /// Drop the cached inspection
    pub fn reset_cache(&self) {
        self.store(None);
    }

    /// Container name without the leading `/`
    pub async fn name(&self) -> Result<String> {
        Ok(self.inspection().await?.name.clone())
    }

    /// Image the container runs
    pub async fn image(&self) -> Result<String> {
        Ok(self.inspection().await?.image.clone())
    }

    /// Host name under which published ports are reachable
    pub async fn host(&self) -> Result<String> {
        self.ensure_present()?;
        self.inner.provider.host_name().await
    }

    /// Published ports and their host bindings
    pub async fn ports(&self) -> Result<PortMap> {
        Ok(self.inspection().await?.ports.clone())
    }

    /// Host port bound to container port `port` (`"80"` or `"80/tcp"`).
    ///
    /// Without a protocol any protocol matches; with one it must match
    /// exactly.
    pub async fn mapped_port(&self, port: &str) -> Result<u16> {
        let query: PortQuery = port
            .parse()
            .map_err(|e: container_runtime::Error| Error::Configuration(e.to_string()))?;
        let inspection = self.inspection().await?;

        inspection
            .ports
            .iter()
            .filter(|(mapped, _)| query.matches(mapped))
            .find_map(|(_, bindings)| bindings.first())
            .map(|binding| binding.host_port)
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "port {} is not mapped for container {}",
                    query,
                    self.short_id()
                ))
            })
    }

    /// `scheme://host:port` for the lowest published port, or `host:port`
    /// when `scheme` is empty
    pub async fn endpoint(&self, scheme: &str) -> Result<String> {
        let inspection = self.inspection().await?;
        let port = inspection
            .ports
            .iter()
            .find(|(_, bindings)| !bindings.is_empty())
            .map(|(port, _)| port.to_string())
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "container {} has no published ports",
                    self.short_id()
                ))
            })?;
        self.port_endpoint(&port, scheme).await
    }

    /// `scheme://host:port` for container port `port`, or `host:port` when
    /// `scheme` is empty
    pub async fn port_endpoint(&self, port: &str, scheme: &str) -> Result<String> {
        let host = self.host().await?;
        let host_port = self.mapped_port(port).await?;
        if scheme.is_empty() {
            Ok(format!("{}:{}", host, host_port))
        } else {
            Ok(format!("{}://{}:{}", scheme, host, host_port))
        }
    }

    /// Freshly fetched state
    pub async fn state(&self) -> Result<Arc<ContainerInspection>> {
        self.reset_cache();
        self.inspection().await
    }

    /// Whether the main process is running, freshly fetched
    pub async fn is_running(&self) -> Result<bool> {
        Ok(self.state().await?.running)
    }

    /// Everything the container logged so far
    pub async fn logs(&self) -> Result<Vec<u8>> {
        self.ensure_present()?;
        self.runtime()
            .logs(self.id())
            .await
            .map_err(Error::runtime("logs", self.id()))
    }

    /// Start the container and wait for its readiness strategy
    pub async fn start(&self) -> Result<()> {
        self.start_with_cancel(&CancellationToken::new()).await
    }

    /// Start the container and wait for its readiness strategy, giving up
    /// with [`Error::Cancelled`] when `cancel` fires
    pub async fn start_with_cancel(&self, cancel: &CancellationToken) -> Result<()> {
        self.ensure_present()?;
        self.runtime()
            .start(self.id())
            .await
            .map_err(Error::runtime("start", self.id()))?;
        self.reset_cache();
        info!(container_id = %self.short_id(), session = %self.inner.session, "Started container");

        match self.wait_until_ready(cancel).await {
            Ok(()) => Ok(()),
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(source) => Err(Error::StartFailed {
                container: self.clone(),
                source: Box::new(source),
            }),
        }
    }

    /// Run the readiness strategy again; succeeds at once without one
    pub async fn wait_until_ready(&self, cancel: &CancellationToken) -> Result<()> {
        let Some(strategy) = &self.inner.wait_for else {
            return Ok(());
        };
        debug!(container_id = %self.short_id(), strategy = ?strategy, "Waiting for container");
        wait_until_ready(strategy.as_ref(), self, cancel).await
    }

    /// Stop the container, killing it after `timeout`
    pub async fn stop(&self, timeout: Option<Duration>) -> Result<()> {
        self.ensure_present()?;
        let result = self
            .runtime()
            .stop(self.id(), timeout)
            .await
            .map_err(Error::runtime("stop", self.id()));
        self.reset_cache();
        result?;
        info!(container_id = %self.short_id(), "Stopped container");
        Ok(())
    }

    /// Remove the container; `force` kills it first if it is running
    pub async fn remove(&self, force: bool) -> Result<()> {
        self.ensure_present()?;
        let options = RemoveOptions {
            force,
            volumes: false,
        };
        self.runtime()
            .remove(self.id(), options)
            .await
            .map_err(Error::runtime("remove", self.id()))?;
        self.mark_removed();
        info!(container_id = %self.short_id(), "Removed container");
        Ok(())
    }

    /// Kill and remove the container with its volumes. A container that is
    /// already gone, or already being removed, counts as terminated.
    pub async fn terminate(&self) -> Result<()> {
        if self.inner.removed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let options = RemoveOptions {
            force: true,
            volumes: true,
        };
        match self.runtime().remove(self.id(), options).await {
            Ok(()) => info!(container_id = %self.short_id(), "Terminated container"),
            // a concurrent removal or auto-remove got there first
            Err(e) if e.is_not_found() || e.is_conflict() => {
                debug!(container_id = %self.short_id(), error = %e, "Container already gone");
            }
            Err(e) => return Err(Error::runtime("terminate", self.id())(e)),
        }
        self.mark_removed();
        Ok(())
    }

    /// Hand a container created with `skip_reaper` to the session reaper after all
    pub async fn release_to_reaper(&self) -> Result<()> {
        self.ensure_present()?;
        if self.inner.guarded {
            return Ok(());
        }
        self.inner
            .provider
            .register_with_reaper(Filter::new().id(self.id()))
            .await?;
        info!(container_id = %self.short_id(), "Released container to the reaper");
        Ok(())
    }

    fn mark_removed(&self) {
        self.inner.removed.store(true, Ordering::SeqCst);
        self.reset_cache();
    }
}

#[async_trait]
impl WaitTarget for Container {
    fn id(&self) -> &str {
        Container::id(self)
    }

    async fn host(&self) -> Result<String> {
        Container::host(self).await
    }

    async fn mapped_port(&self, port: &str) -> Result<u16> {
        Container::mapped_port(self, port).await
    }

    async fn exposed_ports(&self) -> Result<Vec<Port>> {
        Ok(self
            .inspection()
            .await?
            .ports
            .iter()
            .filter(|(_, bindings)| !bindings.is_empty())
            .map(|(port, _)| *port)
            .collect())
    }

    async fn status(&self) -> Result<container_runtime::ContainerStatus> {
        Ok(self.inspection().await?.status)
    }

    async fn logs(&self) -> Result<Vec<u8>> {
        Container::logs(self).await
    }

    fn reset_cache(&self) {
        Container::reset_cache(self);
    }
}
