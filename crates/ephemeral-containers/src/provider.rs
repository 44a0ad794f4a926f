//! Container providers

use crate::background::{self, PinnedRuntime};
use crate::config::ProviderConfig;
use crate::container::Container;
use crate::error::{Error, Result};
use crate::host::resolve_daemon_host;
use crate::reaper::ReaperConnection;
use crate::request::ContainerRequest;
use crate::session::{
    LABEL_REAP, LABEL_REAPER, LABEL_SESSION_ID, SessionId, labels_for, merge_labels,
    reaper_container_name, reaper_filter,
};
use crate::wait::{for_listening_port, wait_until_ready};
use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use container_reaper::Filter;
use container_runtime::{
    ContainerRuntime, ContainerSpec, ContainerSummary, DockerRuntime, ListFilter, RegistryAuth,
};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{Mutex, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const REAPER_PORT: &str = "8080/tcp";

/// Creates and finds containers for a session
#[async_trait]
pub trait ContainerProvider: Send + Sync {
    /// Create a container without starting it
    async fn create_container(&self, request: ContainerRequest) -> Result<Container>;

    /// Create a container and start it, waiting for its readiness strategy
    async fn run_container(&self, request: ContainerRequest) -> Result<Container>;

    /// Adopt an existing container by name
    async fn create_from_existing(&self, name: &str) -> Result<Container>;

    /// Whether a container with exactly this name exists
    async fn container_exists(&self, name: &str) -> Result<bool>;

    /// Containers of this provider's session; stopped ones too when `all`
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>>;

    /// Host name under which published ports are reachable
    async fn daemon_host(&self) -> Result<String>;
}

struct ProviderInner {
    runtime: Arc<dyn ContainerRuntime>,
    config: ProviderConfig,
    session: SessionId,
    host: OnceCell<String>,
    reaper: Mutex<Option<Arc<ReaperConnection>>>,
    // runtime that owns the reaper socket; the caller's when unset
    io: Option<Handle>,
}

/// Provider backed by a [`ContainerRuntime`], normally the local Docker daemon.
///
/// Clones share the runtime client, the resolved host and the reaper
/// connection. The reaper connection stays open as long as the provider or
/// any container created from it is alive.
///
/// Sockets are tied to the runtime that opened them. A provider used from
/// more than one runtime must be [`detached`](Self::detached).
#[derive(Clone)]
pub struct DockerProvider {
    inner: Arc<ProviderInner>,
}

impl fmt::Debug for DockerProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DockerProvider")
            .field("daemon", &self.inner.runtime.daemon_host())
            .field("session", &self.inner.session)
            .field("detached", &self.inner.io.is_some())
            .finish()
    }
}

impl DockerProvider {
    /// Connect to the local Docker daemon, configured from the environment,
    /// in the process-wide session
    pub fn new() -> Result<Self> {
        let config = ProviderConfig::from_env()?;
        let runtime = DockerRuntime::connect().map_err(|e| {
            Error::Configuration(format!("cannot connect to the Docker daemon: {}", e))
        })?;
        Ok(Self::with_runtime(Arc::new(runtime), config))
    }

    /// Use `runtime` in the process-wide session
    pub fn with_runtime(runtime: Arc<dyn ContainerRuntime>, config: ProviderConfig) -> Self {
        Self::build(runtime, config, SessionId::process(), None)
    }

    /// A provider for a separate session on the same runtime and config.
    ///
    /// The new provider has its own reaper connection.
    pub fn with_session(&self, session: SessionId) -> Self {
        Self::build(
            self.inner.runtime.clone(),
            self.inner.config.clone(),
            session,
            self.inner.io.clone(),
        )
    }

    /// The same session with every daemon call and the reaper connection
    /// driven by a background runtime.
    ///
    /// The result keeps working after the runtime it was created on shuts
    /// down, so it can be shared by tests that each run their own runtime.
    /// Containers created before detaching stay with the original provider.
    pub fn detached(&self) -> Result<Self> {
        if self.inner.io.is_some() {
            return Ok(self.clone());
        }
        let handle = background::handle()?;
        let runtime = PinnedRuntime::new(self.inner.runtime.clone(), handle.clone());
        Ok(Self::build(
            Arc::new(runtime),
            self.inner.config.clone(),
            self.inner.session,
            Some(handle),
        ))
    }

    fn build(
        runtime: Arc<dyn ContainerRuntime>,
        config: ProviderConfig,
        session: SessionId,
        io: Option<Handle>,
    ) -> Self {
        Self {
            inner: Arc::new(ProviderInner {
                runtime,
                config,
                session,
                host: OnceCell::new(),
                reaper: Mutex::new(None),
                io,
            }),
        }
    }

    /// Session of every container created here
    pub fn session_id(&self) -> SessionId {
        self.inner.session
    }

    /// Active configuration
    pub fn config(&self) -> &ProviderConfig {
        &self.inner.config
    }

    pub(crate) fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.inner.runtime
    }

    /// Host name for published ports, resolved once
    pub(crate) async fn host_name(&self) -> Result<String> {
        self.inner
            .host
            .get_or_try_init(|| async {
                let host = resolve_daemon_host(
                    self.inner.runtime.daemon_host(),
                    self.inner.config.host_override.as_deref(),
                )?;
                debug!(host = %host, "Resolved container host");
                Ok::<_, Error>(host)
            })
            .await
            .cloned()
    }

    /// The session's reaper connection, confirmed alive.
    ///
    /// An open connection re-sends the session filter and waits for the
    /// acknowledgement; the reaper keeps a single copy of repeated filters.
    /// A connection that fails this is dropped and the reaper engaged again,
    /// which starts a new sidecar if the old one has already swept. Callers
    /// queue behind one attempt at a time; a failed attempt is retried by the
    /// next caller.
    async fn reaper(&self) -> Result<Arc<ReaperConnection>> {
        let session = self.inner.session;
        let mut slot = self.inner.reaper.lock().await;

        if let Some(connection) = slot.clone() {
            match self.register_on(connection.clone(), reaper_filter(session)).await {
                Ok(()) => return Ok(connection),
                Err(e) => {
                    warn!(
                        addr = %connection.addr(),
                        session = %session,
                        error = %e,
                        "Reaper connection lost, engaging the reaper again"
                    );
                    *slot = None;
                }
            }
        }

        let connection = self.engage_reaper().await?;
        *slot = Some(connection.clone());
        Ok(connection)
    }

    /// Register `filter` over the session's live reaper connection
    pub(crate) async fn register_with_reaper(&self, filter: Filter) -> Result<()> {
        let connection = self.reaper().await?;
        self.register_on(connection, filter).await
    }

    async fn register_on(&self, connection: Arc<ReaperConnection>, filter: Filter) -> Result<()> {
        self.reaper_io(async move { connection.register(&filter).await }).await
    }

    /// Run reaper socket I/O on the runtime that owns the socket
    async fn reaper_io<F, T>(&self, task: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        match &self.inner.io {
            None => task.await,
            Some(handle) => background::run_on(handle, task)
                .await
                .map_err(|reason| Error::RegistrationFailed { reason })?,
        }
    }

    async fn engage_reaper(&self) -> Result<Arc<ReaperConnection>> {
        let config = &self.inner.config;
        if config.reaper_disabled {
            return Err(Error::RegistrationFailed {
                reason: "the reaper is disabled".to_string(),
            });
        }

        let addr = match &config.reaper_addr {
            Some(addr) => addr.clone(),
            None => self.start_reaper_sidecar().await.map_err(|e| match e {
                Error::RegistrationFailed { .. } | Error::Cancelled => e,
                other => Error::RegistrationFailed {
                    reason: format!("cannot start the reaper: {}", other),
                },
            })?,
        };

        let ack_timeout = config.reaper_ack_timeout;
        let target = addr.clone();
        let connection = Arc::new(
            self.reaper_io(async move { ReaperConnection::connect(&target, ack_timeout).await })
                .await?,
        );
        self.register_on(connection.clone(), reaper_filter(self.inner.session)).await?;
        info!(addr = %addr, session = %self.inner.session, "Session registered with reaper");
        Ok(connection)
    }

    /// Start, or join, the session's reaper sidecar and return its address
    async fn start_reaper_sidecar(&self) -> Result<String> {
        let config = &self.inner.config;
        let session = self.inner.session;
        let name = reaper_container_name(session);

        let mut request = ContainerRequest::new(config.reaper_image.clone())
            .with_name(name.clone())
            .with_exposed_port(REAPER_PORT)
            .with_bind(config.docker_socket.clone(), "/var/run/docker.sock")
            .with_label(LABEL_REAPER, "true")
            .skip_reaper();
        request.privileged = config.reaper_privileged;

        let sidecar = match self.create_unguarded(request).await {
            Ok(sidecar) => sidecar,
            Err(e) if e.is_conflict() => {
                debug!(name = %name, "Reaper sidecar already exists, joining it");
                self.create_from_existing(&name).await?
            }
            Err(e) => return Err(e),
        };
        sidecar.start().await?;
        // a joined sidecar may still be starting, so wait either way
        let listening =
            for_listening_port(REAPER_PORT).with_startup_timeout(Duration::from_secs(30));
        wait_until_ready(&listening, &sidecar, &CancellationToken::new()).await?;

        let addr = format!(
            "{}:{}",
            self.host_name().await?,
            sidecar.mapped_port(REAPER_PORT).await?
        );
        info!(container_id = %sidecar.id(), addr = %addr, "Reaper sidecar running");
        Ok(addr)
    }

    /// Make sure `image` is available, pulling it with retries on transient
    /// failures
    async fn ensure_image(&self, image: &str, auth: Option<&RegistryAuth>) -> Result<()> {
        let runtime = &self.inner.runtime;
        if runtime
            .image_exists(image)
            .await
            .map_err(Error::runtime("inspect image", image))?
        {
            return Ok(());
        }

        info!(image = %image, "Pulling image");
        (|| async { runtime.pull_image(image, auth).await })
            .retry(
                ExponentialBuilder::default()
                    .with_min_delay(Duration::from_millis(500))
                    .with_max_delay(Duration::from_secs(10))
                    .with_max_times(self.inner.config.pull_max_retries),
            )
            .when(|e| e.is_transient())
            .notify(|e, delay| {
                warn!(image = %image, error = %e, delay = ?delay, "Image pull failed, retrying");
            })
            .await
            .map_err(Error::runtime("pull", image))
    }

    async fn create_spec(
        &self,
        spec: ContainerSpec,
        request: &ContainerRequest,
        guarded: bool,
    ) -> Result<Container> {
        self.ensure_image(&spec.image, request.registry_auth.as_ref())
            .await?;

        let id = self
            .inner
            .runtime
            .create(&spec)
            .await
            .map_err(Error::runtime("create", spec.name.as_deref().unwrap_or(&spec.image)))?;
        info!(
            container_id = %id,
            image = %spec.image,
            session = %self.inner.session,
            guarded,
            "Created container"
        );
        Ok(Container::new(
            id,
            self.clone(),
            request.wait_for.clone(),
            guarded,
        ))
    }

    async fn create_unguarded(&self, request: ContainerRequest) -> Result<Container> {
        let mut spec = request.to_spec()?;
        merge_labels(&mut spec.labels, labels_for(self.inner.session, false));
        self.create_spec(spec, &request, false).await
    }
}

#[async_trait]
impl ContainerProvider for DockerProvider {
    async fn create_container(&self, request: ContainerRequest) -> Result<Container> {
        let guarded = !request.skip_reaper && !self.inner.config.reaper_disabled;
        if !guarded {
            return self.create_unguarded(request).await;
        }

        let mut spec = request.to_spec()?;
        // the session must be registered before anything it covers exists
        self.reaper().await?;
        merge_labels(&mut spec.labels, labels_for(self.inner.session, true));
        self.create_spec(spec, &request, true).await
    }

    async fn run_container(&self, request: ContainerRequest) -> Result<Container> {
        let container = self.create_container(request).await?;
        container.start().await?;
        Ok(container)
    }

    async fn create_from_existing(&self, name: &str) -> Result<Container> {
        let inspection = self
            .inner
            .runtime
            .inspect(name)
            .await
            .map_err(Error::runtime("inspect", name))?;

        let guarded = inspection.labels.get(LABEL_SESSION_ID)
            == Some(&self.inner.session.to_string())
            && inspection.labels.contains_key(LABEL_REAP);
        debug!(container_id = %inspection.id, name = %name, guarded, "Adopted existing container");
        Ok(Container::new(inspection.id, self.clone(), None, guarded))
    }

    async fn container_exists(&self, name: &str) -> Result<bool> {
        let name = name.trim_start_matches('/');
        let containers = self
            .inner
            .runtime
            .list(&ListFilter::all().name(name))
            .await
            .map_err(Error::runtime("list", name))?;
        Ok(containers
            .iter()
            .any(|c| c.names.iter().any(|n| n == name)))
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>> {
        let filter = ListFilter {
            all,
            ..Default::default()
        }
        .label(LABEL_SESSION_ID, &self.inner.session.to_string());
        self.inner
            .runtime
            .list(&filter)
            .await
            .map_err(Error::runtime("list", self.inner.session.to_string()))
    }

    async fn daemon_host(&self) -> Result<String> {
        self.host_name().await
    }
}
