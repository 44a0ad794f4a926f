//! A runtime for I/O that must outlive the caller's runtime.
//!
//! Sockets and pooled HTTP connections belong to the runtime they were
//! opened on and break once it shuts down. A provider shared across runtimes
//! (one per `#[tokio::test]`, typically) opens them here instead: a
//! current-thread runtime on a dedicated thread that lives until the process
//! exits.

use crate::error::{Error, Result};
use async_trait::async_trait;
use container_runtime::{
    ContainerInspection, ContainerRuntime, ContainerSpec, ContainerSummary, ListFilter,
    RegistryAuth, RemoveOptions,
};
use std::future::Future;
use std::sync::{Arc, LazyLock, mpsc};
use std::thread;
use std::time::Duration;
use tokio::runtime::{Builder, Handle};
use tracing::debug;

static BACKGROUND: LazyLock<std::result::Result<Handle, String>> = LazyLock::new(start);

fn start() -> std::result::Result<Handle, String> {
    let (handle_tx, handle_rx) = mpsc::channel();
    thread::Builder::new()
        .name("ephemeral-io".to_string())
        .spawn(move || match Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => {
                let _ = handle_tx.send(Ok(runtime.handle().clone()));
                runtime.block_on(std::future::pending::<()>());
            }
            Err(e) => {
                let _ = handle_tx.send(Err(e.to_string()));
            }
        })
        .map_err(|e| format!("failed to spawn the I/O thread: {}", e))?;

    let handle = handle_rx
        .recv()
        .map_err(|_| "the I/O thread exited during startup".to_string())??;
    debug!("Background I/O runtime started");
    Ok(handle)
}

/// Handle of the process-wide background runtime, started on first use
pub(crate) fn handle() -> Result<Handle> {
    BACKGROUND.as_ref().cloned().map_err(|e| {
        Error::Configuration(format!("cannot start the background runtime: {}", e))
    })
}

/// Run `task` on `handle` and wait for it from any runtime
pub(crate) async fn run_on<F, T>(handle: &Handle, task: F) -> std::result::Result<T, String>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    handle.spawn(task).await.map_err(|e| e.to_string())
}

/// A [`ContainerRuntime`] whose calls all run on one runtime, whichever
/// runtime awaits them
#[derive(Debug)]
pub(crate) struct PinnedRuntime {
    inner: Arc<dyn ContainerRuntime>,
    handle: Handle,
}

impl PinnedRuntime {
    pub(crate) fn new(inner: Arc<dyn ContainerRuntime>, handle: Handle) -> Self {
        Self { inner, handle }
    }

    async fn call<F, T>(&self, op: &str, call: F) -> container_runtime::Result<T>
    where
        F: Future<Output = container_runtime::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        run_on(&self.handle, call).await.map_err(|e| {
            container_runtime::Error::Other(format!("{} did not complete: {}", op, e))
        })?
    }
}

#[async_trait]
impl ContainerRuntime for PinnedRuntime {
    fn daemon_host(&self) -> &str {
        self.inner.daemon_host()
    }

    async fn create(&self, spec: &ContainerSpec) -> container_runtime::Result<String> {
        let (inner, spec) = (self.inner.clone(), spec.clone());
        self.call("create", async move { inner.create(&spec).await }).await
    }

    async fn start(&self, id: &str) -> container_runtime::Result<()> {
        let (inner, id) = (self.inner.clone(), id.to_string());
        self.call("start", async move { inner.start(&id).await }).await
    }

    async fn stop(&self, id: &str, timeout: Option<Duration>) -> container_runtime::Result<()> {
        let (inner, id) = (self.inner.clone(), id.to_string());
        self.call("stop", async move { inner.stop(&id, timeout).await }).await
    }

    async fn remove(&self, id: &str, options: RemoveOptions) -> container_runtime::Result<()> {
        let (inner, id) = (self.inner.clone(), id.to_string());
        self.call("remove", async move { inner.remove(&id, options).await }).await
    }

    async fn inspect(&self, id: &str) -> container_runtime::Result<ContainerInspection> {
        let (inner, id) = (self.inner.clone(), id.to_string());
        self.call("inspect", async move { inner.inspect(&id).await }).await
    }

    async fn image_exists(&self, image: &str) -> container_runtime::Result<bool> {
        let (inner, image) = (self.inner.clone(), image.to_string());
        self.call("image inspect", async move { inner.image_exists(&image).await }).await
    }

    async fn pull_image(
        &self,
        image: &str,
        auth: Option<&RegistryAuth>,
    ) -> container_runtime::Result<()> {
        let (inner, image, auth) = (self.inner.clone(), image.to_string(), auth.cloned());
        self.call("pull", async move { inner.pull_image(&image, auth.as_ref()).await }).await
    }

    async fn logs(&self, id: &str) -> container_runtime::Result<Vec<u8>> {
        let (inner, id) = (self.inner.clone(), id.to_string());
        self.call("logs", async move { inner.logs(&id).await }).await
    }

    async fn list(&self, filter: &ListFilter) -> container_runtime::Result<Vec<ContainerSummary>> {
        let (inner, filter) = (self.inner.clone(), filter.clone());
        self.call("list", async move { inner.list(&filter).await }).await
    }
}
