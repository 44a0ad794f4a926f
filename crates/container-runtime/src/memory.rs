//! In-memory runtime for tests.
//!
//! Behaves like a tiny Docker daemon: names are unique, removal of a running
//! container needs `force`, auto-remove containers disappear when they stop,
//! and host ports are handed out from 32768 upwards. Failure injection and a
//! create hook let tests exercise retry and ordering behaviour.

use crate::ContainerRuntime;
use crate::error::{Error, Result};
use crate::types::{
    ContainerInspection, ContainerSpec, ContainerStatus, ContainerSummary, ListFilter, PortBinding,
    PortMap, RegistryAuth, RemoveOptions,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

const FIRST_EPHEMERAL_PORT: u16 = 32768;

type CreateHook = Arc<dyn Fn(&ContainerSpec) + Send + Sync>;

#[derive(Debug, Clone)]
struct MemoryContainer {
    id: String,
    spec: ContainerSpec,
    status: ContainerStatus,
    ports: PortMap,
    logs: Vec<u8>,
}

impl MemoryContainer {
    fn name(&self) -> String {
        self.spec
            .name
            .clone()
            .unwrap_or_else(|| format!("memory-{}", &self.id[..12]))
    }

    fn inspection(&self) -> ContainerInspection {
        ContainerInspection {
            id: self.id.clone(),
            name: self.name(),
            image: self.spec.image.clone(),
            status: self.status,
            running: self.status == ContainerStatus::Running,
            ports: self.ports.clone(),
            labels: self.spec.labels.clone(),
        }
    }

    fn summary(&self) -> ContainerSummary {
        ContainerSummary {
            id: self.id.clone(),
            names: vec![self.name()],
            image: self.spec.image.clone(),
            labels: self.spec.labels.clone(),
            status: self.status,
        }
    }
}

#[derive(Default)]
struct State {
    next_id: u64,
    next_port: u16,
    containers: BTreeMap<String, MemoryContainer>,
    local_images: HashSet<String>,
    remote_images: HashSet<String>,
    image_logs: HashMap<String, String>,
    exit_on_start: HashSet<String>,
    pull_failures: HashMap<String, usize>,
    pull_attempts: HashMap<String, usize>,
    failing_creates: usize,
    conflicting_removes: usize,
    create_hook: Option<CreateHook>,
}

/// A container runtime that keeps everything in process memory
#[derive(Clone)]
pub struct MemoryRuntime {
    state: Arc<Mutex<State>>,
    daemon_host: String,
}

impl fmt::Debug for MemoryRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRuntime")
            .field("daemon_host", &self.daemon_host)
            .field("containers", &self.state().containers.len())
            .finish()
    }
}

impl Default for MemoryRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRuntime {
    /// Create an empty runtime that pretends to live behind a local socket
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                next_port: FIRST_EPHEMERAL_PORT,
                ..Default::default()
            })),
            daemon_host: "unix:///var/run/docker.sock".to_string(),
        }
    }

    /// Report a different daemon address
    pub fn with_daemon_host(mut self, daemon_host: impl Into<String>) -> Self {
        self.daemon_host = daemon_host.into();
        self
    }

    /// Make an image available locally
    pub fn with_image(self, image: &str) -> Self {
        self.add_image(image);
        self
    }

    /// Make an image available locally
    pub fn add_image(&self, image: &str) {
        self.state().local_images.insert(image.to_string());
    }

    /// Make an image pullable but not yet present locally
    pub fn add_remote_image(&self, image: &str) {
        self.state().remote_images.insert(image.to_string());
    }

    /// Output every container of `image` writes as soon as it starts
    pub fn set_image_logs(&self, image: &str, logs: &str) {
        self.state()
            .image_logs
            .insert(image.to_string(), logs.to_string());
    }

    /// Containers of `image` exit right after starting
    pub fn exit_on_start(&self, image: &str) {
        self.state().exit_on_start.insert(image.to_string());
    }

    /// Fail the next `count` pulls of `image` with a transient error
    pub fn fail_pulls(&self, image: &str, count: usize) {
        self.state().pull_failures.insert(image.to_string(), count);
    }

    /// Number of pull attempts made for `image`
    pub fn pull_attempts(&self, image: &str) -> usize {
        self.state().pull_attempts.get(image).copied().unwrap_or(0)
    }

    /// Fail the next `count` create calls with a daemon error
    pub fn fail_creates(&self, count: usize) {
        self.state().failing_creates = count;
    }

    /// Answer the next `count` remove calls as if another removal were
    /// already in progress
    pub fn conflict_removes(&self, count: usize) {
        self.state().conflicting_removes = count;
    }

    /// Run `hook` at the start of every create call
    pub fn on_create(&self, hook: impl Fn(&ContainerSpec) + Send + Sync + 'static) {
        self.state().create_hook = Some(Arc::new(hook));
    }

    /// Append output to a container's log
    pub fn push_logs(&self, id: &str, logs: &str) {
        if let Some(container) = self.state().containers.get_mut(id) {
            container.logs.extend_from_slice(logs.as_bytes());
        }
    }

    /// Simulate the main process of a container exiting
    pub fn exit(&self, id: &str) {
        let mut state = self.state();
        Self::stop_locked(&mut state, id);
    }

    /// Whether a container with this id still exists
    pub fn contains(&self, id: &str) -> bool {
        self.state().containers.contains_key(id)
    }

    /// Ids of every existing container
    pub fn container_ids(&self) -> Vec<String> {
        self.state().containers.keys().cloned().collect()
    }

    /// Labels a container was created with
    pub fn labels(&self, id: &str) -> Option<BTreeMap<String, String>> {
        self.state()
            .containers
            .get(id)
            .map(|c| c.spec.labels.clone())
    }

    /// Spec a container was created from
    pub fn spec(&self, id: &str) -> Option<ContainerSpec> {
        self.state().containers.get(id).map(|c| c.spec.clone())
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn resolve(state: &State, id_or_name: &str) -> Option<String> {
        if state.containers.contains_key(id_or_name) {
            return Some(id_or_name.to_string());
        }
        state
            .containers
            .values()
            .find(|c| c.name() == id_or_name.trim_start_matches('/'))
            .map(|c| c.id.clone())
    }

    fn stop_locked(state: &mut State, id: &str) {
        let Some(container) = state.containers.get_mut(id) else {
            return;
        };
        if container.status == ContainerStatus::Running {
            container.status = ContainerStatus::Exited;
            for bindings in container.ports.values_mut() {
                bindings.clear();
            }
        }
        if container.spec.auto_remove && container.status == ContainerStatus::Exited {
            debug!(container_id = %id, "Auto-removing stopped container");
            state.containers.remove(id);
        }
    }
}

#[async_trait]
impl ContainerRuntime for MemoryRuntime {
    fn daemon_host(&self) -> &str {
        &self.daemon_host
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let hook = self.state().create_hook.clone();
        if let Some(hook) = hook {
            hook(spec);
        }

        let mut state = self.state();
        if state.failing_creates > 0 {
            state.failing_creates -= 1;
            return Err(Error::Other("injected create failure".to_string()));
        }
        if !state.local_images.contains(&spec.image) {
            return Err(Error::NotFound(format!("No such image: {}", spec.image)));
        }
        if let Some(name) = &spec.name {
            if Self::resolve(&state, name).is_some() {
                return Err(Error::Conflict(format!(
                    "The container name \"/{}\" is already in use",
                    name
                )));
            }
        }

        state.next_id += 1;
        let id = format!("{:064x}", state.next_id);
        let ports = spec
            .ports
            .iter()
            .map(|p| (p.port, Vec::new()))
            .collect::<PortMap>();
        state.containers.insert(
            id.clone(),
            MemoryContainer {
                id: id.clone(),
                spec: spec.clone(),
                status: ContainerStatus::Created,
                ports,
                logs: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        let mut state = self.state();
        let id = Self::resolve(&state, id)
            .ok_or_else(|| Error::NotFound(format!("No such container: {}", id)))?;

        let (specs, image) = {
            let container = &state.containers[&id];
            if container.status == ContainerStatus::Running {
                return Ok(());
            }
            (container.spec.ports.clone(), container.spec.image.clone())
        };

        let mut ports = PortMap::new();
        for spec in specs {
            let host_port = match spec.host_port {
                Some(port) => port,
                None => {
                    let port = state.next_port;
                    state.next_port = state.next_port.wrapping_add(1).max(FIRST_EPHEMERAL_PORT);
                    port
                }
            };
            ports.insert(
                spec.port,
                vec![PortBinding {
                    host_ip: Some(spec.host_ip.unwrap_or_else(|| "0.0.0.0".to_string())),
                    host_port,
                }],
            );
        }

        let initial_logs = state.image_logs.get(&image).cloned();
        let exits = state.exit_on_start.contains(&image);
        if let Some(container) = state.containers.get_mut(&id) {
            container.status = ContainerStatus::Running;
            container.ports = ports;
            if let Some(logs) = initial_logs {
                container.logs.extend_from_slice(logs.as_bytes());
            }
        }
        if exits {
            Self::stop_locked(&mut state, &id);
        }
        Ok(())
    }

    async fn stop(&self, id: &str, _timeout: Option<Duration>) -> Result<()> {
        let mut state = self.state();
        let id = Self::resolve(&state, id)
            .ok_or_else(|| Error::NotFound(format!("No such container: {}", id)))?;
        Self::stop_locked(&mut state, &id);
        Ok(())
    }

    async fn remove(&self, id: &str, options: RemoveOptions) -> Result<()> {
        let mut state = self.state();
        let id = Self::resolve(&state, id)
            .ok_or_else(|| Error::NotFound(format!("No such container: {}", id)))?;
        if state.conflicting_removes > 0 {
            state.conflicting_removes -= 1;
            return Err(Error::Conflict(format!(
                "removal of container {} is already in progress",
                id
            )));
        }
        if state.containers[&id].status == ContainerStatus::Running && !options.force {
            return Err(Error::Conflict(format!(
                "cannot remove running container {}, stop it first or use force",
                id
            )));
        }
        state.containers.remove(&id);
        Ok(())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerInspection> {
        let state = self.state();
        let id = Self::resolve(&state, id)
            .ok_or_else(|| Error::NotFound(format!("No such container: {}", id)))?;
        Ok(state.containers[&id].inspection())
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        Ok(self.state().local_images.contains(image))
    }

    async fn pull_image(&self, image: &str, _auth: Option<&RegistryAuth>) -> Result<()> {
        let mut state = self.state();
        *state.pull_attempts.entry(image.to_string()).or_default() += 1;

        if let Some(remaining) = state.pull_failures.get_mut(image) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::Transient(format!(
                    "registry unavailable while pulling {}",
                    image
                )));
            }
        }
        if !state.remote_images.contains(image) && !state.local_images.contains(image) {
            return Err(Error::NotFound(format!(
                "pull access denied for {}, repository does not exist",
                image
            )));
        }
        state.local_images.insert(image.to_string());
        Ok(())
    }

    async fn logs(&self, id: &str) -> Result<Vec<u8>> {
        let state = self.state();
        let id = Self::resolve(&state, id)
            .ok_or_else(|| Error::NotFound(format!("No such container: {}", id)))?;
        Ok(state.containers[&id].logs.clone())
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<ContainerSummary>> {
        Ok(self
            .state()
            .containers
            .values()
            .map(MemoryContainer::summary)
            .filter(|summary| filter.matches(summary))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Port, PortSpec};

    fn spec(image: &str) -> ContainerSpec {
        ContainerSpec {
            image: image.to_string(),
            ports: vec!["80/tcp".parse::<PortSpec>().unwrap()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_lifecycle_assigns_host_ports() {
        let runtime = MemoryRuntime::new().with_image("nginx");
        let id = runtime.create(&spec("nginx")).await.unwrap();

        let created = runtime.inspect(&id).await.unwrap();
        assert_eq!(created.status, ContainerStatus::Created);
        assert!(created.ports[&Port::tcp(80)].is_empty());

        runtime.start(&id).await.unwrap();
        let running = runtime.inspect(&id).await.unwrap();
        assert!(running.running);
        assert_eq!(running.ports[&Port::tcp(80)][0].host_port, 32768);

        runtime.stop(&id, None).await.unwrap();
        assert_eq!(
            runtime.inspect(&id).await.unwrap().status,
            ContainerStatus::Exited
        );
    }

    #[tokio::test]
    async fn test_remove_requires_force_when_running() {
        let runtime = MemoryRuntime::new().with_image("nginx");
        let id = runtime.create(&spec("nginx")).await.unwrap();
        runtime.start(&id).await.unwrap();

        let err = runtime.remove(&id, RemoveOptions::default()).await.unwrap_err();
        assert!(err.is_conflict());

        runtime
            .remove(
                &id,
                RemoveOptions {
                    force: true,
                    volumes: true,
                },
            )
            .await
            .unwrap();
        assert!(runtime.inspect(&id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_duplicate_names_conflict() {
        let runtime = MemoryRuntime::new().with_image("nginx");
        let mut named = spec("nginx");
        named.name = Some("web".to_string());

        runtime.create(&named).await.unwrap();
        assert!(runtime.create(&named).await.unwrap_err().is_conflict());
        assert_eq!(runtime.inspect("/web").await.unwrap().name, "web");
    }

    #[tokio::test]
    async fn test_auto_remove_on_exit() {
        let runtime = MemoryRuntime::new().with_image("nginx");
        let mut ephemeral = spec("nginx");
        ephemeral.auto_remove = true;

        let id = runtime.create(&ephemeral).await.unwrap();
        runtime.start(&id).await.unwrap();
        runtime.exit(&id);
        assert!(!runtime.contains(&id));
    }

    #[tokio::test]
    async fn test_injected_pull_failures() {
        let runtime = MemoryRuntime::new();
        runtime.add_remote_image("redis:7");
        runtime.fail_pulls("redis:7", 2);

        assert!(runtime.pull_image("redis:7", None).await.unwrap_err().is_transient());
        assert!(runtime.pull_image("redis:7", None).await.unwrap_err().is_transient());
        runtime.pull_image("redis:7", None).await.unwrap();
        assert_eq!(runtime.pull_attempts("redis:7"), 3);
        assert!(runtime.image_exists("redis:7").await.unwrap());

        assert!(runtime.pull_image("missing", None).await.unwrap_err().is_not_found());
    }
}
