//! What callers ask for when creating a container

use crate::error::{Error, Result};
use crate::wait::WaitStrategy;
use container_runtime::{BindMount, ContainerSpec, PortSpec, RegistryAuth};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Description of a container to create
#[derive(Debug, Clone, Default)]
pub struct ContainerRequest {
    /// Image reference, e.g. `postgres:16`
    pub image: String,
    /// Ports to publish: `"80"`, `"80/tcp"`, `"8080:80/tcp"`, `"127.0.0.1:8080:80/udp"`
    pub exposed_ports: Vec<String>,
    /// Environment variables
    pub env: BTreeMap<String, String>,
    /// Extra labels; keys set here are never overwritten
    pub labels: BTreeMap<String, String>,
    /// Host path to container path
    pub binds: BTreeMap<String, String>,
    /// Command, split on whitespace
    pub cmd: String,
    /// Entrypoint override
    pub entrypoint: Vec<String>,
    /// Explicit container name
    pub name: Option<String>,
    /// Readiness condition checked when the container starts
    pub wait_for: Option<Arc<dyn WaitStrategy>>,
    /// Do not register with the session reaper
    pub skip_reaper: bool,
    /// Keep the container after it stops
    pub dont_remove: bool,
    /// Run privileged
    pub privileged: bool,
    /// Credentials for pulling the image
    pub registry_auth: Option<RegistryAuth>,
}

impl ContainerRequest {
    /// Request a container of `image`
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    /// Publish a container port
    pub fn with_exposed_port(mut self, port: impl Into<String>) -> Self {
        self.exposed_ports.push(port.into());
        self
    }

    /// Set an environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Add a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Mount a host path
    pub fn with_bind(mut self, host: impl Into<String>, container: impl Into<String>) -> Self {
        self.binds.insert(host.into(), container.into());
        self
    }

    /// Override the command
    pub fn with_cmd(mut self, cmd: impl Into<String>) -> Self {
        self.cmd = cmd.into();
        self
    }

    /// Override the entrypoint
    pub fn with_entrypoint<I, S>(mut self, entrypoint: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entrypoint = entrypoint.into_iter().map(Into::into).collect();
        self
    }

    /// Name the container
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Wait for `strategy` whenever the container is started
    pub fn wait_for(mut self, strategy: impl WaitStrategy + 'static) -> Self {
        self.wait_for = Some(Arc::new(strategy));
        self
    }

    /// Leave the container out of the session cleanup
    pub fn skip_reaper(mut self) -> Self {
        self.skip_reaper = true;
        self
    }

    /// Keep the container around after it stops
    pub fn dont_remove(mut self) -> Self {
        self.dont_remove = true;
        self
    }

    /// Run the container privileged
    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    /// Pull the image with these credentials
    pub fn with_registry_auth(mut self, auth: RegistryAuth) -> Self {
        self.registry_auth = Some(auth);
        self
    }

    /// Translate into a runtime spec, validating ports on the way
    pub(crate) fn to_spec(&self) -> Result<ContainerSpec> {
        if self.image.trim().is_empty() {
            return Err(Error::Configuration("image must not be empty".to_string()));
        }

        let ports = self
            .exposed_ports
            .iter()
            .map(|port| {
                port.parse::<PortSpec>()
                    .map_err(|e| Error::Configuration(e.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(ContainerSpec {
            image: self.image.clone(),
            name: self.name.clone(),
            env: self.env.clone(),
            labels: self.labels.clone(),
            ports,
            binds: self
                .binds
                .iter()
                .map(|(source, target)| BindMount {
                    source: source.clone(),
                    target: target.clone(),
                })
                .collect(),
            cmd: self.cmd.split_whitespace().map(str::to_string).collect(),
            entrypoint: self.entrypoint.clone(),
            auto_remove: !self.dont_remove,
            privileged: self.privileged,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use container_runtime::Port;

    #[test]
    fn test_to_spec() {
        let spec = ContainerRequest::new("redis:7")
            .with_exposed_port("6379/tcp")
            .with_exposed_port("127.0.0.1:8080:80")
            .with_env("MODE", "test")
            .with_bind("/tmp/data", "/data")
            .with_cmd("redis-server  --appendonly yes")
            .with_entrypoint(["/entrypoint.sh"])
            .to_spec()
            .unwrap();

        assert_eq!(spec.ports[0].port, Port::tcp(6379));
        assert_eq!(spec.ports[1].host_port, Some(8080));
        assert_eq!(spec.cmd, vec!["redis-server", "--appendonly", "yes"]);
        assert_eq!(spec.entrypoint, vec!["/entrypoint.sh"]);
        assert_eq!(spec.binds[0].target, "/data");
        assert!(spec.auto_remove);
        assert!(!spec.privileged);
    }

    #[test]
    fn test_dont_remove_disables_auto_remove() {
        let spec = ContainerRequest::new("redis").dont_remove().to_spec().unwrap();
        assert!(!spec.auto_remove);
    }

    #[test]
    fn test_invalid_requests() {
        assert!(matches!(
            ContainerRequest::new("redis").with_exposed_port("http").to_spec(),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            ContainerRequest::new(" ").to_spec(),
            Err(Error::Configuration(_))
        ));
    }
}
