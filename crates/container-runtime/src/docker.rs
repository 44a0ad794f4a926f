//! Docker Engine backend built on bollard.

use crate::error::Result;
use crate::types::{
    ContainerInspection, ContainerSpec, ContainerStatus, ContainerSummary, ListFilter, Port,
    PortBinding, PortMap, RegistryAuth, RemoveOptions, normalize_name,
};
use crate::{ContainerRuntime, Error};
use async_trait::async_trait;
use bollard::Docker;
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use futures_util::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, info};

#[cfg(unix)]
const DEFAULT_DOCKER_HOST: &str = "unix:///var/run/docker.sock";
#[cfg(windows)]
const DEFAULT_DOCKER_HOST: &str = "npipe:////./pipe/docker_engine";

/// Runtime backed by the local Docker daemon
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
    daemon_host: String,
}

impl DockerRuntime {
    /// Connect using `DOCKER_HOST` or the platform default socket
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        let daemon_host =
            std::env::var("DOCKER_HOST").unwrap_or_else(|_| DEFAULT_DOCKER_HOST.to_string());
        debug!(daemon_host = %daemon_host, "Connected to Docker daemon");
        Ok(Self {
            docker,
            daemon_host,
        })
    }
}

/// Split an image reference into the `fromImage` and `tag` pull parameters.
///
/// The daemon pulls every tag when the tag is empty, so untagged references
/// default to `latest`. Digests are passed through untouched.
fn split_image_reference(image: &str) -> (String, String) {
    if image.contains('@') {
        return (image.to_string(), String::new());
    }
    let last_segment_start = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[last_segment_start..].rfind(':') {
        Some(colon) => {
            let split = last_segment_start + colon;
            (image[..split].to_string(), image[split + 1..].to_string())
        }
        None => (image.to_string(), "latest".to_string()),
    }
}

fn to_credentials(auth: &RegistryAuth) -> DockerCredentials {
    DockerCredentials {
        username: auth.username.clone(),
        password: auth.password.clone(),
        serveraddress: auth.server_address.clone(),
        identitytoken: auth.identity_token.clone(),
        ..Default::default()
    }
}

fn convert_ports(ports: Option<bollard::models::PortMap>) -> PortMap {
    let mut mapped = PortMap::new();
    for (key, bindings) in ports.unwrap_or_default() {
        let Ok(port) = key.parse::<Port>() else {
            debug!(port = %key, "Ignoring unparsable port key");
            continue;
        };
        let bindings = bindings
            .unwrap_or_default()
            .into_iter()
            .filter_map(|binding| {
                let host_port = binding.host_port?.parse::<u16>().ok()?;
                Some(PortBinding {
                    host_ip: binding.host_ip.filter(|ip| !ip.is_empty()),
                    host_port,
                })
            })
            .collect();
        mapped.insert(port, bindings);
    }
    mapped
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn daemon_host(&self) -> &str {
        &self.daemon_host
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();
        for port in &spec.ports {
            let key = port.port.to_string();
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![bollard::models::PortBinding {
                    host_ip: port.host_ip.clone(),
                    // an empty host port asks the daemon for a free one
                    host_port: Some(port.host_port.map(|p| p.to_string()).unwrap_or_default()),
                }]),
            );
        }

        let mounts = spec
            .binds
            .iter()
            .map(|bind| Mount {
                typ: Some(MountTypeEnum::BIND),
                source: Some(bind.source.clone()),
                target: Some(bind.target.clone()),
                ..Default::default()
            })
            .collect();

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(
                spec.env
                    .iter()
                    .map(|(key, value)| format!("{}={}", key, value))
                    .collect(),
            ),
            labels: Some(spec.labels.clone().into_iter().collect()),
            exposed_ports: Some(exposed_ports),
            cmd: (!spec.cmd.is_empty()).then(|| spec.cmd.clone()),
            entrypoint: (!spec.entrypoint.is_empty()).then(|| spec.entrypoint.clone()),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                mounts: Some(mounts),
                auto_remove: Some(spec.auto_remove),
                privileged: Some(spec.privileged),
                ..Default::default()
            }),
            ..Default::default()
        };

        let options = spec.name.as_ref().map(|name| CreateContainerOptions {
            name: name.clone(),
            platform: None,
        });

        let response = self.docker.create_container(options, config).await?;
        debug!(container_id = %response.id, image = %spec.image, "Created container");
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        match self
            .docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            // 304: already running
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn stop(&self, id: &str, timeout: Option<Duration>) -> Result<()> {
        let options = timeout.map(|t| StopContainerOptions {
            t: t.as_secs() as i64,
        });
        match self.docker.stop_container(id, options).await {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, id: &str, options: RemoveOptions) -> Result<()> {
        let options = RemoveContainerOptions {
            v: options.volumes,
            force: options.force,
            link: false,
        };
        self.docker.remove_container(id, Some(options)).await?;
        Ok(())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerInspection> {
        let raw = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;

        let state = raw.state.unwrap_or_default();
        let status = state
            .status
            .map(|s| s.to_string().parse().unwrap_or(ContainerStatus::Unknown))
            .unwrap_or(ContainerStatus::Unknown);
        let config = raw.config.unwrap_or_default();

        Ok(ContainerInspection {
            id: raw.id.unwrap_or_else(|| id.to_string()),
            name: raw.name.as_deref().map(normalize_name).unwrap_or_default(),
            image: config.image.or(raw.image).unwrap_or_default(),
            status,
            running: state.running.unwrap_or(false),
            ports: convert_ports(raw.network_settings.and_then(|n| n.ports)),
            labels: config.labels.unwrap_or_default().into_iter().collect(),
        })
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) => {
                let err = Error::from(e);
                if err.is_not_found() { Ok(false) } else { Err(err) }
            }
        }
    }

    async fn pull_image(&self, image: &str, auth: Option<&RegistryAuth>) -> Result<()> {
        let (from_image, tag) = split_image_reference(image);
        let options = CreateImageOptions {
            from_image,
            tag,
            ..Default::default()
        };

        let mut progress = self
            .docker
            .create_image(Some(options), None, auth.map(to_credentials));

        // the download is only complete once the progress stream ends
        while let Some(item) = progress.next().await {
            let info = item?;
            if let Some(status) = info.status {
                debug!(image = %image, status = %status, "Pull progress");
            }
        }
        info!(image = %image, "Pulled image");
        Ok(())
    }

    async fn logs(&self, id: &str) -> Result<Vec<u8>> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            tail: "all".to_string(),
            ..Default::default()
        };

        let mut stream = self.docker.logs(id, Some(options));
        let mut output = Vec::new();
        while let Some(chunk) = stream.next().await {
            output.extend_from_slice(&chunk?.into_bytes());
        }
        Ok(output)
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<ContainerSummary>> {
        let options = ListContainersOptions::<String> {
            all: filter.all,
            filters: filter
                .filters
                .iter()
                .map(|(key, values)| (key.clone(), values.clone()))
                .collect(),
            ..Default::default()
        };

        let containers = self.docker.list_containers(Some(options)).await?;
        Ok(containers
            .into_iter()
            .filter_map(|c| {
                Some(ContainerSummary {
                    id: c.id?,
                    names: c
                        .names
                        .unwrap_or_default()
                        .iter()
                        .map(|n| normalize_name(n))
                        .collect(),
                    image: c.image.unwrap_or_default(),
                    labels: c
                        .labels
                        .unwrap_or_default()
                        .into_iter()
                        .collect::<BTreeMap<_, _>>(),
                    status: c
                        .state
                        .as_deref()
                        .map(|s| s.parse().unwrap_or(ContainerStatus::Unknown))
                        .unwrap_or(ContainerStatus::Unknown),
                })
            })
            .collect())
    }
}
