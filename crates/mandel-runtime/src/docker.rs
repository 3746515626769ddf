//! Docker-backed [`ContainerRuntime`] using bollard.

use crate::error::{Result, RuntimeError};
use crate::spec::{ContainerId, ContainerSpec};
use crate::{ContainerRuntime, EventStream, EventStreamError, RuntimeEvent};
use async_trait::async_trait;
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerCreateBody, EventMessageTypeEnum, HostConfig, PortBinding};
use bollard::query_parameters::{
    CreateContainerOptions, EventsOptions, ListImagesOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::Docker;
use futures::StreamExt;
use regex::Regex;
use std::collections::HashMap;
use std::time::Duration;

/// Docker-based container runtime.
///
/// Connects to the local daemon over its default socket.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl std::fmt::Debug for DockerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerRuntime").finish_non_exhaustive()
    }
}

impl DockerRuntime {
    /// Connect to the local Docker daemon and verify it answers a ping.
    ///
    /// # Errors
    /// Returns [`RuntimeError::Connection`] if the daemon is unreachable.
    pub async fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Connection(format!("failed to connect to Docker: {e}")))?;

        docker
            .ping()
            .await
            .map_err(|e| RuntimeError::Connection(format!("Docker ping failed: {e}")))?;

        tracing::info!("Connected to Docker daemon");
        Ok(Self { docker })
    }

    /// Wrap a pre-configured bollard client.
    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }
}

fn build_host_config(spec: &ContainerSpec) -> HostConfig {
    let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
    for mapping in &spec.port_mappings {
        port_bindings.insert(
            mapping.container_key(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(mapping.host_port.to_string()),
            }]),
        );
    }

    let devices = spec
        .devices
        .iter()
        .map(|d| bollard::models::DeviceMapping {
            path_on_host: Some(d.path_on_host.clone()),
            path_in_container: Some(d.path_in_container.clone()),
            cgroup_permissions: Some(d.cgroup_permissions.clone()),
        })
        .collect::<Vec<_>>();

    let tmpfs = spec
        .tmpfs
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect::<HashMap<_, _>>();

    fn non_empty<T>(v: Vec<T>) -> Option<Vec<T>> {
        if v.is_empty() {
            None
        } else {
            Some(v)
        }
    }

    HostConfig {
        binds: non_empty(spec.binds.clone()),
        port_bindings: if port_bindings.is_empty() {
            None
        } else {
            Some(port_bindings)
        },
        devices: non_empty(devices),
        tmpfs: if tmpfs.is_empty() { None } else { Some(tmpfs) },
        cap_add: non_empty(spec.cap_add.clone()),
        cap_drop: non_empty(spec.cap_drop.clone()),
        security_opt: non_empty(spec.security_opt.clone()),
        shm_size: spec.shm_size,
        cpu_shares: spec.cpu_shares,
        memory: spec.memory,
        auto_remove: Some(false),
        ..Default::default()
    }
}

/// Classify an event stream error.
///
/// Transport failures mean the daemon connection is gone; anything else is
/// assumed to clear up after resubscribing.
fn classify(err: BollardError) -> EventStreamError {
    match err {
        BollardError::IOError { .. } | BollardError::HyperResponseError { .. } => {
            EventStreamError::Fatal(err.to_string())
        }
        other => EventStreamError::Transient(other.to_string()),
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerId> {
        let env = spec.env_list();
        let exposed_ports: Vec<String> = spec
            .port_mappings
            .iter()
            .map(|m| m.container_key())
            .collect();
        let config = ContainerCreateBody {
            image: Some(spec.image.clone()),
            env: if env.is_empty() { None } else { Some(env) },
            exposed_ports: if exposed_ports.is_empty() {
                None
            } else {
                Some(exposed_ports)
            },
            tty: Some(spec.tty),
            attach_stdin: Some(false),
            attach_stdout: Some(false),
            attach_stderr: Some(false),
            host_config: Some(build_host_config(spec)),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: Some(spec.name.clone()),
            platform: String::new(),
        };

        tracing::info!(container = %spec.name, image = %spec.image, "Creating container");

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| RuntimeError::Create {
                name: spec.name.clone(),
                reason: e.to_string(),
            })?;

        for warning in &response.warnings {
            tracing::warn!(container = %spec.name, %warning, "Container create warning");
        }

        tracing::debug!(container = %spec.name, id = %response.id, "Container created");
        Ok(ContainerId::new(response.id))
    }

    async fn start(&self, id: &ContainerId) -> Result<()> {
        self.docker
            .start_container(id.as_str(), None::<StartContainerOptions>)
            .await
            .map_err(|e| RuntimeError::Start {
                id: id.to_string(),
                reason: e.to_string(),
            })?;

        tracing::debug!(container_id = %id, "Container started");
        Ok(())
    }

    async fn stop(&self, id: &ContainerId, timeout: Duration) -> Result<()> {
        let options = StopContainerOptions {
            t: Some(timeout.as_secs() as i32),
            signal: None,
        };

        self.docker
            .stop_container(id.as_str(), Some(options))
            .await
            .map_err(|e| RuntimeError::Stop {
                id: id.to_string(),
                reason: e.to_string(),
            })?;

        tracing::debug!(container_id = %id, "Container stopped");
        Ok(())
    }

    async fn remove(&self, id: &ContainerId) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        self.docker
            .remove_container(id.as_str(), Some(options))
            .await
            .map_err(|e| RuntimeError::Remove {
                id: id.to_string(),
                reason: e.to_string(),
            })?;

        tracing::debug!(container_id = %id, "Container removed");
        Ok(())
    }

    async fn find_image(&self, patterns: &[String]) -> Result<Option<String>> {
        let regexes = patterns
            .iter()
            .map(|p| Regex::new(p).map_err(|e| RuntimeError::Image(e.to_string())))
            .collect::<Result<Vec<_>>>()?;

        let mut filters = HashMap::new();
        filters.insert("dangling".to_string(), vec!["false".to_string()]);

        let images = self
            .docker
            .list_images(Some(ListImagesOptions {
                all: false,
                filters: Some(filters),
                ..Default::default()
            }))
            .await
            .map_err(|e| RuntimeError::Image(e.to_string()))?;

        let tags: Vec<&String> = images.iter().flat_map(|i| i.repo_tags.iter()).collect();
        Ok(first_match(&regexes, &tags))
    }

    fn events(&self) -> EventStream {
        let mut filters = HashMap::new();
        filters.insert("type".to_string(), vec!["container".to_string()]);

        let docker = self.docker.clone();
        docker
            .events(Some(EventsOptions {
                filters: Some(filters),
                ..Default::default()
            }))
            .filter_map(|item| async move {
                match item {
                    Ok(message) => {
                        if message.typ != Some(EventMessageTypeEnum::CONTAINER) {
                            return None;
                        }
                        let id = message.actor.and_then(|a| a.id)?;
                        Some(Ok(RuntimeEvent {
                            container_id: ContainerId::new(id),
                            action: message.action.unwrap_or_default(),
                        }))
                    }
                    Err(e) => Some(Err(classify(e))),
                }
            })
            .boxed()
    }
}

/// First tag matching any pattern, with earlier patterns taking priority.
fn first_match(patterns: &[Regex], tags: &[&String]) -> Option<String> {
    patterns
        .iter()
        .find_map(|re| tags.iter().find(|t| re.is_match(t)).map(|t| t.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{DeviceMapping, PortMapping, Protocol};

    #[test]
    fn test_host_config_translation() {
        let spec = ContainerSpec::builder("c", "i")
            .port(PortMapping {
                container_port: 32262,
                host_port: 40001,
                protocol: Protocol::Tcp,
            })
            .device(DeviceMapping::same_path("/dev/fuse", "rwm"))
            .tmpfs("/run", "size=52428800")
            .cap_drop("ALL")
            .shm_size(2147483648)
            .build();

        let hc = build_host_config(&spec);
        let bindings = hc.port_bindings.unwrap();
        let binding = bindings["32262/tcp"].as_ref().unwrap();
        assert_eq!(binding[0].host_port.as_deref(), Some("40001"));
        assert_eq!(hc.devices.unwrap()[0].cgroup_permissions.as_deref(), Some("rwm"));
        assert_eq!(hc.tmpfs.unwrap()["/run"], "size=52428800");
        assert_eq!(hc.cap_drop.unwrap(), vec!["ALL"]);
        assert_eq!(hc.shm_size, Some(2147483648));
        assert!(hc.binds.is_none());
    }

    #[test]
    fn test_first_match_respects_pattern_order() {
        let tags = [
            "browsers/chrome:latest".to_string(),
            "browsers/chrome:current-build".to_string(),
        ];
        let refs: Vec<&String> = tags.iter().collect();
        let patterns = vec![
            Regex::new("^browsers/chrome:current-build$").unwrap(),
            Regex::new("^browsers/chrome(:.*)?$").unwrap(),
        ];
        assert_eq!(
            first_match(&patterns, &refs).as_deref(),
            Some("browsers/chrome:current-build")
        );

        let none = vec![Regex::new("^other$").unwrap()];
        assert!(first_match(&none, &refs).is_none());
    }

    #[tokio::test]
    #[ignore = "requires a Docker daemon"]
    async fn test_connect_and_ping() {
        let runtime = DockerRuntime::connect().await.expect("docker available");
        let _ = runtime.find_image(&["^.*$".to_string()]).await.unwrap();
    }
}
