//! Docker implementation of ComputeClient using the bollard crate
//!
//! Each worker instance is a container. Instance tags become container labels,
//! the bootstrap command becomes the container command, and the machine type
//! selects a memory limit.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerSummary, HostConfig};
use bollard::Docker;
use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::instance::*;

/// Label marking containers owned by the fleet
pub const MANAGED_LABEL: &str = "labelq.managed";

/// Label recording the requested machine type
pub const MACHINE_TYPE_LABEL: &str = "labelq.machine-type";

/// Docker-backed compute provider
pub struct DockerCompute {
    docker: Docker,
    network_mode: Option<String>,
}

impl DockerCompute {
    /// Connect to the local Docker daemon
    pub fn connect() -> Result<Self, ComputeError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| ComputeError::Provider(format!("failed to connect to docker: {e}")))?;
        Ok(Self::from_docker(docker))
    }

    /// Wrap an existing bollard client
    pub fn from_docker(docker: Docker) -> Self {
        Self {
            docker,
            network_mode: None,
        }
    }

    /// Attach worker containers to this network (e.g. the compose network
    /// that can reach the database)
    pub fn with_network_mode(mut self, mode: impl Into<String>) -> Self {
        self.network_mode = Some(mode.into());
        self
    }
}

/// Memory limit for a machine type, `None` for unknown types
pub fn memory_limit(machine_type: &str) -> Option<i64> {
    const MIB: i64 = 1024 * 1024;
    match machine_type {
        "micro" => Some(512 * MIB),
        "small" => Some(1024 * MIB),
        "medium" => Some(2048 * MIB),
        "large" => Some(4096 * MIB),
        _ => None,
    }
}

/// Map a Docker container state onto the instance lifecycle
pub fn instance_state(docker_state: &str) -> InstanceState {
    match docker_state {
        "created" | "restarting" => InstanceState::Pending,
        "running" | "paused" => InstanceState::Running,
        "removing" => InstanceState::Stopping,
        "dead" => InstanceState::Terminated,
        _ => InstanceState::Stopped,
    }
}

fn to_instance(summary: ContainerSummary) -> Option<Instance> {
    let id = summary.id?;
    let state = summary
        .state
        .as_deref()
        .map(instance_state)
        .unwrap_or(InstanceState::Stopped);
    let launched_at = summary
        .created
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or_else(Utc::now);
    let tags = summary.labels.unwrap_or_default().into_iter().collect();

    Some(Instance {
        id,
        state,
        launched_at,
        tags,
    })
}

/// Host settings for a worker container
///
/// Exited workers are removed by the daemon so crashed containers do not
/// accumulate; the controller only sees them disappear.
fn worker_host_config(spec: &LaunchSpec, network_mode: Option<String>) -> HostConfig {
    HostConfig {
        memory: memory_limit(&spec.machine_type),
        network_mode,
        auto_remove: Some(true),
        ..Default::default()
    }
}

fn is_not_found(e: &BollardError) -> bool {
    matches!(
        e,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[async_trait]
impl ComputeClient for DockerCompute {
    #[instrument(skip(self, spec), fields(image = %spec.image))]
    async fn create(&self, spec: &LaunchSpec) -> Result<Instance, ComputeError> {
        let slot = spec
            .tags
            .get(NAME_TAG)
            .map(String::as_str)
            .unwrap_or("worker");
        let container_name = format!("{}-{}", slot, &Uuid::now_v7().simple().to_string()[..12]);

        let mut labels: HashMap<String, String> = spec.tags.clone().into_iter().collect();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        labels.insert(MACHINE_TYPE_LABEL.to_string(), spec.machine_type.clone());

        let host_config = worker_host_config(spec, self.network_mode.clone());

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: if spec.bootstrap.is_empty() {
                None
            } else {
                Some(spec.bootstrap.clone())
            },
            env: Some(
                spec.env
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect(),
            ),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: container_name.clone(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| ComputeError::LaunchFailed(format!("failed to create container: {e}")))?;

        if let Err(e) = self
            .docker
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await
        {
            // Do not leave a created-but-never-started container behind
            let cleanup = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            if let Err(remove_err) = self
                .docker
                .remove_container(&response.id, Some(cleanup))
                .await
            {
                warn!(container = %response.id, "Failed to clean up container: {}", remove_err);
            }
            return Err(ComputeError::LaunchFailed(format!(
                "failed to start container: {e}"
            )));
        }

        debug!(container = %response.id, name = %container_name, "started worker container");

        Ok(Instance {
            id: response.id,
            state: InstanceState::Pending,
            launched_at: Utc::now(),
            tags: spec.tags.clone(),
        })
    }

    #[instrument(skip(self))]
    async fn terminate(&self, instance_id: &str) -> Result<(), ComputeError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        self.docker
            .remove_container(instance_id, Some(options))
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    ComputeError::NotFound(instance_id.to_string())
                } else {
                    ComputeError::Provider(format!("failed to remove container: {e}"))
                }
            })
    }

    async fn list(&self, filter: &InstanceFilter) -> Result<Vec<Instance>, ComputeError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{MANAGED_LABEL}=true")]);

        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let summaries = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| ComputeError::Provider(format!("failed to list containers: {e}")))?;

        Ok(summaries
            .into_iter()
            .filter_map(to_instance)
            .filter(|instance| filter.matches(instance))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_containers_are_auto_removed() {
        let spec = LaunchSpec {
            image: "labelq-worker:latest".into(),
            machine_type: "small".into(),
            bootstrap: vec![],
            env: Default::default(),
            tags: Default::default(),
        };

        let host = worker_host_config(&spec, Some("labelq".into()));
        assert_eq!(host.auto_remove, Some(true));
        assert_eq!(host.memory, Some(1024 * 1024 * 1024));
        assert_eq!(host.network_mode.as_deref(), Some("labelq"));
    }

    #[test]
    fn test_instance_state_mapping() {
        assert_eq!(instance_state("created"), InstanceState::Pending);
        assert_eq!(instance_state("running"), InstanceState::Running);
        assert_eq!(instance_state("removing"), InstanceState::Stopping);
        assert_eq!(instance_state("exited"), InstanceState::Stopped);
        assert_eq!(instance_state("dead"), InstanceState::Terminated);
    }

    #[test]
    fn test_memory_limit() {
        assert_eq!(memory_limit("micro"), Some(512 * 1024 * 1024));
        assert_eq!(memory_limit("t2.micro"), None);
    }

    #[test]
    fn test_summary_to_instance() {
        let summary = ContainerSummary {
            id: Some("abc123".into()),
            state: Some("running".into()),
            created: Some(1_700_000_000),
            labels: Some(HashMap::from([(
                NAME_TAG.to_string(),
                "app-instance-3".to_string(),
            )])),
            ..Default::default()
        };

        let instance = to_instance(summary).unwrap();
        assert_eq!(instance.id, "abc123");
        assert_eq!(instance.state, InstanceState::Running);
        assert_eq!(instance.slot_name(), Some("app-instance-3"));
        assert_eq!(instance.launched_at.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_summary_without_id_is_skipped() {
        assert!(to_instance(ContainerSummary::default()).is_none());
    }
}
