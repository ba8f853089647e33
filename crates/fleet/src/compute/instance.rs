//! ComputeClient trait definition

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tag key holding the slot name of a worker instance
pub const NAME_TAG: &str = "Name";

/// Error type for compute lifecycle operations
#[derive(Debug, thiserror::Error)]
pub enum ComputeError {
    /// Instance does not exist (already terminated or never created)
    #[error("instance not found: {0}")]
    NotFound(String),

    /// The provider refused to launch an instance
    #[error("launch failed: {0}")]
    LaunchFailed(String),

    /// Provider API error
    #[error("compute provider error: {0}")]
    Provider(String),
}

/// Lifecycle state of a worker instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    /// Launch requested, not yet serving
    Pending,
    /// Booted and running the consume loop
    Running,
    /// Shutting down
    Stopping,
    /// Stopped, may still exist
    Stopped,
    /// Gone
    Terminated,
}

impl InstanceState {
    /// Pending and Running instances count toward the pool
    pub const LIVE: [InstanceState; 2] = [InstanceState::Pending, InstanceState::Running];

    pub fn is_live(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// A worker machine as reported by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub state: InstanceState,
    pub launched_at: DateTime<Utc>,
    pub tags: BTreeMap<String, String>,
}

impl Instance {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    /// Slot name from the `Name` tag
    pub fn slot_name(&self) -> Option<&str> {
        self.tag(NAME_TAG)
    }
}

/// Everything needed to launch one worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSpec {
    /// Machine image with the worker preinstalled
    pub image: String,
    pub machine_type: String,
    /// Command run unattended on boot; starts the worker consume loop
    pub bootstrap: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub tags: BTreeMap<String, String>,
}

/// Filter for listing instances: tag value match and state match
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceFilter {
    pub tag_key: Option<String>,
    /// Any of these values matches; empty matches every value of `tag_key`
    pub tag_values: Vec<String>,
    /// Any of these states matches; empty matches all states
    pub states: Vec<InstanceState>,
}

impl InstanceFilter {
    /// Live instances whose `Name` tag is one of `names`
    pub fn live_named<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tag_key: Some(NAME_TAG.to_string()),
            tag_values: names.into_iter().map(Into::into).collect(),
            states: InstanceState::LIVE.to_vec(),
        }
    }

    pub fn matches(&self, instance: &Instance) -> bool {
        let tag_ok = match &self.tag_key {
            None => true,
            Some(key) => match instance.tag(key) {
                None => false,
                Some(value) => {
                    self.tag_values.is_empty() || self.tag_values.iter().any(|v| v == value)
                }
            },
        };
        let state_ok = self.states.is_empty() || self.states.contains(&instance.state);
        tag_ok && state_ok
    }
}

/// Compute lifecycle API for worker instances
///
/// Implementations must be thread-safe. Each call is treated as atomic.
#[async_trait]
pub trait ComputeClient: Send + Sync + 'static {
    /// Launch one instance
    async fn create(&self, spec: &LaunchSpec) -> Result<Instance, ComputeError>;

    /// Destroy an instance
    async fn terminate(&self, instance_id: &str) -> Result<(), ComputeError>;

    /// List instances matching the filter
    async fn list(&self, filter: &InstanceFilter) -> Result<Vec<Instance>, ComputeError>;
}
