//! In-memory implementation of ComputeClient for testing and dev mode

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::{Mutex, RwLock};

use super::instance::*;

/// In-memory implementation of ComputeClient
///
/// Instances are records only; nothing is executed. Launch times increase
/// strictly with every creation so ordering-dependent behavior is
/// deterministic. Creation failures and external state changes can be
/// injected to exercise reconciliation.
///
/// # Example
///
/// ```
/// use labelq_fleet::InMemoryCompute;
///
/// let compute = InMemoryCompute::new();
/// assert_eq!(compute.live_count(), 0);
/// ```
pub struct InMemoryCompute {
    instances: RwLock<Vec<Instance>>,
    launches: Mutex<Vec<LaunchSpec>>,
    launch_epoch: DateTime<Utc>,
    sequence: AtomicU64,
    create_attempts: AtomicU64,
    initial_state: RwLock<InstanceState>,
    /// Remaining successful creations before every create fails
    create_budget: Mutex<Option<usize>>,
}

impl InMemoryCompute {
    /// Create an empty provider
    pub fn new() -> Self {
        Self {
            instances: RwLock::new(Vec::new()),
            launches: Mutex::new(Vec::new()),
            launch_epoch: Utc::now(),
            sequence: AtomicU64::new(0),
            create_attempts: AtomicU64::new(0),
            initial_state: RwLock::new(InstanceState::Pending),
            create_budget: Mutex::new(None),
        }
    }

    /// State newly created instances start in (default Pending)
    pub fn with_initial_state(self, state: InstanceState) -> Self {
        *self.initial_state.write() = state;
        self
    }

    /// Let `successes` more creations succeed, then fail every creation
    pub fn fail_creates_after(&self, successes: usize) {
        *self.create_budget.lock() = Some(successes);
    }

    /// Stop injecting creation failures
    pub fn clear_create_failures(&self) {
        *self.create_budget.lock() = None;
    }

    /// Move every Pending instance to Running
    pub fn boot_all(&self) {
        for instance in self.instances.write().iter_mut() {
            if instance.state == InstanceState::Pending {
                instance.state = InstanceState::Running;
            }
        }
    }

    /// Change an instance's state behind the controller's back
    pub fn set_state(&self, instance_id: &str, state: InstanceState) {
        if let Some(instance) = self
            .instances
            .write()
            .iter_mut()
            .find(|i| i.id == instance_id)
        {
            instance.state = state;
        }
    }

    /// Add an instance that was launched outside this process
    pub fn insert(&self, instance: Instance) {
        self.instances.write().push(instance);
    }

    /// Snapshot of every known instance, including terminated ones
    pub fn instances(&self) -> Vec<Instance> {
        self.instances.read().clone()
    }

    pub fn get(&self, instance_id: &str) -> Option<Instance> {
        self.instances
            .read()
            .iter()
            .find(|i| i.id == instance_id)
            .cloned()
    }

    /// Number of Pending or Running instances
    pub fn live_count(&self) -> usize {
        self.instances
            .read()
            .iter()
            .filter(|i| i.state.is_live())
            .count()
    }

    /// Every launch request received, in order
    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.launches.lock().clone()
    }

    /// Every create call, including failed ones
    pub fn create_attempts(&self) -> u64 {
        self.create_attempts.load(Ordering::Relaxed)
    }

    fn next_launch_time(&self) -> (u64, DateTime<Utc>) {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        (seq, self.launch_epoch + ChronoDuration::seconds(seq as i64))
    }
}

impl Default for InMemoryCompute {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ComputeClient for InMemoryCompute {
    async fn create(&self, spec: &LaunchSpec) -> Result<Instance, ComputeError> {
        self.create_attempts.fetch_add(1, Ordering::Relaxed);
        {
            let mut budget = self.create_budget.lock();
            match budget.as_mut() {
                Some(0) => {
                    return Err(ComputeError::LaunchFailed(
                        "injected launch failure".to_string(),
                    ))
                }
                Some(remaining) => *remaining -= 1,
                None => {}
            }
        }

        let (seq, launched_at) = self.next_launch_time();
        let instance = Instance {
            id: format!("i-{seq:08x}"),
            state: *self.initial_state.read(),
            launched_at,
            tags: spec.tags.clone(),
        };

        self.launches.lock().push(spec.clone());
        self.instances.write().push(instance.clone());
        Ok(instance)
    }

    async fn terminate(&self, instance_id: &str) -> Result<(), ComputeError> {
        let mut instances = self.instances.write();
        match instances
            .iter_mut()
            .find(|i| i.id == instance_id && i.state != InstanceState::Terminated)
        {
            Some(instance) => {
                instance.state = InstanceState::Terminated;
                Ok(())
            }
            None => Err(ComputeError::NotFound(instance_id.to_string())),
        }
    }

    async fn list(&self, filter: &InstanceFilter) -> Result<Vec<Instance>, ComputeError> {
        Ok(self
            .instances
            .read()
            .iter()
            .filter(|i| filter.matches(i))
            .cloned()
            .collect())
    }
}
