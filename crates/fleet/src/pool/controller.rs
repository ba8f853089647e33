//! Worker pool controller
//!
//! Owns the slot table and drives the compute provider toward a target pool
//! size. Every operation holds the slot table lock for its whole duration, so
//! controller operations are serialized.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::slot::{Slot, SlotTable};
use crate::compute::{ComputeClient, ComputeError, Instance, InstanceFilter, LaunchSpec, NAME_TAG};

/// Environment variable telling a worker which slot it occupies
pub const WORKER_SLOT_ENV: &str = "LABELQ_WORKER_SLOT";

/// How to launch a worker instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchTemplate {
    /// Machine image with the worker preinstalled
    pub image: String,
    pub machine_type: String,
    /// Command run on boot; must start the worker consume loop
    pub bootstrap: Vec<String>,
    /// Extra environment for the worker process
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for LaunchTemplate {
    fn default() -> Self {
        Self {
            image: "labelq-worker:latest".to_string(),
            machine_type: "micro".to_string(),
            bootstrap: vec!["labelq-worker".to_string()],
            env: BTreeMap::new(),
        }
    }
}

impl LaunchTemplate {
    /// Launch request for one slot
    pub fn to_spec(&self, slot: &str) -> LaunchSpec {
        let mut env = self.env.clone();
        env.insert(WORKER_SLOT_ENV.to_string(), slot.to_string());

        LaunchSpec {
            image: self.image.clone(),
            machine_type: self.machine_type.clone(),
            bootstrap: self.bootstrap.clone(),
            env,
            tags: BTreeMap::from([(NAME_TAG.to_string(), slot.to_string())]),
        }
    }
}

/// Pool controller configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of named slots, and so the live worker ceiling
    pub max_slots: usize,

    /// Slot names are `<prefix>-1 .. <prefix>-<max_slots>`
    pub slot_prefix: String,

    pub launch: LaunchTemplate,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_slots: 20,
            slot_prefix: "app-instance".to_string(),
            launch: LaunchTemplate::default(),
        }
    }
}

impl PoolConfig {
    pub fn with_max_slots(mut self, max_slots: usize) -> Self {
        self.max_slots = max_slots.max(1);
        self
    }

    pub fn with_slot_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.slot_prefix = prefix.into();
        self
    }

    pub fn with_launch(mut self, launch: LaunchTemplate) -> Self {
        self.launch = launch;
        self
    }
}

/// Pool controller errors
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Target outside `[1, max]`
    #[error("invalid target {target}: must be between 1 and {max}")]
    InvalidTarget { target: usize, max: usize },

    /// Every slot is bound
    #[error("no free worker slot")]
    PoolExhausted,

    /// Nothing to terminate
    #[error("no live workers")]
    NoLiveWorkers,

    /// A creation failed part way through a scale-up
    #[error("scale-up to {target} stopped at {reached}: {source}")]
    ScaleUpAborted {
        reached: usize,
        target: usize,
        #[source]
        source: Box<PoolError>,
    },

    /// Compute provider error
    #[error("compute error: {0}")]
    Compute(#[from] ComputeError),
}

/// Outcome of a reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Slots bound to a live instance afterwards
    pub bound: usize,
    /// Extra live instances sharing a slot tag that were terminated
    pub duplicates_terminated: usize,
    /// Extra instances whose termination failed (retried next pass)
    pub duplicates_failed: usize,
}

/// Elastic worker pool over a fixed set of named slots
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use labelq_fleet::{InMemoryCompute, PoolConfig, WorkerPoolController};
///
/// # tokio_test_block_on(async {
/// let compute = Arc::new(InMemoryCompute::new());
/// let controller = WorkerPoolController::new(compute, PoolConfig::default());
///
/// controller.scale_to(3).await.unwrap();
/// assert_eq!(controller.live_workers().await.unwrap().len(), 3);
/// # });
/// # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
/// # }
/// ```
pub struct WorkerPoolController {
    compute: Arc<dyn ComputeClient>,
    config: PoolConfig,
    slots: Mutex<SlotTable>,
}

impl WorkerPoolController {
    pub fn new(compute: Arc<dyn ComputeClient>, config: PoolConfig) -> Self {
        let slots = SlotTable::new(&config.slot_prefix, config.max_slots);
        Self {
            compute,
            config,
            slots: Mutex::new(slots),
        }
    }

    pub fn max_slots(&self) -> usize {
        self.config.max_slots
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Current slot table, without consulting the provider
    pub async fn snapshot(&self) -> Vec<Slot> {
        self.slots.lock().await.slots().to_vec()
    }

    /// Rebuild every binding from the provider's view
    ///
    /// Live instances tagged with a slot name are bound to that slot. When
    /// several live instances share a tag, the oldest keeps the slot and the
    /// rest are terminated.
    #[instrument(skip(self))]
    pub async fn reconcile(&self) -> Result<ReconcileReport, PoolError> {
        let mut slots = self.slots.lock().await;
        slots.clear();
        let report = self.refresh_locked(&mut slots).await?;

        info!(
            bound = report.bound,
            duplicates_terminated = report.duplicates_terminated,
            "reconciled worker pool"
        );
        Ok(report)
    }

    /// Create or terminate workers until `target` are live
    ///
    /// Returns the live count reached. A creation failure stops the scale-up
    /// for this call and is reported as [`PoolError::ScaleUpAborted`].
    #[instrument(skip(self))]
    pub async fn scale_to(&self, target: usize) -> Result<usize, PoolError> {
        let max = self.max_slots();
        if target == 0 || target > max {
            return Err(PoolError::InvalidTarget { target, max });
        }

        let mut slots = self.slots.lock().await;
        self.refresh_locked(&mut slots).await?;

        loop {
            let live = slots.bound_count();
            match live.cmp(&target) {
                Ordering::Equal => return Ok(live),
                Ordering::Less => {
                    if let Err(e) = self.create_locked(&mut slots).await {
                        warn!(reached = live, target, "scale-up aborted: {}", e);
                        return Err(PoolError::ScaleUpAborted {
                            reached: live,
                            target,
                            source: Box::new(e),
                        });
                    }
                }
                Ordering::Greater => {
                    self.terminate_locked(&mut slots).await?;
                }
            }
        }
    }

    /// Launch one worker in the first free slot, returning the slot name
    #[instrument(skip(self))]
    pub async fn create_worker(&self) -> Result<String, PoolError> {
        let mut slots = self.slots.lock().await;
        self.create_locked(&mut slots).await
    }

    /// Terminate one worker chosen by the tie-break rule, returning its slot
    #[instrument(skip(self))]
    pub async fn terminate_worker(&self) -> Result<String, PoolError> {
        let mut slots = self.slots.lock().await;
        self.terminate_locked(&mut slots).await
    }

    /// Slot names whose instance is still Pending or Running
    ///
    /// Bindings whose instance has gone away are cleared.
    #[instrument(skip(self))]
    pub async fn live_workers(&self) -> Result<Vec<String>, PoolError> {
        let mut slots = self.slots.lock().await;
        self.refresh_locked(&mut slots).await?;
        Ok(slots.bound_names())
    }

    async fn create_locked(&self, slots: &mut SlotTable) -> Result<String, PoolError> {
        let name = slots
            .first_unbound()
            .ok_or(PoolError::PoolExhausted)?
            .to_string();

        let instance = self.compute.create(&self.config.launch.to_spec(&name)).await?;
        slots.bind(&name, &instance);

        info!(slot = %name, instance_id = %instance.id, "created worker");
        Ok(name)
    }

    async fn terminate_locked(&self, slots: &mut SlotTable) -> Result<String, PoolError> {
        let (name, instance_id) = slots
            .victim()
            .and_then(|slot| {
                slot.binding
                    .as_ref()
                    .map(|b| (slot.name.clone(), b.instance_id.clone()))
            })
            .ok_or(PoolError::NoLiveWorkers)?;

        match self.compute.terminate(&instance_id).await {
            Ok(()) => {}
            Err(ComputeError::NotFound(_)) => {
                debug!(slot = %name, %instance_id, "instance already gone");
            }
            Err(e) => return Err(e.into()),
        }
        slots.unbind(&name);

        info!(slot = %name, %instance_id, "terminated worker");
        Ok(name)
    }

    /// Align the slot table with every live instance carrying a slot tag
    ///
    /// A bound instance keeps its slot while it is live; otherwise the slot
    /// adopts the oldest live instance tagged for it, or is released. Any
    /// further live instance tagged for the same slot is terminated, so the
    /// provider never holds more live workers than there are slots.
    async fn refresh_locked(&self, slots: &mut SlotTable) -> Result<ReconcileReport, PoolError> {
        let mut live = self
            .compute
            .list(&InstanceFilter::live_named(slots.names()))
            .await?;
        live.sort_by_key(|i| i.launched_at);

        let mut by_slot: HashMap<String, Vec<Instance>> = HashMap::new();
        for instance in live {
            if let Some(name) = instance.slot_name().map(str::to_string) {
                by_slot.entry(name).or_default().push(instance);
            }
        }

        let mut report = ReconcileReport::default();
        for name in slots.names() {
            let candidates = by_slot.remove(&name).unwrap_or_default();
            let bound_id = slots
                .get(&name)
                .and_then(|s| s.binding.as_ref())
                .map(|b| b.instance_id.clone());

            let keep = bound_id
                .as_deref()
                .and_then(|id| candidates.iter().position(|i| i.id == id))
                .or_else(|| (!candidates.is_empty()).then_some(0));

            match keep {
                Some(index) => {
                    let instance = &candidates[index];
                    if bound_id.as_deref() != Some(instance.id.as_str()) {
                        info!(slot = %name, instance_id = %instance.id, "adopted live worker");
                    }
                    slots.bind(&name, instance);
                    report.bound += 1;
                }
                None => {
                    if let Some(instance_id) = bound_id {
                        slots.unbind(&name);
                        info!(slot = %name, %instance_id, "worker no longer live, slot released");
                    }
                }
            }

            for (index, extra) in candidates.iter().enumerate() {
                if Some(index) == keep {
                    continue;
                }
                warn!(slot = %name, instance_id = %extra.id, "duplicate instance for slot");
                match self.compute.terminate(&extra.id).await {
                    Ok(()) | Err(ComputeError::NotFound(_)) => report.duplicates_terminated += 1,
                    Err(e) => {
                        warn!(instance_id = %extra.id, "Failed to terminate duplicate: {}", e);
                        report.duplicates_failed += 1;
                    }
                }
            }
        }
        Ok(report)
    }
}
