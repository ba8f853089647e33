//! Backlog-driven autoscaling loop
//!
//! Every period the job channel depth `d` is sampled and the pool is driven
//! to `clamp(max(d, 1), 1, max_slots)`. The pool never scales to zero.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument};

use crate::channel::{ChannelError, MessageChannel};
use crate::pool::{PoolError, WorkerPoolController};

/// Backlog monitor configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Time between scaling decisions
    #[serde(with = "crate::config::duration_millis")]
    pub interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
        }
    }
}

impl MonitorConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

/// A failed scaling cycle
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("failed to sample backlog depth: {0}")]
    Depth(#[from] ChannelError),

    #[error("failed to scale pool: {0}")]
    Scale(#[from] PoolError),
}

/// Desired pool size for a backlog of `depth` jobs
pub fn target_size(depth: usize, max_slots: usize) -> usize {
    depth.max(1).min(max_slots.max(1))
}

/// Periodically scales the worker pool to the job backlog
pub struct BacklogMonitor {
    jobs: Arc<dyn MessageChannel>,
    controller: Arc<WorkerPoolController>,
    config: MonitorConfig,
}

impl BacklogMonitor {
    pub fn new(
        jobs: Arc<dyn MessageChannel>,
        controller: Arc<WorkerPoolController>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            jobs,
            controller,
            config,
        }
    }

    /// Run one scaling decision, returning the live count reached
    #[instrument(skip(self), fields(channel = %self.jobs.name()))]
    pub async fn run_cycle(&self) -> Result<usize, MonitorError> {
        let depth = self.jobs.approximate_depth().await?;
        let target = target_size(depth, self.controller.max_slots());
        debug!(depth, target, "sampled backlog");

        let live = self.controller.scale_to(target).await?;
        Ok(live)
    }

    /// Run cycles until `shutdown_rx` flips to true
    ///
    /// A failing cycle is logged; the loop keeps going.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(interval = ?self.config.interval, "backlog monitor started");
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        error!("Scaling cycle failed: {}", e);
                    }
                }
                changed = shutdown_rx.changed() => {
                    debug!("Backlog monitor: shutdown requested");
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("backlog monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{InMemoryChannel, OutboundMessage};
    use crate::compute::InMemoryCompute;
    use crate::pool::PoolConfig;

    #[test]
    fn test_target_table() {
        let max = 20;
        for depth in 0..=max + 5 {
            let expected = if depth == 0 {
                1
            } else if depth < max {
                depth
            } else {
                max
            };
            assert_eq!(target_size(depth, max), expected, "depth {depth}");
        }
    }

    fn monitor(max_slots: usize) -> (Arc<InMemoryChannel>, Arc<InMemoryCompute>, BacklogMonitor) {
        let jobs = Arc::new(InMemoryChannel::new("jobs"));
        let compute = Arc::new(InMemoryCompute::new());
        let controller = Arc::new(WorkerPoolController::new(
            compute.clone(),
            PoolConfig::default().with_max_slots(max_slots),
        ));
        let monitor = BacklogMonitor::new(jobs.clone(), controller, MonitorConfig::default());
        (jobs, compute, monitor)
    }

    #[tokio::test]
    async fn test_cycle_follows_backlog() {
        let (jobs, compute, monitor) = monitor(5);

        assert_eq!(monitor.run_cycle().await.unwrap(), 1);

        for i in 0..8 {
            jobs.send(OutboundMessage::new(format!("job-{i}"))).await.unwrap();
        }
        assert_eq!(monitor.run_cycle().await.unwrap(), 5);
        assert_eq!(compute.live_count(), 5);

        let received = jobs.receive(8, Duration::ZERO).await.unwrap();
        for message in received {
            jobs.delete(&message.receipt_handle).await.unwrap();
        }
        assert_eq!(monitor.run_cycle().await.unwrap(), 1);
        assert_eq!(compute.live_count(), 1);
    }

    #[tokio::test]
    async fn test_cycle_reports_depth_failure() {
        let (jobs, _compute, monitor) = monitor(5);
        jobs.set_unavailable(true);

        assert!(matches!(
            monitor.run_cycle().await,
            Err(MonitorError::Depth(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_survives_failures_and_stops() {
        let (jobs, compute, monitor) = monitor(5);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        jobs.set_unavailable(true);

        let handle = tokio::spawn(monitor.run(shutdown_rx));

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(compute.live_count(), 0);

        jobs.set_unavailable(false);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(compute.live_count(), 1);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
