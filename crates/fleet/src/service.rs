//! Fleet service: owns the controller, dispatcher and background loops
//!
//! ```text
//!   setup ──► ensure channels exist
//!   start ──► reconcile ──► scale_to(1) ──► spawn ┬─ ResultIngestLoop
//!                                                 ├─ BacklogMonitor
//!                                                 └─ CorrelationReaper
//!   shutdown ──► watch(true) ──► join (bounded) ──► abort stragglers
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::channel::{ChannelError, MessageChannel};
use crate::compute::ComputeClient;
use crate::config::FleetConfig;
use crate::correlation::CorrelationStore;
use crate::dispatcher::Dispatcher;
use crate::ingest::ResultIngestLoop;
use crate::monitor::BacklogMonitor;
use crate::pool::{PoolError, ReconcileReport, WorkerPoolController};
use crate::reaper::CorrelationReaper;

/// External collaborators the service runs against
#[derive(Clone)]
pub struct FleetDeps {
    pub jobs: Arc<dyn MessageChannel>,
    pub replies: Arc<dyn MessageChannel>,
    pub store: Arc<dyn CorrelationStore>,
    pub compute: Arc<dyn ComputeClient>,
}

/// Service lifecycle errors
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// A channel could not be created or reached during setup
    #[error("setup failed: {0}")]
    Setup(#[from] ChannelError),

    #[error("fleet service is already running")]
    AlreadyRunning,

    /// Initial reconciliation failed
    #[error("pool error: {0}")]
    Pool(#[from] PoolError),

    /// Background loops did not stop in time and were aborted
    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

/// The control-plane side of the fleet
pub struct FleetService {
    deps: FleetDeps,
    config: FleetConfig,
    controller: Arc<WorkerPoolController>,
    dispatcher: Arc<Dispatcher>,
    shutdown_tx: watch::Sender<bool>,
    running: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl FleetService {
    /// Verify the channels exist and wire up the components
    ///
    /// Failure here is fatal: the service cannot run without its channels.
    #[instrument(skip_all, fields(jobs = %deps.jobs.name(), replies = %deps.replies.name()))]
    pub async fn setup(deps: FleetDeps, config: FleetConfig) -> Result<Self, ServiceError> {
        deps.jobs.ensure_exists().await?;
        deps.replies.ensure_exists().await?;

        let controller = Arc::new(WorkerPoolController::new(
            Arc::clone(&deps.compute),
            config.pool.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&deps.jobs),
            Arc::clone(&deps.store),
            config.dispatch.clone(),
        ));
        let (shutdown_tx, _) = watch::channel(false);

        info!("fleet channels ready");

        Ok(Self {
            deps,
            config,
            controller,
            dispatcher,
            shutdown_tx,
            running: AtomicBool::new(false),
            handles: Mutex::new(Vec::new()),
        })
    }

    pub fn controller(&self) -> Arc<WorkerPoolController> {
        Arc::clone(&self.controller)
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Reconcile, warm-start one worker and spawn the background loops
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<ReconcileReport, ServiceError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ServiceError::AlreadyRunning);
        }

        let report = match self.controller.reconcile().await {
            Ok(report) => report,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };

        if let Err(e) = self.controller.scale_to(1).await {
            warn!("Warm start failed, monitor will retry: {}", e);
        }

        self.shutdown_tx.send_replace(false);

        let ingest = ResultIngestLoop::new(
            Arc::clone(&self.deps.replies),
            Arc::clone(&self.deps.store),
            self.config.ingest.clone(),
        );
        let monitor = BacklogMonitor::new(
            Arc::clone(&self.deps.jobs),
            Arc::clone(&self.controller),
            self.config.monitor.clone(),
        );
        let reaper = CorrelationReaper::new(Arc::clone(&self.deps.store), self.config.reaper.clone());

        let handles = vec![
            tokio::spawn(ingest.run(self.shutdown_tx.subscribe())),
            tokio::spawn(monitor.run(self.shutdown_tx.subscribe())),
            tokio::spawn(reaper.run(self.shutdown_tx.subscribe())),
        ];
        *self.handles.lock() = handles;

        info!(bound = report.bound, "fleet service started");
        Ok(report)
    }

    /// Signal the background loops to stop and wait for them
    ///
    /// Loops observe the signal at their next wake-up. Any loop still
    /// running after the shutdown timeout is aborted.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        info!("Initiating fleet shutdown");
        self.shutdown_tx.send_replace(true);

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();

        match tokio::time::timeout(
            self.config.shutdown_timeout,
            futures::future::join_all(handles),
        )
        .await
        {
            Ok(_) => {
                info!("fleet service stopped");
                Ok(())
            }
            Err(_) => {
                warn!(timeout = ?self.config.shutdown_timeout, "Shutdown timeout reached, aborting loops");
                for abort in aborts {
                    abort.abort();
                }
                Err(ServiceError::ShutdownTimeout)
            }
        }
    }
}
