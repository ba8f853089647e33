//! # labelq fleet
//!
//! Elastic worker fleet for image labeling: a synchronous caller hands in an
//! image, a queue-mediated pool of workers labels it, and the caller gets the
//! label back once a worker replied.
//!
//! ## Features
//!
//! - **Correlation store**: many concurrent callers each wait for exactly one
//!   matching asynchronous reply, with bounded wait and single consumption
//! - **Elastic pool**: a fixed set of named slots, reconciled from the compute
//!   provider by tag so the pool survives control-plane restarts
//! - **Backlog autoscaling**: job-channel depth drives the pool size, never
//!   below one warm worker
//! - **Pluggable boundaries**: message channels and compute have in-memory,
//!   PostgreSQL and Docker implementations
//!
//! ## Architecture
//!
//! ```text
//!  caller ──► Dispatcher ──► job channel ──► workers ──► reply channel
//!                │                                            │
//!                │ register / await_result                    ▼
//!                └──────────► CorrelationStore ◄──── ResultIngestLoop
//!
//!  BacklogMonitor ──(depth)──► WorkerPoolController ──► ComputeClient
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use labelq_fleet::prelude::*;
//!
//! let service = FleetService::setup(deps, FleetConfig::from_env()?).await?;
//! service.start().await?;
//!
//! let label = service.dispatcher().dispatch(&image_bytes, "cat.jpg").await?;
//!
//! service.shutdown().await?;
//! ```

pub mod channel;
pub mod compute;
pub mod config;
pub mod correlation;
pub mod dispatcher;
pub mod ingest;
pub mod job;
pub mod monitor;
pub mod pool;
pub mod reaper;
pub mod service;
pub mod telemetry;

/// Prelude for common imports
pub mod prelude {
    pub use crate::channel::{InMemoryChannel, MessageChannel, PostgresChannel};
    pub use crate::compute::{ComputeClient, DockerCompute, InMemoryCompute};
    pub use crate::config::FleetConfig;
    pub use crate::correlation::{
        CorrelationStore, InMemoryCorrelationStore, PostgresCorrelationStore,
    };
    pub use crate::dispatcher::{DispatchError, Dispatcher};
    pub use crate::pool::{PoolConfig, WorkerPoolController};
    pub use crate::service::{FleetDeps, FleetService, ServiceError};
}

// Re-export key types at crate root
pub use channel::{
    ChannelError, InMemoryChannel, MessageChannel, OutboundMessage, PostgresChannel,
    ReceivedMessage,
};
pub use compute::{
    ComputeClient, ComputeError, DockerCompute, InMemoryCompute, Instance, InstanceFilter,
    InstanceState, LaunchSpec,
};
pub use config::{ChannelConfig, ConfigError, FleetConfig};
pub use correlation::{
    await_result, CorrelationStatus, CorrelationStore, InMemoryCorrelationStore,
    PostgresCorrelationStore, StoreError,
};
pub use dispatcher::{DispatchConfig, DispatchError, Dispatcher};
pub use ingest::{IngestConfig, IngestError, IngestStats, ResultIngestLoop};
pub use job::{CorrelationId, Job, Reply, WireError};
pub use monitor::{target_size, BacklogMonitor, MonitorConfig, MonitorError};
pub use pool::{
    LaunchTemplate, PoolConfig, PoolError, ReconcileReport, WorkerPoolController, WORKER_SLOT_ENV,
};
pub use reaper::{CorrelationReaper, ReaperConfig};
pub use service::{FleetDeps, FleetService, ServiceError};

/// Apply the fleet's PostgreSQL migrations
pub async fn run_migrations(pool: &sqlx::PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| StoreError::Migration(e.to_string()))
}
