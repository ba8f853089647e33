//! Elastic worker pool
//!
//! ```text
//!            scale_to(target)
//!                  │
//!   ┌──────────────▼──────────────┐        ┌──────────────────┐
//!   │     WorkerPoolController    │ create │                  │
//!   │                             ├───────►│  ComputeClient   │
//!   │  app-instance-1 ─► i-0001   │terminate│ (docker/memory)  │
//!   │  app-instance-2 ─► i-0002   ├───────►│                  │
//!   │  app-instance-3 ─► (none)   │◄───────┤  list by Name tag│
//!   └─────────────────────────────┘  list  └──────────────────┘
//! ```
//!
//! Slots are stable names; instances are tagged `Name=<slot>` so the table
//! can be rebuilt from the provider after a restart.

mod controller;
mod slot;

pub use controller::{
    LaunchTemplate, PoolConfig, PoolError, ReconcileReport, WorkerPoolController, WORKER_SLOT_ENV,
};
pub use slot::{select_victim, Binding, Slot, SlotTable};
