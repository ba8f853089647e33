//! Request/response correlation
//!
//! This module provides:
//! - [`CorrelationStore`] trait mapping correlation ids to result status
//! - [`await_result`] bounded, single-consumption wait for one reply
//! - [`InMemoryCorrelationStore`] for testing and dev mode
//! - [`PostgresCorrelationStore`] for production
//!
//! Entry lifecycle:
//!
//! ```text
//!   register(id)        fulfill(id, v)          await_result(id)
//!  ─────────────▶ Pending ─────────────▶ Ready(v) ─────────────▶ (removed)
//!                   │                                   ▲
//!                   └── purge_pending_older_than ──▶ (removed, orphaned)
//! ```

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryCorrelationStore;
pub use postgres::PostgresCorrelationStore;
pub use store::{await_result, CorrelationStatus, CorrelationStore, StoreError};
