//! CorrelationStore trait definition

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, trace};

/// Error type for correlation store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Migration error
    #[error("migration error: {0}")]
    Migration(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// State of a single correlation entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum CorrelationStatus {
    /// Job dispatched, no reply yet
    Pending,

    /// Reply received
    Ready(String),
}

impl CorrelationStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }
}

impl std::fmt::Display for CorrelationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Ready(_) => write!(f, "ready"),
        }
    }
}

/// Durable map from correlation id to result status
///
/// Implementations must be safe for many concurrent waiters interleaved with
/// a single fulfill stream. Each operation is atomic for its key.
#[async_trait]
pub trait CorrelationStore: Send + Sync + 'static {
    /// Create a Pending entry for `id`
    ///
    /// Registering an id twice never duplicates it. An entry that is already
    /// Ready keeps its value, so a reply that raced ahead of registration is
    /// not lost.
    async fn register(&self, id: &str) -> Result<(), StoreError>;

    /// Set the entry to Ready(value), creating it when unknown
    ///
    /// Redelivered replies overwrite; the last write wins.
    async fn fulfill(&self, id: &str, value: &str) -> Result<(), StoreError>;

    /// Current status of an entry, `None` when absent
    async fn status(&self, id: &str) -> Result<Option<CorrelationStatus>, StoreError>;

    /// Remove the entry only if it is Ready, returning the value
    ///
    /// This is the single-consumption step: of two concurrent callers at most
    /// one receives the value.
    async fn take_ready(&self, id: &str) -> Result<Option<String>, StoreError>;

    /// Remove the entry regardless of status. Returns whether it existed.
    async fn remove(&self, id: &str) -> Result<bool, StoreError>;

    /// Delete Pending entries registered more than `age` ago
    async fn purge_pending_older_than(&self, age: Duration) -> Result<usize, StoreError>;
}

/// Wait until `id` is Ready or `timeout` elapses
///
/// Polls the store every `poll_interval`. On Ready the entry is consumed and
/// its value returned. On timeout the entry is left untouched and `None` is
/// returned; this never happens before `timeout` has fully elapsed.
pub async fn await_result(
    store: &dyn CorrelationStore,
    id: &str,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<Option<String>, StoreError> {
    let deadline = Instant::now() + timeout;
    let poll_interval = poll_interval.max(Duration::from_millis(1));

    loop {
        if let Some(value) = store.take_ready(id).await? {
            debug!(correlation_id = %id, "correlation fulfilled");
            return Ok(Some(value));
        }

        let now = Instant::now();
        if now >= deadline {
            debug!(correlation_id = %id, ?timeout, "no result before timeout");
            return Ok(None);
        }

        trace!(correlation_id = %id, "still pending");
        tokio::time::sleep_until((now + poll_interval).min(deadline)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(CorrelationStatus::Pending.to_string(), "pending");
        assert_eq!(CorrelationStatus::Ready("x".into()).to_string(), "ready");
        assert!(CorrelationStatus::Ready(String::new()).is_ready());
        assert!(!CorrelationStatus::Pending.is_ready());
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_value(CorrelationStatus::Ready("cat,feline".into())).unwrap();
        assert_eq!(json["status"], "ready");
        assert_eq!(json["value"], "cat,feline");
    }
}
