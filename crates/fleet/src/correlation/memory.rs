//! In-memory implementation of CorrelationStore for testing and dev mode

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::time::Instant;

use super::store::*;

struct Entry {
    status: CorrelationStatus,
    registered_at: Instant,
}

/// In-memory implementation of CorrelationStore
///
/// Same semantics as the PostgreSQL implementation, but entries do not
/// survive a restart.
///
/// # Example
///
/// ```
/// use labelq_fleet::InMemoryCorrelationStore;
///
/// let store = InMemoryCorrelationStore::new();
/// assert!(store.is_empty());
/// ```
pub struct InMemoryCorrelationStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl InMemoryCorrelationStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Number of entries, pending or ready
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Number of entries still waiting for a reply
    pub fn pending_count(&self) -> usize {
        self.entries
            .read()
            .values()
            .filter(|e| e.status == CorrelationStatus::Pending)
            .count()
    }
}

impl Default for InMemoryCorrelationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CorrelationStore for InMemoryCorrelationStore {
    async fn register(&self, id: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.write();
        entries.entry(id.to_string()).or_insert_with(|| Entry {
            status: CorrelationStatus::Pending,
            registered_at: Instant::now(),
        });
        Ok(())
    }

    async fn fulfill(&self, id: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.write();
        let entry = entries.entry(id.to_string()).or_insert_with(|| Entry {
            status: CorrelationStatus::Pending,
            registered_at: Instant::now(),
        });
        entry.status = CorrelationStatus::Ready(value.to_string());
        Ok(())
    }

    async fn status(&self, id: &str) -> Result<Option<CorrelationStatus>, StoreError> {
        Ok(self.entries.read().get(id).map(|e| e.status.clone()))
    }

    async fn take_ready(&self, id: &str) -> Result<Option<String>, StoreError> {
        let mut entries = self.entries.write();
        if !matches!(entries.get(id), Some(e) if e.status.is_ready()) {
            return Ok(None);
        }
        match entries.remove(id).map(|e| e.status) {
            Some(CorrelationStatus::Ready(value)) => Ok(Some(value)),
            _ => Ok(None),
        }
    }

    async fn remove(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.entries.write().remove(id).is_some())
    }

    async fn purge_pending_older_than(&self, age: Duration) -> Result<usize, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| {
            e.status.is_ready() || now.saturating_duration_since(e.registered_at) < age
        });
        Ok(before - entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::correlation::await_result;

    const POLL: Duration = Duration::from_millis(500);

    #[tokio::test(start_paused = true)]
    async fn test_await_times_out_no_earlier_than_timeout() {
        let store = InMemoryCorrelationStore::new();
        store.register("msg-1").await.unwrap();

        let started = Instant::now();
        let timeout = Duration::from_secs(3);
        let result = await_result(&store, "msg-1", timeout, POLL).await.unwrap();

        assert_eq!(result, None);
        assert!(started.elapsed() >= timeout);
        // Entry is left pending for a later poll
        assert_eq!(
            store.status("msg-1").await.unwrap(),
            Some(CorrelationStatus::Pending)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_not_multiple_of_poll_interval() {
        let store = InMemoryCorrelationStore::new();
        store.register("msg-1").await.unwrap();

        let started = Instant::now();
        let timeout = Duration::from_millis(1_250);
        let result = await_result(&store, "msg-1", timeout, POLL).await.unwrap();

        assert_eq!(result, None);
        assert!(started.elapsed() >= timeout);
        assert!(started.elapsed() < timeout + POLL);
    }

    #[tokio::test]
    async fn test_fulfill_then_await_consumes_entry() {
        let store = InMemoryCorrelationStore::new();
        store.register("msg-1").await.unwrap();
        store.fulfill("msg-1", "cat,feline").await.unwrap();

        let result = await_result(&store, "msg-1", Duration::from_secs(1), POLL)
            .await
            .unwrap();

        assert_eq!(result.as_deref(), Some("cat,feline"));
        assert_eq!(store.status("msg-1").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_double_fulfill_last_write_wins() {
        let store = InMemoryCorrelationStore::new();
        store.register("msg-1").await.unwrap();
        store.fulfill("msg-1", "cat,feline").await.unwrap();
        store.fulfill("msg-1", "cat,tabby").await.unwrap();

        let result = store.take_ready("msg-1").await.unwrap();
        assert_eq!(result.as_deref(), Some("cat,tabby"));
    }

    #[tokio::test]
    async fn test_fulfill_unknown_id_creates_ready_entry() {
        let store = InMemoryCorrelationStore::new();
        store.fulfill("early", "dog,canine").await.unwrap();

        assert_eq!(
            store.status("early").await.unwrap(),
            Some(CorrelationStatus::Ready("dog,canine".into()))
        );

        // Late registration does not clobber the reply
        store.register("early").await.unwrap();
        assert_eq!(
            store.take_ready("early").await.unwrap().as_deref(),
            Some("dog,canine")
        );
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let store = InMemoryCorrelationStore::new();
        store.register("msg-1").await.unwrap();
        store.register("msg-1").await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_result_is_distinct_from_pending() {
        let store = InMemoryCorrelationStore::new();
        store.register("msg-1").await.unwrap();
        store.fulfill("msg-1", "").await.unwrap();

        assert_eq!(store.take_ready("msg-1").await.unwrap().as_deref(), Some(""));
    }

    #[tokio::test]
    async fn test_take_ready_is_single_consumption() {
        let store = InMemoryCorrelationStore::new();
        store.fulfill("msg-1", "v").await.unwrap();

        assert_eq!(store.take_ready("msg-1").await.unwrap().as_deref(), Some("v"));
        assert_eq!(store.take_ready("msg-1").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_waiters_each_get_their_own_reply() {
        let store = Arc::new(InMemoryCorrelationStore::new());
        let mut handles = Vec::new();

        for i in 0..16 {
            let id = format!("msg-{i}");
            store.register(&id).await.unwrap();
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                await_result(store.as_ref(), &id, Duration::from_secs(30), POLL).await
            }));
        }

        tokio::time::sleep(Duration::from_secs(2)).await;
        for i in (0..16).rev() {
            store
                .fulfill(&format!("msg-{i}"), &format!("img{i},label{i}"))
                .await
                .unwrap();
        }

        for (i, handle) in handles.into_iter().enumerate() {
            let value = handle.await.unwrap().unwrap();
            assert_eq!(value, Some(format!("img{i},label{i}")));
        }
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_pending_older_than() {
        let store = InMemoryCorrelationStore::new();
        store.register("old").await.unwrap();
        store.fulfill("ready", "x,y").await.unwrap();

        tokio::time::advance(Duration::from_secs(120)).await;
        store.register("fresh").await.unwrap();

        let purged = store
            .purge_pending_older_than(Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(purged, 1);
        assert_eq!(store.status("old").await.unwrap(), None);
        assert!(store.status("fresh").await.unwrap().is_some());
        assert!(store.status("ready").await.unwrap().is_some());
    }
}
