//! Reply channel ingest loop
//!
//! Drains worker replies and fulfills the matching correlation entries. A
//! reply is deleted only after its fulfillment succeeded, so a crash in
//! between leads to redelivery and an idempotent overwrite.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::channel::{ChannelError, MessageChannel, ReceivedMessage};
use crate::correlation::CorrelationStore;
use crate::job::Reply;

/// Ingest loop configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Maximum replies per receive
    pub batch_size: usize,

    /// Long-poll wait per receive
    #[serde(with = "crate::config::duration_millis")]
    pub wait: Duration,

    /// Pause after an empty or failed receive
    #[serde(with = "crate::config::duration_millis")]
    pub idle: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            wait: Duration::from_secs(20),
            idle: Duration::from_secs(1),
        }
    }
}

impl IngestConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    pub fn with_idle(mut self, idle: Duration) -> Self {
        self.idle = idle;
        self
    }
}

/// Ingest errors
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("reply channel error: {0}")]
    Channel(#[from] ChannelError),
}

/// What one ingest cycle did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub received: usize,
    /// Fulfilled and deleted
    pub fulfilled: usize,
    /// Deleted without fulfilling (no origin attribute)
    pub dropped: usize,
    /// Left on the channel for redelivery
    pub retained: usize,
}

/// Moves replies from the reply channel into the correlation store
pub struct ResultIngestLoop {
    replies: Arc<dyn MessageChannel>,
    store: Arc<dyn CorrelationStore>,
    config: IngestConfig,
}

impl ResultIngestLoop {
    pub fn new(
        replies: Arc<dyn MessageChannel>,
        store: Arc<dyn CorrelationStore>,
        config: IngestConfig,
    ) -> Self {
        Self {
            replies,
            store,
            config,
        }
    }

    /// Receive one batch and process every reply in receive order
    #[instrument(skip(self), fields(channel = %self.replies.name()))]
    pub async fn run_cycle(&self) -> Result<IngestStats, IngestError> {
        let batch = self.receive().await?;
        Ok(self.process_batch(batch).await)
    }

    async fn receive(&self) -> Result<Vec<ReceivedMessage>, ChannelError> {
        self.replies
            .receive(self.config.batch_size, self.config.wait)
            .await
    }

    async fn process_batch(&self, batch: Vec<ReceivedMessage>) -> IngestStats {
        let mut stats = IngestStats {
            received: batch.len(),
            ..Default::default()
        };

        for message in batch {
            self.ingest_one(&message, &mut stats).await;
        }

        if stats.received > 0 {
            debug!(
                received = stats.received,
                fulfilled = stats.fulfilled,
                dropped = stats.dropped,
                retained = stats.retained,
                "ingested replies"
            );
        }
        stats
    }

    async fn ingest_one(&self, message: &ReceivedMessage, stats: &mut IngestStats) {
        let reply = match Reply::from_message(message) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(message_id = %message.message_id, "Dropping reply: {}", e);
                match self.replies.delete(&message.receipt_handle).await {
                    Ok(()) => stats.dropped += 1,
                    Err(e) => {
                        error!(message_id = %message.message_id, "Failed to delete reply: {}", e);
                        stats.retained += 1;
                    }
                }
                return;
            }
        };

        if let Err(e) = self.store.fulfill(reply.origin.as_str(), &reply.body).await {
            error!(correlation_id = %reply.origin, "Failed to fulfill correlation: {}", e);
            stats.retained += 1;
            return;
        }

        match self.replies.delete(&message.receipt_handle).await {
            Ok(()) => stats.fulfilled += 1,
            Err(e) => {
                // Fulfilled already; a redelivery overwrites with the same value
                warn!(correlation_id = %reply.origin, "Failed to delete reply: {}", e);
                stats.retained += 1;
            }
        }
    }

    /// Run cycles until `shutdown_rx` flips to true
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(channel = %self.replies.name(), "result ingest started");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            // Only the receive is cancelled by shutdown; a received batch is
            // always processed to the end
            let received = tokio::select! {
                received = self.receive() => received,
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let idle = match received {
                Ok(batch) => self.process_batch(batch).await.received == 0,
                Err(e) => {
                    error!("Ingest cycle failed: {}", e);
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.idle) => {}
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        info!("result ingest stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{InMemoryChannel, OutboundMessage};
    use crate::correlation::{CorrelationStatus, InMemoryCorrelationStore, StoreError};
    use crate::job::{CorrelationId, ORIGIN_MESSAGE_ATTRIBUTE};
    use async_trait::async_trait;

    fn setup() -> (Arc<InMemoryChannel>, Arc<InMemoryCorrelationStore>, ResultIngestLoop) {
        let replies = Arc::new(InMemoryChannel::new("replies"));
        let store = Arc::new(InMemoryCorrelationStore::new());
        let ingest = ResultIngestLoop::new(
            replies.clone(),
            store.clone(),
            IngestConfig::default().with_wait(Duration::ZERO),
        );
        (replies, store, ingest)
    }

    #[tokio::test]
    async fn test_fulfills_and_deletes() {
        let (replies, store, ingest) = setup();
        store.register("job-1").await.unwrap();
        replies
            .send(Reply::labeled(CorrelationId::new("job-1"), "cat.jpg", "feline").to_message())
            .await
            .unwrap();

        let stats = ingest.run_cycle().await.unwrap();

        assert_eq!(stats.fulfilled, 1);
        assert_eq!(
            store.status("job-1").await.unwrap(),
            Some(CorrelationStatus::Ready("cat,feline".into()))
        );
        assert!(replies.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_origin_is_created_ready() {
        let (replies, store, ingest) = setup();
        replies
            .send(OutboundMessage::new("dog,canine").with_attribute(ORIGIN_MESSAGE_ATTRIBUTE, "late"))
            .await
            .unwrap();

        ingest.run_cycle().await.unwrap();
        assert_eq!(
            store.status("late").await.unwrap(),
            Some(CorrelationStatus::Ready("dog,canine".into()))
        );
    }

    #[tokio::test]
    async fn test_poison_reply_dropped() {
        let (replies, store, ingest) = setup();
        replies.send(OutboundMessage::new("no origin")).await.unwrap();

        let stats = ingest.run_cycle().await.unwrap();

        assert_eq!(stats.dropped, 1);
        assert!(replies.is_empty());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_empty_receive() {
        let (_replies, _store, ingest) = setup();
        assert_eq!(ingest.run_cycle().await.unwrap(), IngestStats::default());
    }

    struct FailingStore;

    #[async_trait]
    impl CorrelationStore for FailingStore {
        async fn register(&self, _id: &str) -> Result<(), StoreError> {
            Ok(())
        }
        async fn fulfill(&self, _id: &str, _value: &str) -> Result<(), StoreError> {
            Err(StoreError::Database("connection reset".into()))
        }
        async fn status(&self, _id: &str) -> Result<Option<CorrelationStatus>, StoreError> {
            Ok(None)
        }
        async fn take_ready(&self, _id: &str) -> Result<Option<String>, StoreError> {
            Ok(None)
        }
        async fn remove(&self, _id: &str) -> Result<bool, StoreError> {
            Ok(false)
        }
        async fn purge_pending_older_than(&self, _age: Duration) -> Result<usize, StoreError> {
            Ok(0)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fulfill_failure_keeps_reply() {
        let replies = Arc::new(InMemoryChannel::new("replies").with_visibility_timeout(Duration::from_secs(5)));
        let ingest = ResultIngestLoop::new(
            replies.clone(),
            Arc::new(FailingStore),
            IngestConfig::default().with_wait(Duration::ZERO),
        );
        replies
            .send(OutboundMessage::new("cat,feline").with_attribute(ORIGIN_MESSAGE_ATTRIBUTE, "job-1"))
            .await
            .unwrap();

        let stats = ingest.run_cycle().await.unwrap();
        assert_eq!(stats.retained, 1);
        assert_eq!(replies.len(), 1);

        tokio::time::advance(Duration::from_secs(6)).await;
        let redelivered = replies.receive(1, Duration::ZERO).await.unwrap();
        assert_eq!(redelivered[0].receive_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_processes_until_shutdown() {
        let replies = Arc::new(InMemoryChannel::new("replies"));
        let store = Arc::new(InMemoryCorrelationStore::new());
        let ingest = ResultIngestLoop::new(replies.clone(), store.clone(), IngestConfig::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(ingest.run(shutdown_rx));

        replies
            .send(OutboundMessage::new("cat,feline").with_attribute(ORIGIN_MESSAGE_ATTRIBUTE, "job-9"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.status("job-9").await.unwrap().is_some());

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    /// Fulfills after a fixed delay
    struct SlowStore {
        inner: InMemoryCorrelationStore,
        delay: Duration,
    }

    #[async_trait]
    impl CorrelationStore for SlowStore {
        async fn register(&self, id: &str) -> Result<(), StoreError> {
            self.inner.register(id).await
        }
        async fn fulfill(&self, id: &str, value: &str) -> Result<(), StoreError> {
            tokio::time::sleep(self.delay).await;
            self.inner.fulfill(id, value).await
        }
        async fn status(&self, id: &str) -> Result<Option<CorrelationStatus>, StoreError> {
            self.inner.status(id).await
        }
        async fn take_ready(&self, id: &str) -> Result<Option<String>, StoreError> {
            self.inner.take_ready(id).await
        }
        async fn remove(&self, id: &str) -> Result<bool, StoreError> {
            self.inner.remove(id).await
        }
        async fn purge_pending_older_than(&self, age: Duration) -> Result<usize, StoreError> {
            self.inner.purge_pending_older_than(age).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_finishes_received_batch() {
        let replies = Arc::new(InMemoryChannel::new("replies"));
        let store = Arc::new(SlowStore {
            inner: InMemoryCorrelationStore::new(),
            delay: Duration::from_secs(2),
        });
        let ingest = ResultIngestLoop::new(replies.clone(), store.clone(), IngestConfig::default());

        for id in ["job-1", "job-2", "job-3"] {
            replies
                .send(Reply::labeled(CorrelationId::new(id), "cat.jpg", "feline").to_message())
                .await
                .unwrap();
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(ingest.run(shutdown_rx));

        // Mid-way through the second fulfill
        tokio::time::sleep(Duration::from_secs(3)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        for id in ["job-1", "job-2", "job-3"] {
            assert_eq!(
                store.status(id).await.unwrap(),
                Some(CorrelationStatus::Ready("cat,feline".into()))
            );
        }
        assert!(replies.is_empty());
        assert_eq!(replies.in_flight(), 0);
    }
}
