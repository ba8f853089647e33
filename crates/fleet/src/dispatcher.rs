//! Job submission and result retrieval
//!
//! ```text
//!  submit(payload, name) ──► job channel ──► message id == CorrelationId
//!                                                 │
//!                                           register(id)
//!
//!  fetch(id, timeout) ──► await_result ──► "cat,feline" ──► "feline"
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::channel::{ChannelError, MessageChannel};
use crate::correlation::{await_result, CorrelationStore, StoreError};
use crate::job::{parse_label, CorrelationId, Job, WireError};

/// Dispatcher configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// How long a caller waits for a result
    #[serde(with = "crate::config::duration_millis")]
    pub timeout: Duration,

    /// Correlation store poll interval while waiting
    #[serde(with = "crate::config::duration_millis")]
    pub poll_interval: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(600),
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl DispatchConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Dispatch errors
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("failed to publish job: {0}")]
    Channel(#[from] ChannelError),

    #[error("correlation store error: {0}")]
    Store(#[from] StoreError),

    #[error("invalid reply: {0}")]
    Reply(#[from] WireError),
}

/// Publishes jobs and waits for their results
pub struct Dispatcher {
    jobs: Arc<dyn MessageChannel>,
    store: Arc<dyn CorrelationStore>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        jobs: Arc<dyn MessageChannel>,
        store: Arc<dyn CorrelationStore>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            jobs,
            store,
            config,
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Publish a job and register its correlation entry
    #[instrument(skip(self, payload), fields(name = %name, size = payload.len()))]
    pub async fn submit(&self, payload: &[u8], name: &str) -> Result<CorrelationId, DispatchError> {
        let message = Job::new(payload, name).to_message();
        let id = CorrelationId::new(self.jobs.send(message).await?);
        self.store.register(id.as_str()).await?;

        debug!(correlation_id = %id, "job submitted");
        Ok(id)
    }

    /// Wait up to `timeout` for the job's label
    ///
    /// `Ok(None)` means no result arrived in time; the entry stays pending.
    #[instrument(skip(self), fields(correlation_id = %id))]
    pub async fn fetch(
        &self,
        id: &CorrelationId,
        timeout: Duration,
    ) -> Result<Option<String>, DispatchError> {
        let reply = await_result(
            self.store.as_ref(),
            id.as_str(),
            timeout,
            self.config.poll_interval,
        )
        .await?;

        match reply {
            Some(body) => Ok(Some(parse_label(&body)?.to_string())),
            None => {
                info!(?timeout, "no result before timeout");
                Ok(None)
            }
        }
    }

    /// Submit, then fetch with the configured timeout
    pub async fn dispatch(&self, payload: &[u8], name: &str) -> Result<Option<String>, DispatchError> {
        let id = self.submit(payload, name).await?;
        self.fetch(&id, self.config.timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::InMemoryChannel;
    use crate::correlation::{CorrelationStatus, InMemoryCorrelationStore};
    use crate::ingest::{IngestConfig, ResultIngestLoop};
    use crate::job::{Job, Reply};

    fn dispatcher() -> (Arc<InMemoryChannel>, Arc<InMemoryCorrelationStore>, Dispatcher) {
        let jobs = Arc::new(InMemoryChannel::new("jobs"));
        let store = Arc::new(InMemoryCorrelationStore::new());
        let dispatcher = Dispatcher::new(jobs.clone(), store.clone(), DispatchConfig::default());
        (jobs, store, dispatcher)
    }

    #[tokio::test]
    async fn test_submit_publishes_and_registers() {
        let (jobs, store, dispatcher) = dispatcher();

        let id = dispatcher.submit(b"\x89PNG", "cat.jpg").await.unwrap();

        let received = jobs.receive(1, Duration::ZERO).await.unwrap();
        assert_eq!(received[0].message_id, id.as_str());
        let job = Job::from_message(&received[0]).unwrap();
        assert_eq!(job.payload, b"\x89PNG");
        assert_eq!(job.name, "cat.jpg");
        assert_eq!(
            store.status(id.as_str()).await.unwrap(),
            Some(CorrelationStatus::Pending)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_label() {
        let (jobs, store, dispatcher) = dispatcher();
        let replies = Arc::new(InMemoryChannel::new("replies"));
        let ingest = ResultIngestLoop::new(
            replies.clone(),
            store.clone(),
            IngestConfig::default().with_wait(Duration::ZERO),
        );

        let id = dispatcher.submit(b"image-bytes", "cat.jpg").await.unwrap();

        // A worker answers the job
        let job_message = jobs.receive(1, Duration::ZERO).await.unwrap().remove(0);
        let job = Job::from_message(&job_message).unwrap();
        let origin = CorrelationId::new(job_message.message_id.clone());
        replies
            .send(Reply::labeled(origin, &job.name, "feline").to_message())
            .await
            .unwrap();
        jobs.delete(&job_message.receipt_handle).await.unwrap();

        ingest.run_cycle().await.unwrap();

        let label = dispatcher.fetch(&id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(label.as_deref(), Some("feline"));
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_timeout_leaves_pending() {
        let (_jobs, store, dispatcher) = dispatcher();
        let id = dispatcher.submit(b"x", "dog.png").await.unwrap();

        let started = tokio::time::Instant::now();
        let label = dispatcher.fetch(&id, Duration::from_secs(3)).await.unwrap();

        assert!(label.is_none());
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(store.pending_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_malformed_reply() {
        let (_jobs, store, dispatcher) = dispatcher();
        let id = dispatcher.submit(b"x", "dog.png").await.unwrap();
        store.fulfill(id.as_str(), "no comma here").await.unwrap();

        assert!(matches!(
            dispatcher.fetch(&id, Duration::from_secs(1)).await,
            Err(DispatchError::Reply(WireError::MalformedReply(_)))
        ));
    }

    #[tokio::test]
    async fn test_submit_channel_failure() {
        let (jobs, store, dispatcher) = dispatcher();
        jobs.set_unavailable(true);

        assert!(matches!(
            dispatcher.submit(b"x", "a.jpg").await,
            Err(DispatchError::Channel(_))
        ));
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_waits_for_concurrent_reply() {
        let (jobs, store, dispatcher) = dispatcher();
        let dispatcher = Arc::new(dispatcher);

        let waiter = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.dispatch(b"bytes", "owl.gif").await })
        };

        // Let the waiter publish its job
        tokio::time::sleep(Duration::from_secs(1)).await;
        let job_message = jobs.receive(1, Duration::ZERO).await.unwrap().remove(0);
        store
            .fulfill(&job_message.message_id, "owl,bird")
            .await
            .unwrap();

        let label = waiter.await.unwrap().unwrap();
        assert_eq!(label.as_deref(), Some("bird"));
    }
}
