//! In-memory implementation of MessageChannel for testing and dev mode

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use super::message::*;

struct StoredMessage {
    id: String,
    body: String,
    attributes: BTreeMap<String, String>,
    visible_at: Instant,
    receipt_handle: Option<String>,
    receive_count: u32,
}

/// In-memory implementation of MessageChannel
///
/// Mirrors the queue semantics the fleet relies on: FIFO delivery,
/// long-polling receive, per-delivery receipt handles and a visibility
/// timeout after which undeleted messages are delivered again.
///
/// # Example
///
/// ```
/// use labelq_fleet::InMemoryChannel;
///
/// let jobs = InMemoryChannel::new("jobs");
/// assert_eq!(jobs.len(), 0);
/// ```
pub struct InMemoryChannel {
    name: String,
    visibility_timeout: Duration,
    messages: Mutex<VecDeque<StoredMessage>>,
    arrivals: Notify,
    unavailable: AtomicBool,
}

impl InMemoryChannel {
    /// Default visibility timeout for received messages
    pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

    /// Create a new empty channel
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            visibility_timeout: Self::DEFAULT_VISIBILITY_TIMEOUT,
            messages: Mutex::new(VecDeque::new()),
            arrivals: Notify::new(),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Set the visibility timeout
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Make every call fail as if the backing service were unreachable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    /// Total messages held, visible or in flight
    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }

    /// Messages received but neither deleted nor returned to the queue yet
    pub fn in_flight(&self) -> usize {
        let now = Instant::now();
        self.messages
            .lock()
            .iter()
            .filter(|m| m.visible_at > now)
            .count()
    }

    fn check_available(&self) -> Result<(), ChannelError> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(ChannelError::Unavailable(self.name.clone()));
        }
        Ok(())
    }

    /// Claim up to `max` visible messages, or report when the next one unhides
    fn claim(&self, max: usize) -> (Vec<ReceivedMessage>, Option<Instant>) {
        let now = Instant::now();
        let mut messages = self.messages.lock();
        let mut claimed = Vec::new();
        let mut next_visible: Option<Instant> = None;

        for message in messages.iter_mut() {
            if message.visible_at > now {
                next_visible = Some(match next_visible {
                    Some(t) => t.min(message.visible_at),
                    None => message.visible_at,
                });
                continue;
            }
            if claimed.len() >= max {
                break;
            }

            let receipt_handle = Uuid::now_v7().to_string();
            message.visible_at = now + self.visibility_timeout;
            message.receipt_handle = Some(receipt_handle.clone());
            message.receive_count += 1;

            claimed.push(ReceivedMessage {
                message_id: message.id.clone(),
                receipt_handle,
                body: message.body.clone(),
                attributes: message.attributes.clone(),
                receive_count: message.receive_count,
            });
        }

        (claimed, next_visible)
    }
}

#[async_trait]
impl MessageChannel for InMemoryChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ensure_exists(&self) -> Result<(), ChannelError> {
        self.check_available()
    }

    async fn send(&self, message: OutboundMessage) -> Result<String, ChannelError> {
        self.check_available()?;

        let id = Uuid::now_v7().to_string();
        self.messages.lock().push_back(StoredMessage {
            id: id.clone(),
            body: message.body,
            attributes: message.attributes,
            visible_at: Instant::now(),
            receipt_handle: None,
            receive_count: 0,
        });
        self.arrivals.notify_waiters();

        Ok(id)
    }

    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, ChannelError> {
        self.check_available()?;

        let max_messages = max_messages.max(1);
        let deadline = Instant::now() + wait;

        loop {
            // Register interest before looking so a concurrent send is not missed
            let arrival = self.arrivals.notified();

            let (claimed, next_visible) = self.claim(max_messages);
            if !claimed.is_empty() {
                return Ok(claimed);
            }

            if Instant::now() >= deadline {
                return Ok(vec![]);
            }

            let wake_at = next_visible.map_or(deadline, |t| t.min(deadline));
            tokio::select! {
                _ = arrival => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), ChannelError> {
        self.check_available()?;

        let mut messages = self.messages.lock();
        let position = messages
            .iter()
            .position(|m| m.receipt_handle.as_deref() == Some(receipt_handle))
            .ok_or_else(|| ChannelError::InvalidReceipt(receipt_handle.to_string()))?;
        messages.remove(position);
        Ok(())
    }

    async fn approximate_depth(&self) -> Result<usize, ChannelError> {
        self.check_available()?;

        let now = Instant::now();
        Ok(self
            .messages
            .lock()
            .iter()
            .filter(|m| m.visible_at <= now)
            .count())
    }
}
