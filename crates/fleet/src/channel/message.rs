//! MessageChannel trait definition

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

/// Error type for channel operations
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The named channel does not exist
    #[error("channel not found: {0}")]
    NotFound(String),

    /// Receipt handle is unknown or no longer valid
    #[error("invalid receipt handle: {0}")]
    InvalidReceipt(String),

    /// Channel could not be created or reached
    #[error("channel unavailable: {0}")]
    Unavailable(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for ChannelError {
    fn from(e: sqlx::Error) -> Self {
        ChannelError::Database(e.to_string())
    }
}

/// A message to publish
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundMessage {
    pub body: String,
    pub attributes: BTreeMap<String, String>,
}

impl OutboundMessage {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Attach a string attribute (message metadata)
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// A message handed out by [`MessageChannel::receive`]
///
/// The message stays invisible to other receivers until its visibility
/// timeout expires; deleting it with the receipt handle removes it for good.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Id assigned by the channel on send
    pub message_id: String,
    /// Handle for deleting this particular delivery
    pub receipt_handle: String,
    pub body: String,
    pub attributes: BTreeMap<String, String>,
    /// How many times this message has been delivered, including this one
    pub receive_count: u32,
}

impl ReceivedMessage {
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

/// A named, at-least-once message queue
///
/// This trait defines the boundary to the job and reply channels.
/// Implementations must be thread-safe and support concurrent access.
#[async_trait]
pub trait MessageChannel: Send + Sync + 'static {
    /// Channel name
    fn name(&self) -> &str;

    /// Create the channel if it does not exist yet
    async fn ensure_exists(&self) -> Result<(), ChannelError>;

    /// Publish a message, returning the channel-assigned message id
    async fn send(&self, message: OutboundMessage) -> Result<String, ChannelError>;

    /// Receive up to `max_messages`, waiting up to `wait` for at least one
    ///
    /// Returns an empty batch when nothing arrived in time.
    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, ChannelError>;

    /// Delete a received message
    async fn delete(&self, receipt_handle: &str) -> Result<(), ChannelError>;

    /// Approximate number of messages currently available for receive
    async fn approximate_depth(&self) -> Result<usize, ChannelError>;
}
