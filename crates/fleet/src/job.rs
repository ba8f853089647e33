//! Job and reply wire format
//!
//! ```text
//! job   : body = base64(payload)       attributes = { filename: "cat.jpg" }
//! reply : body = "cat,feline"          attributes = { OriginMessage: <job message id> }
//! ```

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::channel::{OutboundMessage, ReceivedMessage};

/// Job attribute carrying the original file name
pub const FILENAME_ATTRIBUTE: &str = "filename";

/// Reply attribute carrying the correlation id of the originating job
pub const ORIGIN_MESSAGE_ATTRIBUTE: &str = "OriginMessage";

/// Wire format errors
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("message is missing the {0} attribute")]
    MissingAttribute(&'static str),

    #[error("invalid job payload: {0}")]
    InvalidPayload(String),

    #[error("malformed reply body: {0:?}")]
    MalformedReply(String),
}

/// Identifier pairing a job with its reply (the job's channel message id)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CorrelationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A unit of work: an image and its display name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub payload: Vec<u8>,
    pub name: String,
}

impl Job {
    pub fn new(payload: impl Into<Vec<u8>>, name: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            name: name.into(),
        }
    }

    /// Encode for the job channel
    pub fn to_message(&self) -> OutboundMessage {
        OutboundMessage::new(STANDARD.encode(&self.payload))
            .with_attribute(FILENAME_ATTRIBUTE, &self.name)
    }

    /// Decode a received job message
    pub fn from_message(message: &ReceivedMessage) -> Result<Self, WireError> {
        let name = message
            .attribute(FILENAME_ATTRIBUTE)
            .ok_or(WireError::MissingAttribute(FILENAME_ATTRIBUTE))?;
        let payload = STANDARD
            .decode(message.body.trim())
            .map_err(|e| WireError::InvalidPayload(e.to_string()))?;

        Ok(Self::new(payload, name))
    }

    /// File name without its extension (`"cat.jpg"` → `"cat"`)
    pub fn stem(&self) -> &str {
        image_stem(&self.name)
    }
}

/// A worker's answer to one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub origin: CorrelationId,
    pub body: String,
}

impl Reply {
    /// Build the reply body `"<image stem>,<label>"`
    pub fn labeled(origin: CorrelationId, image_name: &str, label: &str) -> Self {
        Self {
            origin,
            body: format!("{},{}", image_stem(image_name), label),
        }
    }

    /// Encode for the reply channel
    pub fn to_message(&self) -> OutboundMessage {
        OutboundMessage::new(&self.body).with_attribute(ORIGIN_MESSAGE_ATTRIBUTE, self.origin.as_str())
    }

    /// Decode a received reply message
    pub fn from_message(message: &ReceivedMessage) -> Result<Self, WireError> {
        let origin = message
            .attribute(ORIGIN_MESSAGE_ATTRIBUTE)
            .ok_or(WireError::MissingAttribute(ORIGIN_MESSAGE_ATTRIBUTE))?;

        Ok(Self {
            origin: CorrelationId::new(origin),
            body: message.body.clone(),
        })
    }
}

/// Extract the label from a reply body `"<name>,<label>"`
pub fn parse_label(body: &str) -> Result<&str, WireError> {
    body.split_once(',')
        .map(|(_, label)| label.trim())
        .ok_or_else(|| WireError::MalformedReply(body.to_string()))
}

/// Everything before the first `.` of a file name
pub fn image_stem(name: &str) -> &str {
    name.split('.').next().unwrap_or(name)
}
