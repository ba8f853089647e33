//! Message channels
//!
//! This module provides:
//! - [`MessageChannel`] trait for the job and reply queues
//! - [`InMemoryChannel`] for testing and dev mode
//! - [`PostgresChannel`] for production
//!
//! Both channels carry text bodies plus string attributes. Jobs travel as
//! base64 bodies with a `filename` attribute, replies as `"<name>,<label>"`
//! with an `OriginMessage` attribute naming the job they answer.

mod memory;
mod message;
mod postgres;

pub use memory::InMemoryChannel;
pub use message::{ChannelError, MessageChannel, OutboundMessage, ReceivedMessage};
pub use postgres::PostgresChannel;
