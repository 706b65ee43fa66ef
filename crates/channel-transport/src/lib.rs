//! Transport primitive for topic-addressed duplex channels.
//!
//! A [`Transport`] opens one [`ChannelHandle`] per topic. Handles are joined
//! once, carry request/response pushes, and fan server-initiated events out
//! to callbacks registered with [`ChannelHandle::on`]. Every registration
//! hands back a [`HandlerRef`] so the exact callback can be removed later
//! without disturbing other listeners on the same event name.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub mod local;

pub use local::{HandlerStats, LocalTransport};

/// Untyped JSON payload as it crosses the wire.
pub type Payload = Value;

/// Callback invoked for every server push of a registered event.
pub type EventCallback = Arc<dyn Fn(&Payload) + Send + Sync>;

/// Raw reply to a join or push, before any interpretation.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ok(Payload),
    Error(Payload),
    Timeout,
}

/// Identity of one registered callback on one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerRef(u64);

impl HandlerRef {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("channel {0} has been left")]
    Left(String),
    #[error("no open channel for topic {0}")]
    NoChannel(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

pub trait Transport: Send + Sync {
    /// Creates the channel object for `topic`. Does not talk to the server;
    /// the caller decides when to [`ChannelHandle::join`].
    fn open(&self, topic: &str, params: &Payload) -> Arc<dyn ChannelHandle>;
}

#[async_trait]
pub trait ChannelHandle: Send + Sync {
    fn topic(&self) -> &str;

    async fn join(&self) -> Reply;

    fn on(&self, event: &str, callback: EventCallback) -> HandlerRef;

    fn off(&self, event: &str, handler: HandlerRef);

    async fn push(&self, event: &str, payload: Payload) -> Reply;

    fn leave(&self);
}
