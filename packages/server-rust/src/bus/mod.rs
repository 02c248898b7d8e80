//! Pub/sub transport seam.
//!
//! The bridge never speaks a wire protocol itself. A `BusConnector` opens a
//! `BusConnection` from validated `ConnectOptions`; sessions and stubs only
//! use the connection's subscribe/publish/request primitives.
//!
//! - [`memory`]: process-local bus used by tests and embedded deployments
//! - `nats` (feature `nats`): adapter over the `async-nats` client

pub mod memory;
#[cfg(feature = "nats")]
pub mod nats;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;

use crate::error::ConnectionError;
use crate::options::ConnectOptions;

pub use memory::{ConnectionEvent, InMemoryBus};
#[cfg(feature = "nats")]
pub use nats::NatsConnector;

/// A message delivered by the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub subject: String,
    /// Reply subject chosen by the requester, if it expects an answer.
    pub reply: Option<String>,
    pub payload: Bytes,
}

/// Stream of messages for one subscribed subject. Dropping it unsubscribes.
pub struct Subscription {
    subject: String,
    messages: BoxStream<'static, BusMessage>,
}

impl Subscription {
    #[must_use]
    pub fn new(subject: impl Into<String>, messages: BoxStream<'static, BusMessage>) -> Self {
        Self {
            subject: subject.into(),
            messages,
        }
    }

    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Next message, or `None` once the subscription or its connection closed.
    pub async fn next(&mut self) -> Option<BusMessage> {
        self.messages.next().await
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("subject", &self.subject)
            .finish_non_exhaustive()
    }
}

/// An open bus connection.
#[async_trait]
pub trait BusConnection: Send + Sync {
    /// Subscribes to `subject`. Members of the same `queue_group` share the
    /// subject's messages, each message going to one member.
    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<Subscription, ConnectionError>;

    async fn publish(
        &self,
        subject: &str,
        reply: Option<&str>,
        payload: Bytes,
    ) -> Result<(), ConnectionError>;

    /// Publishes with a private reply subject and waits for the first answer.
    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<BusMessage, ConnectionError>;

    /// Flushes buffered outbound traffic and stops delivery to this
    /// connection's subscriptions.
    async fn drain(&self) -> Result<(), ConnectionError>;

    async fn close(&self) -> Result<(), ConnectionError>;

    fn is_closed(&self) -> bool;
}

/// Opens bus connections.
#[async_trait]
pub trait BusConnector: Send + Sync {
    async fn connect(
        &self,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn BusConnection>, ConnectionError>;
}
