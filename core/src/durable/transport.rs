//! Transport seam for the durable bus.
//!
//! A transport hands out connections; a connection publishes into a stream and
//! manages durable pull consumers on it. Reconnection is driven by
//! [`super::DurableBus`], not by the transport.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Durable bus unreachable or lost.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("durable bus unreachable at {server}: {reason}")]
    Unreachable { server: String, reason: String },

    #[error("connection closed: {0}")]
    Closed(String),

    #[error("connection is reconnecting")]
    Reconnecting,

    #[error("connection manager shut down")]
    Shutdown,

    #[error("publish failed: {0}")]
    Publish(String),
}

/// Pull-consumer creation or pull-loop failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("failed to create consumer {name}: {reason}")]
    ConsumerCreate { name: String, reason: String },

    #[error("consumer not found: {0}")]
    ConsumerNotFound(String),

    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("acknowledgment for seq {seq} failed: {reason}")]
    Ack { seq: u64, reason: String },

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Server acknowledgment of a publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubAck {
    pub stream: String,
    pub seq: u64,
}

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub server: String,
    pub name: String,
}

/// Durable pull consumer definition. Acknowledgment is always explicit.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub durable_name: String,
    /// Empty matches every subject in the stream.
    pub filter_subject: String,
    /// Deliveries allowed per message before it is dropped.
    pub max_deliver: u32,
    /// Unacknowledged deliveries become eligible for redelivery after this.
    pub ack_wait: Duration,
}

/// A message handed out by a pull consumer. Must be acked, nak'd or termed
/// through the consumer that delivered it.
#[derive(Debug, Clone)]
pub struct DeliveredMessage {
    pub subject: String,
    pub payload: Bytes,
    pub stream_seq: u64,
    pub delivery_count: u32,
}

#[async_trait]
pub trait DurableTransport: Send + Sync {
    async fn connect(
        &self,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn DurableConnection>, ConnectionError>;
}

#[async_trait]
pub trait DurableConnection: Send + Sync {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<PubAck, ConnectionError>;

    async fn create_consumer(
        &self,
        config: ConsumerConfig,
    ) -> Result<Arc<dyn PullConsumer>, SubscriptionError>;

    /// Reattach to an existing durable consumer by name.
    async fn bind_consumer(&self, name: &str) -> Result<Arc<dyn PullConsumer>, SubscriptionError>;

    fn is_closed(&self) -> bool;

    /// Resolves once the connection ends: `Some(err)` when it was lost,
    /// `None` when it was closed by this client.
    async fn closed(&self) -> Option<ConnectionError>;

    async fn close(&self);
}

#[async_trait]
pub trait PullConsumer: Send + Sync {
    fn name(&self) -> &str;

    /// Wait up to `expires` for at most `batch` messages. An empty batch is
    /// not an error.
    async fn fetch(
        &self,
        batch: usize,
        expires: Duration,
    ) -> Result<Vec<DeliveredMessage>, SubscriptionError>;

    async fn ack(&self, seq: u64) -> Result<(), SubscriptionError>;

    /// Negative acknowledgment: redeliver.
    async fn nak(&self, seq: u64) -> Result<(), SubscriptionError>;

    /// Terminate: never redeliver.
    async fn term(&self, seq: u64) -> Result<(), SubscriptionError>;

    /// Delete the consumer on the server.
    async fn destroy(&self) -> Result<(), SubscriptionError>;
}
