//! Topic broker integration.
//!
//! This module contains:
//! - `Broker` trait: connection lifecycle plus the topic operations the
//!   publisher and subscriber need (declare, bind, publish, consume)
//! - `Delivery`: one inbound message with explicit ack/reject
//! - Implementations: AMQP (RabbitMQ), in-memory channel broker
//! - `TopicPublisher` and `TopicSubscriber` built on top of any `Broker`

use async_trait::async_trait;
use futures::stream::BoxStream;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod channel;
pub mod envelope;
pub mod publisher;
pub mod subscriber;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;
pub use channel::ChannelBroker;
pub use envelope::Envelope;
pub use publisher::{PublishOptions, TopicPublisher};
pub use subscriber::{Binding, Disposition, SubscriptionHandle, TopicSubscriber};

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Not connected: call connect() before using the channel")]
    NotConnected,

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Acknowledgment failed: {0}")]
    Acknowledge(String),

    #[error("Envelope encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Explicit settlement of one delivery.
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    /// Remove the message from its queue.
    async fn ack(&self) -> Result<()>;

    /// Drop the message without requeue.
    async fn reject(&self) -> Result<()>;
}

/// One message received from a queue.
pub struct Delivery {
    /// Routing key the message was published with.
    pub routing_key: String,
    /// Raw message body.
    pub data: Vec<u8>,
    /// Whether the broker delivered this message before.
    pub redelivered: bool,
    acker: Box<dyn DeliveryAcker>,
}

impl Delivery {
    pub fn new(
        routing_key: impl Into<String>,
        data: Vec<u8>,
        redelivered: bool,
        acker: Box<dyn DeliveryAcker>,
    ) -> Self {
        Self {
            routing_key: routing_key.into(),
            data,
            redelivered,
            acker,
        }
    }

    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn reject(&self) -> Result<()> {
        self.acker.reject().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("len", &self.data.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Stream of deliveries from one consumer. Ends when the connection closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Interface to a topic-routed message broker.
///
/// A broker owns exactly one connection and one channel. Every channel
/// operation fails with `BusError::NotConnected` until `connect()` succeeds
/// and again after `close()`.
///
/// Implementations:
/// - `AmqpBroker`: RabbitMQ via AMQP 0.9.1
/// - `ChannelBroker`: in-process broker for standalone mode and tests
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open the connection and its channel. Not retried.
    async fn connect(&self) -> Result<()>;

    /// Release the channel, then the connection. Safe to call repeatedly.
    async fn close(&self) -> Result<()>;

    /// Whether channel operations are currently allowed.
    async fn is_connected(&self) -> bool;

    /// Declare a topic exchange if absent.
    async fn declare_exchange(&self, exchange: &str, durable: bool) -> Result<()>;

    /// Declare a queue if absent.
    async fn declare_queue(&self, queue: &str, durable: bool) -> Result<()>;

    /// Bind a queue to an exchange. Repeating an existing binding is a no-op.
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Publish a message body.
    ///
    /// Waits for a broker confirmation only when `options.confirm` is set.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        options: &PublishOptions,
    ) -> Result<()>;

    /// Start a manual-ack consumer on a queue.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;
}

/// Match a routing key against a topic binding pattern.
///
/// Words are dot-separated. `*` matches exactly one word, `#` matches zero or
/// more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&first, key_rest)) if word == "*" || word == first => match_words(rest, key_rest),
            _ => false,
        },
    }
}
