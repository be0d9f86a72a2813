//! Topic publisher.
//!
//! Wraps a message and its context into an `Envelope` and publishes it to a
//! topic exchange. Publishing is fire-and-forget unless the caller asks for
//! publisher confirms.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::{Broker, Envelope, Result};

/// Per-publish options.
#[derive(Debug, Clone)]
pub struct PublishOptions {
    /// Exchange durability; `None` uses the publisher default.
    pub durable: Option<bool>,
    /// Mark the message persistent (delivery mode 2).
    pub persistent: bool,
    /// Wait for the broker to confirm the publish.
    pub confirm: bool,
    /// Encode `data` as a JSON string inside the envelope.
    pub data_as_string: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            durable: None,
            persistent: true,
            confirm: false,
            data_as_string: false,
        }
    }
}

impl PublishOptions {
    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = Some(durable);
        self
    }

    pub fn with_confirm(mut self) -> Self {
        self.confirm = true;
        self
    }

    pub fn with_data_as_string(mut self) -> Self {
        self.data_as_string = true;
        self
    }
}

/// Publishes entity change messages to topic exchanges.
#[derive(Clone)]
pub struct TopicPublisher {
    broker: Arc<dyn Broker>,
    durable: bool,
}

impl TopicPublisher {
    /// Create a publisher over a broker, with the default exchange durability.
    pub fn new(broker: Arc<dyn Broker>, durable: bool) -> Self {
        Self { broker, durable }
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Publish `message` with `context` on an already connected broker.
    #[tracing::instrument(name = "bus.publish", skip_all, fields(exchange = %exchange, routing_key = %routing_key))]
    pub async fn publish<M, C>(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &M,
        context: &C,
        options: &PublishOptions,
    ) -> Result<()>
    where
        M: Serialize + ?Sized,
        C: Serialize + ?Sized,
    {
        let envelope = Envelope::new(serde_json::to_value(message)?, serde_json::to_value(context)?);
        let payload = envelope.encode(options.data_as_string)?;

        let durable = options.durable.unwrap_or(self.durable);
        self.broker.declare_exchange(exchange, durable).await?;
        self.broker
            .publish(exchange, routing_key, payload, options)
            .await?;

        debug!(durable, confirm = options.confirm, "Message published");
        Ok(())
    }

    /// Connect, publish, close.
    ///
    /// For single-shot callers. Pays full connection setup on every call, so
    /// frequent publishers should connect once and call `publish`. A broker
    /// that was already connected on entry is left connected, so consumers
    /// sharing it keep running.
    pub async fn ready_to_publish<M, C>(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &M,
        context: &C,
        options: &PublishOptions,
    ) -> Result<()>
    where
        M: Serialize + ?Sized,
        C: Serialize + ?Sized,
    {
        let was_connected = self.broker.is_connected().await;
        self.broker.connect().await?;
        let published = self
            .publish(exchange, routing_key, message, context, options)
            .await;
        if was_connected {
            return published;
        }
        if let Err(e) = self.broker.close().await {
            warn!(error = %e, "Failed to close broker after publish");
        }
        published
    }
}

/// Empty context object for callers with nothing to attach.
pub fn no_context() -> Value {
    Value::Object(Default::default())
}
