//! Topic subscriber.
//!
//! Declares the exchange, queue and binding for one (exchange, routing key)
//! pair and runs a worker task that feeds each delivery to the entity change
//! handler. Deliveries of one binding are processed strictly one at a time.

use std::sync::Arc;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, Instrument};

use super::{Broker, BusError, Delivery, DeliveryStream, Result};
use crate::handlers::EntityChangeHandler;
use crate::topology::Operation;

/// One queue binding and the entity operation it feeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub exchange: String,
    pub routing_key: String,
    pub queue: String,
    pub entity: String,
    pub operation: Operation,
}

impl Binding {
    /// Derive the binding for `entity`/`operation` of `microservice`, consumed by `service`.
    ///
    /// Exchange `{microservice}.events`, routing key `{entity}.{operation}`,
    /// queue `{entity}-{operation}-{service}-queue`.
    pub fn derive(microservice: &str, entity: &str, operation: &Operation, service: &str) -> Self {
        Self {
            exchange: format!("{}.events", microservice),
            routing_key: format!("{}.{}", entity, operation),
            queue: format!("{}-{}-{}-queue", entity, operation, service),
            entity: entity.to_string(),
            operation: operation.clone(),
        }
    }
}

/// Final settlement of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Rejected without requeue.
    Reject,
}

/// A running consumer for one binding.
#[derive(Debug)]
pub struct SubscriptionHandle {
    binding: Binding,
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub fn binding(&self) -> &Binding {
        &self.binding
    }

    /// True once the consumer stream has ended.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn abort(&self) {
        self.task.abort();
    }

    /// Wait for the worker to stop.
    pub async fn finished(self) {
        if let Err(e) = self.task.await {
            if e.is_panic() {
                error!(queue = %self.binding.queue, error = %e, "Consumer worker panicked");
            }
        }
    }
}

/// Subscribes bindings on a broker and dispatches their deliveries.
#[derive(Clone)]
pub struct TopicSubscriber {
    broker: Arc<dyn Broker>,
    handler: Arc<EntityChangeHandler>,
    durable: bool,
    consumer_tag_prefix: String,
}

impl TopicSubscriber {
    pub fn new(
        broker: Arc<dyn Broker>,
        handler: Arc<EntityChangeHandler>,
        durable: bool,
        consumer_tag_prefix: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            handler,
            durable,
            consumer_tag_prefix: consumer_tag_prefix.into(),
        }
    }

    /// Declare, bind and start consuming. The worker runs until the
    /// broker's delivery stream ends.
    pub async fn subscribe(&self, binding: Binding) -> Result<SubscriptionHandle> {
        let stream = self.declare_and_consume(&binding).await?;

        info!(
            exchange = %binding.exchange,
            routing_key = %binding.routing_key,
            queue = %binding.queue,
            "Subscribed"
        );

        let task = tokio::spawn(run_worker(
            Arc::clone(&self.handler),
            binding.clone(),
            stream,
        ));
        Ok(SubscriptionHandle { binding, task })
    }

    async fn declare_and_consume(&self, binding: &Binding) -> Result<DeliveryStream> {
        self.broker
            .declare_exchange(&binding.exchange, self.durable)
            .await?;
        self.broker
            .declare_queue(&binding.queue, self.durable)
            .await?;
        self.broker
            .bind_queue(&binding.queue, &binding.exchange, &binding.routing_key)
            .await?;

        let consumer_tag = consumer_tag(&self.consumer_tag_prefix, &binding.queue);
        self.broker.consume(&binding.queue, &consumer_tag).await
    }
}

/// Tag for one consume call. Unique per call: AMQP closes the connection when
/// a channel reuses a tag.
fn consumer_tag(prefix: &str, queue: &str) -> String {
    format!("{}-{}-{}", prefix, queue, uuid::Uuid::new_v4().simple())
}

async fn run_worker(handler: Arc<EntityChangeHandler>, binding: Binding, mut stream: DeliveryStream) {
    while let Some(delivery) = stream.next().await {
        match delivery {
            Ok(delivery) => {
                let consume_span = tracing::info_span!(
                    "bus.consume",
                    queue = %binding.queue,
                    routing_key = %delivery.routing_key
                );
                let disposition = process_delivery(&handler, &binding, &delivery)
                    .instrument(consume_span)
                    .await;
                if let Err(e) = settle(&delivery, disposition).await {
                    error!(queue = %binding.queue, error = %e, "Failed to settle message");
                }
            }
            Err(e) => {
                error!(queue = %binding.queue, error = %e, "Consumer delivery error");
                break;
            }
        }
    }

    info!(queue = %binding.queue, "Consumer stream ended");
}

/// Apply one delivery and decide how to settle it.
pub async fn process_delivery(
    handler: &EntityChangeHandler,
    binding: &Binding,
    delivery: &Delivery,
) -> Disposition {
    match handler
        .handle(&binding.entity, &binding.operation, &delivery.data)
        .await
    {
        Ok(_) => {
            debug!(
                entity = %binding.entity,
                operation = %binding.operation,
                redelivered = delivery.redelivered,
                "Entity change applied"
            );
            Disposition::Ack
        }
        Err(e) => {
            error!(
                entity = %binding.entity,
                operation = %binding.operation,
                error = %e,
                "Failed to apply entity change, rejecting"
            );
            Disposition::Reject
        }
    }
}

async fn settle(delivery: &Delivery, disposition: Disposition) -> std::result::Result<(), BusError> {
    match disposition {
        Disposition::Ack => delivery.ack().await,
        Disposition::Reject => delivery.reject().await,
    }
}
