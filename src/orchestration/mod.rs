//! Consumer orchestration.
//!
//! Walks the topology map once at startup and subscribes one queue per
//! (microservice, entity, operation) triple. Bindings start sequentially in
//! map order; a binding that fails is logged and reported while the others
//! keep going. Only an unknown entity or a failed connect aborts startup.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::bus::{Binding, Broker, BusError, SubscriptionHandle, TopicSubscriber};
use crate::config::Config;
use crate::handlers::EntityChangeHandler;
use crate::storage::EntityRegistry;
use crate::topology::Topology;

/// Errors that abort startup as a whole.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Unknown entity '{entity}' in topology of microservice '{microservice}'")]
    UnknownEntity {
        microservice: String,
        entity: String,
    },

    #[error("Failed to connect to broker: {0}")]
    Connection(#[source] BusError),
}

/// Outcome of `start_all`.
#[derive(Debug, Default)]
pub struct StartReport {
    pub active: Vec<SubscriptionHandle>,
    pub failed: Vec<(Binding, BusError)>,
}

impl StartReport {
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    /// True once every started consumer has stopped.
    pub fn all_finished(&self) -> bool {
        self.active.iter().all(SubscriptionHandle::is_finished)
    }

    /// Abort every running worker.
    pub fn abort_all(&self) {
        for handle in &self.active {
            handle.abort();
        }
    }
}

/// Bindings for every triple of the topology, in map order.
pub fn derive_bindings(topology: &Topology, service_name: &str) -> Vec<Binding> {
    topology
        .subscriptions()
        .map(|s| Binding::derive(s.microservice, s.entity, s.operation, service_name))
        .collect()
}

/// Starts every consumer the topology declares.
pub struct ConsumerOrchestrator {
    broker: Arc<dyn Broker>,
    registry: Arc<EntityRegistry>,
    subscriber: TopicSubscriber,
    service_name: String,
}

impl ConsumerOrchestrator {
    pub fn new(config: &Config, broker: Arc<dyn Broker>, registry: Arc<EntityRegistry>) -> Self {
        let handler = Arc::new(EntityChangeHandler::new(Arc::clone(&registry)));
        let subscriber = TopicSubscriber::new(
            Arc::clone(&broker),
            handler,
            config.amqp.durable,
            config.amqp.consumer_tag_prefix.clone(),
        );
        Self {
            broker,
            registry,
            subscriber,
            service_name: config.service.name.clone(),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Fail on the first topology entity the registry does not know.
    pub fn validate(&self, topology: &Topology) -> Result<(), StartupError> {
        for (microservice, entity) in topology.entities() {
            if !self.registry.contains(entity) {
                return Err(StartupError::UnknownEntity {
                    microservice: microservice.to_string(),
                    entity: entity.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Validate, connect, and subscribe every binding.
    pub async fn start_all(&self, topology: &Topology) -> Result<StartReport, StartupError> {
        self.validate(topology)?;

        self.broker.connect().await.map_err(|e| {
            error!(error = %e, "Failed to connect to broker");
            StartupError::Connection(e)
        })?;

        let mut report = StartReport::default();
        for binding in derive_bindings(topology, &self.service_name) {
            if !binding.operation.is_supported() {
                warn!(
                    queue = %binding.queue,
                    operation = %binding.operation,
                    "Binding unsupported operation, its messages will be rejected"
                );
            }

            match self.subscriber.subscribe(binding.clone()).await {
                Ok(handle) => report.active.push(handle),
                Err(e) => {
                    error!(
                        exchange = %binding.exchange,
                        routing_key = %binding.routing_key,
                        queue = %binding.queue,
                        error = %e,
                        "Failed to subscribe binding"
                    );
                    report.failed.push((binding, e));
                }
            }
        }

        info!(
            service = %self.service_name,
            active = report.active_count(),
            failed = report.failed_count(),
            "Consumers started"
        );
        Ok(report)
    }
}
