//! Service supervisor.
//!
//! Runs the consumer orchestrator until shutdown. When every consumer has
//! stopped (the broker connection went away) it closes the broker, waits out
//! an exponential backoff with jitter, and starts all consumers again.
//! Messages left unacknowledged by the lost connection are redelivered by the
//! broker.
//!
//! One outage lasts until the consumers stay up for `stable_after_ms`. A start
//! where every binding fails, or consumers that die right after starting, use
//! up an attempt of the same outage.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::bus::{Broker, SubscriptionHandle};
use crate::config::{Config, ReconnectConfig};
use crate::orchestration::{ConsumerOrchestrator, StartReport, StartupError};
use crate::storage::EntityRegistry;

/// Errors that stop the service.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Startup(#[from] StartupError),

    #[error("All {0} bindings failed to start")]
    NoConsumers(usize),

    #[error("Broker connection lost and reconnect is disabled")]
    ConnectionLost,

    #[error("Gave up reconnecting after {0} attempts")]
    ReconnectExhausted(usize),
}

/// Backoff between reconnect attempts.
pub fn reconnect_backoff(config: &ReconnectConfig) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(config.min_delay_ms))
        .with_max_delay(Duration::from_millis(config.max_delay_ms))
        .with_max_times(config.max_attempts)
        .with_jitter()
}

/// Long-running entity sync service.
pub struct SyncService {
    config: Config,
    broker: Arc<dyn Broker>,
    orchestrator: ConsumerOrchestrator,
}

impl SyncService {
    pub fn new(config: Config, broker: Arc<dyn Broker>, registry: Arc<EntityRegistry>) -> Self {
        let orchestrator = ConsumerOrchestrator::new(&config, Arc::clone(&broker), registry);
        Self {
            config,
            broker,
            orchestrator,
        }
    }

    /// Run until `shutdown` resolves or the broker is given up on.
    pub async fn run<F>(&self, shutdown: F) -> Result<(), ServiceError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let reconnect = &self.config.reconnect;
        let stable_after = Duration::from_millis(reconnect.stable_after_ms);
        let backoff_builder = reconnect_backoff(reconnect);
        let mut backoff = backoff_builder.build();
        let mut attempts = 0usize;

        loop {
            let started = tokio::select! {
                _ = &mut shutdown => return self.stop().await,
                started = self.orchestrator.start_all(&self.config.consumers) => started,
            };

            match started {
                Ok(report) if report.active.is_empty() && !report.failed.is_empty() => {
                    error!(failed = report.failed_count(), "Every binding failed to start");
                    self.close_after_failure().await;
                    if !reconnect.enabled {
                        return Err(ServiceError::NoConsumers(report.failed_count()));
                    }
                }
                Ok(report) => {
                    let started_at = Instant::now();
                    tokio::select! {
                        _ = &mut shutdown => return self.stop().await,
                        _ = wait_for_consumers(report) => {}
                    }

                    let uptime = started_at.elapsed();
                    warn!(uptime_ms = %uptime.as_millis(), "All consumers stopped, broker connection lost");
                    self.close_after_failure().await;
                    if !reconnect.enabled {
                        return Err(ServiceError::ConnectionLost);
                    }
                    if uptime >= stable_after {
                        backoff = backoff_builder.build();
                        attempts = 0;
                    }
                }
                Err(StartupError::Connection(e)) if reconnect.enabled => {
                    warn!(error = %e, attempt = attempts + 1, "Broker connect failed");
                }
                Err(e) => return Err(e.into()),
            }

            let Some(delay) = backoff.next() else {
                error!(attempts, "Giving up on broker reconnect");
                return Err(ServiceError::ReconnectExhausted(attempts));
            };
            attempts += 1;

            info!(backoff_ms = %delay.as_millis(), attempt = attempts, "Reconnecting to broker");
            tokio::select! {
                _ = &mut shutdown => return self.stop().await,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn close_after_failure(&self) {
        if let Err(e) = self.broker.close().await {
            warn!(error = %e, "Failed to close broker after consumer failure");
        }
    }

    async fn stop(&self) -> Result<(), ServiceError> {
        info!(service = %self.orchestrator.service_name(), "Shutting down");
        // Closing ends every consumer stream; workers finish their current message first
        if let Err(e) = self.broker.close().await {
            warn!(error = %e, "Failed to close broker on shutdown");
        }
        Ok(())
    }
}

/// Resolve once every started consumer has stopped. Never resolves when
/// nothing was started.
async fn wait_for_consumers(report: StartReport) {
    if report.active.is_empty() {
        futures::future::pending::<()>().await;
    }
    futures::future::join_all(report.active.into_iter().map(SubscriptionHandle::finished)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{ChannelBroker, Delivery, DeliveryStream, PublishOptions};
    use crate::storage::MemoryEntityStore;
    use crate::topology::{Operation, Topology};
    use async_trait::async_trait;
    use serde_json::json;

    fn config(reconnect_enabled: bool) -> Config {
        let mut config = Config::default();
        config.service.name = "billing".to_string();
        config.consumers = Topology::new().with("auth", "User", [Operation::Created]);
        config.reconnect = ReconnectConfig {
            enabled: reconnect_enabled,
            min_delay_ms: 10,
            max_delay_ms: 20,
            max_attempts: 3,
            stable_after_ms: 60_000,
        };
        config
    }

    fn service(config: Config, broker: Arc<dyn Broker>) -> (SyncService, Arc<MemoryEntityStore>) {
        let store = Arc::new(MemoryEntityStore::new());
        let registry = Arc::new(EntityRegistry::with_entities(store.clone(), ["User"]));
        (SyncService::new(config, broker, registry), store)
    }

    async fn wait_connected(broker: &ChannelBroker) {
        while !broker.is_connected().await || broker.binding_count().await == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Broker whose consumers end as soon as they start.
    struct ShortLivedConsumers(ChannelBroker);

    #[async_trait]
    impl Broker for ShortLivedConsumers {
        async fn connect(&self) -> crate::bus::Result<()> {
            self.0.connect().await
        }

        async fn close(&self) -> crate::bus::Result<()> {
            self.0.close().await
        }

        async fn is_connected(&self) -> bool {
            self.0.is_connected().await
        }

        async fn declare_exchange(&self, exchange: &str, durable: bool) -> crate::bus::Result<()> {
            self.0.declare_exchange(exchange, durable).await
        }

        async fn declare_queue(&self, queue: &str, durable: bool) -> crate::bus::Result<()> {
            self.0.declare_queue(queue, durable).await
        }

        async fn bind_queue(
            &self,
            queue: &str,
            exchange: &str,
            routing_key: &str,
        ) -> crate::bus::Result<()> {
            self.0.bind_queue(queue, exchange, routing_key).await
        }

        async fn publish(
            &self,
            exchange: &str,
            routing_key: &str,
            payload: Vec<u8>,
            options: &PublishOptions,
        ) -> crate::bus::Result<()> {
            self.0.publish(exchange, routing_key, payload, options).await
        }

        async fn consume(&self, _queue: &str, _consumer_tag: &str) -> crate::bus::Result<DeliveryStream> {
            Ok(Box::pin(futures::stream::empty::<crate::bus::Result<Delivery>>()))
        }
    }

    #[tokio::test]
    async fn test_shutdown_closes_broker() {
        let broker = Arc::new(ChannelBroker::new());
        let (service, _store) = service(config(true), broker.clone());
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let run = tokio::spawn(async move {
            service
                .run(async {
                    let _ = rx.await;
                })
                .await
        });

        wait_connected(&broker).await;
        tx.send(()).unwrap();
        run.await.unwrap().unwrap();
        assert!(!broker.is_connected().await);
    }

    #[tokio::test]
    async fn test_unreachable_broker_exhausts_reconnects() {
        let broker = Arc::new(ChannelBroker::unreachable());
        let (service, _store) = service(config(true), broker);

        let result = service.run(futures::future::pending()).await;
        assert!(matches!(result, Err(ServiceError::ReconnectExhausted(3))));
    }

    #[tokio::test]
    async fn test_connect_failure_without_reconnect_is_startup_error() {
        let broker = Arc::new(ChannelBroker::unreachable());
        let (service, _store) = service(config(false), broker);

        let result = service.run(futures::future::pending()).await;
        assert!(matches!(
            result,
            Err(ServiceError::Startup(StartupError::Connection(_)))
        ));
    }

    #[tokio::test]
    async fn test_every_binding_failing_exhausts_reconnects() {
        let broker = Arc::new(ChannelBroker::new());
        broker.connect().await.unwrap();
        // Non-durable exchange refuses the durable redeclaration on every start
        broker.declare_exchange("auth.events", false).await.unwrap();
        let (service, _store) = service(config(true), broker.clone());

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            service.run(futures::future::pending()),
        )
        .await
        .expect("service should give up");

        assert!(matches!(result, Err(ServiceError::ReconnectExhausted(3))));
        assert!(!broker.is_connected().await);
    }

    #[tokio::test]
    async fn test_every_binding_failing_without_reconnect_stops() {
        let broker = Arc::new(ChannelBroker::new());
        broker.connect().await.unwrap();
        broker.declare_exchange("auth.events", false).await.unwrap();
        let (service, _store) = service(config(false), broker);

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            service.run(futures::future::pending()),
        )
        .await
        .expect("service should stop");

        assert!(matches!(result, Err(ServiceError::NoConsumers(1))));
    }

    #[tokio::test]
    async fn test_consumers_dying_right_after_start_exhaust_reconnects() {
        let broker = Arc::new(ShortLivedConsumers(ChannelBroker::new()));
        let (service, _store) = service(config(true), broker);

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            service.run(futures::future::pending()),
        )
        .await
        .expect("service should give up");

        assert!(matches!(result, Err(ServiceError::ReconnectExhausted(3))));
    }

    #[tokio::test]
    async fn test_connection_loss_without_reconnect_stops() {
        let broker = Arc::new(ChannelBroker::new());
        let (service, _store) = service(config(false), broker.clone());

        let run = tokio::spawn(async move { service.run(futures::future::pending()).await });

        wait_connected(&broker).await;
        broker.drop_connection();

        let result = run.await.unwrap();
        assert!(matches!(result, Err(ServiceError::ConnectionLost)));
    }

    #[tokio::test]
    async fn test_reconnects_and_processes_redelivered_messages() {
        let broker = Arc::new(ChannelBroker::new());
        let (service, store) = service(config(true), broker.clone());

        let run = tokio::spawn(async move { service.run(futures::future::pending()).await });
        wait_connected(&broker).await;

        broker.drop_connection();
        while broker.is_connected().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        wait_connected(&broker).await;

        broker
            .publish(
                "auth.events",
                "User.created",
                serde_json::to_vec(&json!({"data": {"id": 1, "name": "A"}})).unwrap(),
                &PublishOptions::default(),
            )
            .await
            .unwrap();
        broker.wait_settled(1).await;

        assert_eq!(store.count("User").await, 1);
        run.abort();
    }
}
