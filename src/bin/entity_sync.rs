//! entity-sync: entity synchronization service
//!
//! Consumes entity lifecycle events of other microservices and applies them
//! to the local entity store.
//!
//! ## Architecture
//! ```text
//! [auth service] --(auth.events / User.created)--> [RabbitMQ]
//!                                                      |
//!                                     User-created-billing-queue
//!                                                      v
//!                                              [entity-sync] --> entity store
//! ```
//!
//! ## Configuration
//! - First argument or ENTITY_SYNC_CONFIG: YAML configuration file
//! - ENTITY_SYNC__*: overrides for any configuration key
//! - RABBITMQ_URL / RABBITMQ_USER / RABBITMQ_PSWD / RABBITMQ_HOST /
//!   RABBITMQ_PORT / RABBITMQ_VHOST / MST_SERVICE_NAME: legacy overrides
//! - ENTITY_SYNC_LOG: log filter (default: info)

use std::sync::Arc;

use tracing::{error, info};

use entity_sync::bus::{AmqpBroker, Broker};
use entity_sync::config::Config;
use entity_sync::service::SyncService;
use entity_sync::storage::{init_storage, EntityRegistry};
use entity_sync::utils::bootstrap::{connect_with_retry, connection_backoff, init_tracing};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let mut config = Config::load(config_path.as_deref())?;
    config.apply_legacy_env()?;
    config.validate()?;

    let store = connect_with_retry("entity store", connection_backoff(), || {
        init_storage(&config.storage)
    })
    .await?;
    let registry = Arc::new(EntityRegistry::with_entities(
        store,
        config.storage.entities.iter().cloned(),
    ));

    let broker: Arc<dyn Broker> = Arc::new(AmqpBroker::new(&config.amqp)?);

    info!(
        service = %config.service.name,
        entities = registry.len(),
        "entity-sync starting"
    );

    let service = SyncService::new(config, broker, registry);
    if let Err(e) = service.run(shutdown_signal()).await {
        error!(error = %e, "entity-sync stopped");
        return Err(e.into());
    }

    info!("entity-sync stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        futures::future::pending::<()>().await;
    }
}
