//! entity-publish: one-shot entity event publisher
//!
//! Connects, publishes a single message to a topic exchange, and closes.
//!
//! ```text
//! entity-publish <exchange> <routing_key> <message-json> [context-json]
//! entity-publish auth.events User.created '{"id":7,"name":"Alice"}'
//! ```
//!
//! ## Configuration
//! Same sources as entity-sync; only the `amqp` section is used.
//! - ENTITY_SYNC_PUBLISH_CONFIRM=true: wait for a publisher confirm
//! - ENTITY_SYNC_PUBLISH_DATA_AS_STRING=true: string-encode `data`

use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use entity_sync::bus::publisher::no_context;
use entity_sync::bus::{AmqpBroker, PublishOptions, TopicPublisher};
use entity_sync::config::Config;
use entity_sync::utils::bootstrap::init_tracing;

const USAGE: &str = "usage: entity-publish <exchange> <routing_key> <message-json> [context-json]";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let [exchange, routing_key, message, rest @ ..] = args.as_slice() else {
        return Err(USAGE.into());
    };

    let message: Value = serde_json::from_str(message)?;
    let context: Value = match rest.first() {
        Some(raw) => serde_json::from_str(raw)?,
        None => no_context(),
    };

    let mut config = Config::load(None)?;
    config.apply_legacy_env()?;

    let mut options = PublishOptions::default();
    if env_flag("ENTITY_SYNC_PUBLISH_CONFIRM") {
        options = options.with_confirm();
    }
    if env_flag("ENTITY_SYNC_PUBLISH_DATA_AS_STRING") {
        options = options.with_data_as_string();
    }

    let broker = Arc::new(AmqpBroker::new(&config.amqp)?);
    let publisher = TopicPublisher::new(broker, config.amqp.durable);
    publisher
        .ready_to_publish(exchange, routing_key, &message, &context, &options)
        .await?;

    info!(exchange = %exchange, routing_key = %routing_key, "Message published");
    Ok(())
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}
