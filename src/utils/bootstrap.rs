//! Bootstrap utilities for entity-sync binaries.
//!
//! Shared initialization code for the service and the publish tool.

use std::future::Future;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LOG_ENV_VAR;

/// Initialize tracing with the ENTITY_SYNC_LOG environment variable.
///
/// Defaults to "info" level if ENTITY_SYNC_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Backoff for dependency connections at startup.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 30
/// - Jitter enabled
pub fn connection_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(30)
        .with_jitter()
}

/// Run `connect` until it succeeds or `backoff` runs out.
///
/// # Arguments
/// * `target` - Human-readable name for logging (e.g., "entity store")
/// * `backoff` - Delays between attempts
/// * `connect` - Async function that attempts to establish a connection
///
/// # Returns
/// The connected value on success, or the last error once retries are spent.
pub async fn connect_with_retry<T, E, F, Fut>(
    target: &str,
    backoff: ExponentialBuilder,
    connect: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut delays = backoff.build();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match connect().await {
            Ok(client) => {
                tracing::info!(dependency = %target, attempt, "Connected");
                return Ok(client);
            }
            Err(e) => match delays.next() {
                Some(delay) => {
                    warn!(
                        "Failed to connect to {} (attempt {}): {}. Retrying in {:?}...",
                        target, attempt, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    tracing::error!(
                        "Failed to connect to {} after {} attempts: {}",
                        target,
                        attempt,
                        e
                    );
                    return Err(e);
                }
            },
        }
    }
}
