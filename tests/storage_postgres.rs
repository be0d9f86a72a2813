//! PostgreSQL storage integration tests using testcontainers.
//!
//! Run with: cargo test --test storage_postgres --features postgres -- --ignored --nocapture
//!
//! These tests spin up PostgreSQL in a container using testcontainers-rs,
//! create the schema, and run the EntityStore contract.

mod storage;

use std::sync::Arc;
use std::time::Duration;

use entity_sync::storage::PostgresEntityStore;
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    GenericImage, ImageExt,
};

/// Start PostgreSQL container.
///
/// Returns (container, connection_string) where connection_string is suitable
/// for sqlx PgPool connection.
async fn start_postgres() -> (testcontainers::ContainerAsync<GenericImage>, String) {
    // PostgreSQL prints "ready to accept connections" once during initdb and
    // again when fully up; the short sleep below covers the gap.
    let image = GenericImage::new("postgres", "16")
        .with_exposed_port(5432.tcp())
        .with_wait_for(WaitFor::message_on_stdout(
            "database system is ready to accept connections",
        ));

    let container = image
        .with_env_var("POSTGRES_USER", "entity_sync")
        .with_env_var("POSTGRES_PASSWORD", "entity_sync")
        .with_env_var("POSTGRES_DB", "entity_sync")
        .with_startup_timeout(Duration::from_secs(60))
        .start()
        .await
        .expect("Failed to start postgres container");

    tokio::time::sleep(Duration::from_secs(1)).await;

    let host_port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("Failed to get mapped port");

    let host = container
        .get_host()
        .await
        .expect("Failed to get container host");

    let connection_string = format!(
        "postgres://entity_sync:entity_sync@{}:{}/entity_sync",
        host, host_port
    );

    println!("PostgreSQL available at: {}", connection_string);

    (container, connection_string)
}

async fn connect_and_init(connection_string: &str) -> PostgresEntityStore {
    let pool = sqlx::PgPool::connect(connection_string)
        .await
        .expect("Failed to connect to PostgreSQL");

    let store = PostgresEntityStore::new(pool);
    store.init().await.expect("Failed to create schema");
    store
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_postgres_entity_store() {
    println!("=== PostgreSQL EntityStore Tests ===");

    let (_container, connection_string) = start_postgres().await;
    let store = connect_and_init(&connection_string).await;

    run_entity_store_tests!(&store);

    println!("=== All PostgreSQL EntityStore tests PASSED ===");
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_postgres_crud_lifecycle() {
    let (_container, connection_string) = start_postgres().await;
    let store = connect_and_init(&connection_string).await;

    storage::entity_store_tests::test_crud_lifecycle(Arc::new(store)).await;
}
