//! In-memory storage contract tests.
//!
//! Run with: cargo test --test storage_memory

mod storage;

use std::sync::Arc;

use entity_sync::storage::MemoryEntityStore;

#[tokio::test]
async fn test_memory_entity_store() {
    println!("=== Memory EntityStore Tests ===");

    let store = MemoryEntityStore::new();
    run_entity_store_tests!(&store);

    println!("=== All Memory EntityStore tests PASSED ===");
}

#[tokio::test]
async fn test_memory_crud_lifecycle() {
    storage::entity_store_tests::test_crud_lifecycle(Arc::new(MemoryEntityStore::new())).await;
}
