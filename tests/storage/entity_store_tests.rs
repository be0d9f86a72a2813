//! EntityStore interface tests.
//!
//! These tests verify the contract of the EntityStore trait and of the CRUD
//! adapter running on top of it. Each storage implementation should run them.

use std::sync::Arc;

use serde_json::{json, Value};

use entity_sync::storage::{
    create_entity, delete_entity, update_entity, EntityId, EntityModel, EntityStore, Record,
    StoreError,
};

/// Build a record from a JSON object literal.
pub fn record(value: Value) -> Record {
    value.as_object().cloned().expect("record must be an object")
}

/// Unique collection name so runs against a shared database do not collide.
pub fn collection(prefix: &str) -> String {
    format!("test_{}_{}", prefix, uuid::Uuid::new_v4().simple())
}

// =============================================================================
// EntityStore::insert / find_by_id
// =============================================================================

pub async fn test_insert_and_find<S: EntityStore>(store: &S) {
    let entity = collection("insert");
    let id = EntityId::new("1");

    store
        .insert(&entity, &id, record(json!({"id": 1, "name": "Alice"})))
        .await
        .expect("insert should succeed");

    let found = store
        .find_by_id(&entity, &id)
        .await
        .expect("find should succeed")
        .expect("record should exist");
    assert_eq!(found["name"], json!("Alice"));
    assert_eq!(found["id"], json!(1), "stored id keeps its JSON type");
}

pub async fn test_find_missing<S: EntityStore>(store: &S) {
    let entity = collection("missing");
    let found = store
        .find_by_id(&entity, &EntityId::new("nope"))
        .await
        .expect("find should succeed");
    assert!(found.is_none());
}

pub async fn test_insert_duplicate_conflicts<S: EntityStore>(store: &S) {
    let entity = collection("dup");
    let id = EntityId::new("a");

    store
        .insert(&entity, &id, record(json!({"id": "a"})))
        .await
        .expect("first insert should succeed");
    let result = store.insert(&entity, &id, record(json!({"id": "a"}))).await;

    assert!(
        matches!(result, Err(StoreError::Conflict { .. })),
        "duplicate insert should conflict, got {:?}",
        result
    );
}

pub async fn test_collections_are_isolated<S: EntityStore>(store: &S) {
    let users = collection("users");
    let orders = collection("orders");
    let id = EntityId::new("1");

    store
        .insert(&users, &id, record(json!({"id": 1, "kind": "user"})))
        .await
        .expect("insert user should succeed");
    store
        .insert(&orders, &id, record(json!({"id": 1, "kind": "order"})))
        .await
        .expect("same id in another collection should succeed");

    let user = store.find_by_id(&users, &id).await.unwrap().unwrap();
    assert_eq!(user["kind"], json!("user"));
}

// =============================================================================
// EntityStore::update / delete
// =============================================================================

pub async fn test_update_merges_fields<S: EntityStore>(store: &S) {
    let entity = collection("update");
    let id = EntityId::new("7");
    store
        .insert(&entity, &id, record(json!({"id": 7, "name": "Alice", "plan": "free"})))
        .await
        .unwrap();

    let updated = store
        .update(&entity, &id, record(json!({"userID": 7, "plan": "pro", "id": 99})))
        .await
        .expect("update should succeed")
        .expect("row should exist");

    assert_eq!(updated["name"], json!("Alice"));
    assert_eq!(updated["plan"], json!("pro"));
    assert_eq!(updated["id"], json!(7), "primary key is never rewritten");

    let stored = store.find_by_id(&entity, &id).await.unwrap().unwrap();
    assert_eq!(stored, updated);
}

pub async fn test_update_missing_returns_none<S: EntityStore>(store: &S) {
    let entity = collection("update_missing");
    let updated = store
        .update(&entity, &EntityId::new("x"), record(json!({"a": 1})))
        .await
        .expect("update should succeed");
    assert!(updated.is_none());
}

pub async fn test_delete<S: EntityStore>(store: &S) {
    let entity = collection("delete");
    let id = EntityId::new("d");
    store
        .insert(&entity, &id, record(json!({"id": "d"})))
        .await
        .unwrap();

    assert!(store.delete(&entity, &id).await.unwrap(), "first delete removes");
    assert!(!store.delete(&entity, &id).await.unwrap(), "second delete finds nothing");
    assert!(store.find_by_id(&entity, &id).await.unwrap().is_none());
}

// =============================================================================
// CRUD adapter over the store
// =============================================================================

pub async fn test_crud_lifecycle(store: Arc<dyn EntityStore>) {
    let model = EntityModel::new(collection("User"), store);

    let created = create_entity(Some(&model), Some(record(json!({"name": "Bob"}))))
        .await
        .expect("create should succeed");
    let id = EntityId::from_field(&created, "id").expect("create assigns an id");
    assert!(uuid::Uuid::parse_str(id.as_str()).is_ok(), "generated id is a uuid");

    let duplicate = create_entity(
        Some(&model),
        Some(record(json!({"id": id.as_str(), "name": "Bob again"}))),
    )
    .await;
    assert!(matches!(duplicate, Err(StoreError::Conflict { .. })));

    let updated = update_entity(&model, record(json!({"name": "Robert"})), Some(&id))
        .await
        .expect("update should succeed");
    assert_eq!(updated["name"], json!("Robert"));

    let ack = delete_entity(&model, Some(&id))
        .await
        .expect("delete should succeed");
    assert!(ack.success);

    let again = delete_entity(&model, Some(&id)).await;
    assert!(matches!(again, Err(StoreError::NotFound { .. })));
}

#[macro_export]
macro_rules! run_entity_store_tests {
    ($store:expr) => {
        use $crate::storage::entity_store_tests::*;

        test_insert_and_find($store).await;
        println!("  test_insert_and_find: PASSED");

        test_find_missing($store).await;
        println!("  test_find_missing: PASSED");

        test_insert_duplicate_conflicts($store).await;
        println!("  test_insert_duplicate_conflicts: PASSED");

        test_collections_are_isolated($store).await;
        println!("  test_collections_are_isolated: PASSED");

        test_update_merges_fields($store).await;
        println!("  test_update_merges_fields: PASSED");

        test_update_missing_returns_none($store).await;
        println!("  test_update_missing_returns_none: PASSED");

        test_delete($store).await;
        println!("  test_delete: PASSED");
    };
}
