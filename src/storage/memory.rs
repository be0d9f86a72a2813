//! In-memory EntityStore implementation.
//!
//! Backs the `memory` storage type and the test suites. Failure toggles let
//! tests drive the backend-error paths of the CRUD adapter.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{merge_record, EntityId, EntityStore, Record, Result, StoreError, StoreOperation};

/// In-memory entity store keyed by (entity, id).
#[derive(Default)]
pub struct MemoryEntityStore {
    entities: RwLock<HashMap<String, BTreeMap<EntityId, Record>>>,
    fail_on_write: RwLock<bool>,
    writes: AtomicUsize,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every insert/update/delete fail with a backend error.
    pub async fn set_fail_on_write(&self, fail: bool) {
        *self.fail_on_write.write().await = fail;
    }

    /// Number of insert/update/delete calls that reached the store.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of stored entities in one collection.
    pub async fn count(&self, entity: &str) -> usize {
        self.entities
            .read()
            .await
            .get(entity)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    /// Snapshot of one collection in key order.
    pub async fn all(&self, entity: &str) -> Vec<Record> {
        self.entities
            .read()
            .await
            .get(entity)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    async fn check_write(&self, operation: StoreOperation) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if *self.fail_on_write.read().await {
            return Err(StoreError::Backend {
                operation,
                message: "memory store write failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn find_by_id(&self, entity: &str, id: &EntityId) -> Result<Option<Record>> {
        Ok(self
            .entities
            .read()
            .await
            .get(entity)
            .and_then(|rows| rows.get(id))
            .cloned())
    }

    async fn insert(&self, entity: &str, id: &EntityId, record: Record) -> Result<Record> {
        self.check_write(StoreOperation::Create).await?;

        let mut entities = self.entities.write().await;
        let rows = entities.entry(entity.to_string()).or_default();
        if rows.contains_key(id) {
            return Err(StoreError::Conflict {
                entity: entity.to_string(),
                id: id.clone(),
            });
        }
        rows.insert(id.clone(), record.clone());
        Ok(record)
    }

    async fn update(&self, entity: &str, id: &EntityId, changes: Record) -> Result<Option<Record>> {
        self.check_write(StoreOperation::Update).await?;

        let mut entities = self.entities.write().await;
        let Some(current) = entities.get_mut(entity).and_then(|rows| rows.get_mut(id)) else {
            return Ok(None);
        };
        let merged = merge_record(std::mem::take(current), changes, id);
        *current = merged.clone();
        Ok(Some(merged))
    }

    async fn delete(&self, entity: &str, id: &EntityId) -> Result<bool> {
        self.check_write(StoreOperation::Delete).await?;

        Ok(self
            .entities
            .write()
            .await
            .get_mut(entity)
            .and_then(|rows| rows.remove(id))
            .is_some())
    }
}
