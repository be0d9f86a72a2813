//! Entity storage.
//!
//! This module contains:
//! - `EntityStore` trait: persistence boundary for entity collections
//! - CRUD adapter (`crud`) applied by inbound change messages
//! - `EntityRegistry`: explicit entity-name to model mapping
//! - Implementations: SQLite, PostgreSQL, in-memory

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{error, info};

pub mod crud;
pub mod memory;
pub mod registry;

#[cfg(any(feature = "sqlite", feature = "postgres"))]
pub mod schema;

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use crud::{create_entity, delete_entity, update_entity, DeleteAck};
pub use memory::MemoryEntityStore;
pub use registry::{EntityModel, EntityRegistry};

#[cfg(feature = "postgres")]
pub use postgres::PostgresEntityStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteEntityStore;

/// A stored entity: a JSON object whose `id` member is its primary key.
pub type Record = Map<String, Value>;

/// Name of the primary key member inside a record.
pub const ID_FIELD: &str = "id";

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// CRUD operation that produced a store error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOperation {
    Create,
    Update,
    Delete,
}

impl fmt::Display for StoreOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreOperation::Create => f.write_str("create"),
            StoreOperation::Update => f.write_str("update"),
            StoreOperation::Delete => f.write_str("delete"),
        }
    }
}

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Entity with the same ID already exists: entity={entity}, id={id}")]
    Conflict { entity: String, id: EntityId },

    #[error("Entity not found: entity={entity}, id={}", display_id(.id))]
    NotFound {
        entity: String,
        id: Option<EntityId>,
    },

    #[error("Failed to {operation} entity: {message}")]
    Backend {
        operation: StoreOperation,
        message: String,
    },

    #[cfg(any(feature = "sqlite", feature = "postgres"))]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Wrap an underlying store failure with the operation that hit it.
    ///
    /// Domain errors (validation, conflict, not found) pass through untouched.
    pub fn during(self, operation: StoreOperation) -> Self {
        match self {
            StoreError::Validation(_)
            | StoreError::Conflict { .. }
            | StoreError::NotFound { .. }
            | StoreError::Backend { .. } => self,
            other => StoreError::Backend {
                operation,
                message: other.to_string(),
            },
        }
    }
}

fn display_id(id: &Option<EntityId>) -> &str {
    id.as_ref().map(EntityId::as_str).unwrap_or("<none>")
}

/// Primary key of an entity.
///
/// Producers send identifiers as JSON numbers or strings; both normalise to the
/// same textual key so `5` and `"5"` address the same entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh identifier for a create without one.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Read an identifier out of a JSON value.
    ///
    /// Null, empty strings, booleans, arrays and objects are not identifiers.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) if !s.is_empty() => Some(Self(s.clone())),
            Value::Number(n) => Some(Self(n.to_string())),
            _ => None,
        }
    }

    /// Read `record[field]` as an identifier.
    pub fn from_field(record: &Record, field: &str) -> Option<Self> {
        record.get(field).and_then(Self::from_value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Persistence boundary for entity collections.
///
/// Each method is atomic on its own. Callers compose them without any
/// cross-call transaction.
///
/// Implementations:
/// - `SqliteEntityStore`: SQLite via sqlx
/// - `PostgresEntityStore`: PostgreSQL via sqlx
/// - `MemoryEntityStore`: in-process map for standalone mode and tests
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Look up one entity by primary key.
    async fn find_by_id(&self, entity: &str, id: &EntityId) -> Result<Option<Record>>;

    /// Insert a record whose `id` member is already set.
    ///
    /// Fails with `Conflict` when the key is taken.
    async fn insert(&self, entity: &str, id: &EntityId, record: Record) -> Result<Record>;

    /// Merge `changes` into the stored record.
    ///
    /// Returns `None` when no entity has this key. The primary key never changes.
    async fn update(&self, entity: &str, id: &EntityId, changes: Record) -> Result<Option<Record>>;

    /// Remove one entity. Returns whether a row was removed.
    async fn delete(&self, entity: &str, id: &EntityId) -> Result<bool>;
}

/// Shallow merge used by partial updates: top-level members of `changes`
/// replace those of `current`, and the primary key keeps its stored value.
pub fn merge_record(mut current: Record, changes: Record, id: &EntityId) -> Record {
    let stored_id = current
        .get(ID_FIELD)
        .cloned()
        .unwrap_or_else(|| Value::String(id.as_str().to_string()));
    for (key, value) in changes {
        current.insert(key, value);
    }
    current.insert(ID_FIELD.to_string(), stored_id);
    current
}

// ============================================================================
// Configuration
// ============================================================================

/// Storage type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// SQLite file or in-memory database.
    #[default]
    Sqlite,
    /// PostgreSQL server.
    Postgres,
    /// Process-local map; nothing survives a restart.
    Memory,
}

/// Storage configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage backend.
    #[serde(rename = "type")]
    pub storage_type: StorageType,
    /// SQLite database path.
    pub path: String,
    /// PostgreSQL connection URL.
    pub url: Option<String>,
    /// Entity collections this service owns (the registry contents).
    pub entities: Vec<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_type: StorageType::Sqlite,
            path: "./data/entities.db".to_string(),
            url: None,
            entities: Vec::new(),
        }
    }
}

/// Initialize the entity store based on configuration.
///
/// Creates the schema for SQL backends.
pub async fn init_storage(
    config: &StorageConfig,
) -> std::result::Result<Arc<dyn EntityStore>, Box<dyn std::error::Error + Send + Sync>> {
    match config.storage_type {
        StorageType::Memory => {
            info!(storage_type = "memory", "Entity store initialized");
            Ok(Arc::new(MemoryEntityStore::new()))
        }
        StorageType::Sqlite => {
            #[cfg(feature = "sqlite")]
            {
                if let Some(parent) = std::path::Path::new(&config.path).parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }

                let pool =
                    sqlx::SqlitePool::connect(&format!("sqlite:{}?mode=rwc", config.path)).await?;
                let store = SqliteEntityStore::new(pool);
                store.init().await?;

                info!(storage_type = "sqlite", path = %config.path, "Entity store initialized");
                Ok(Arc::new(store))
            }

            #[cfg(not(feature = "sqlite"))]
            {
                error!("SQLite storage requested but 'sqlite' feature is not enabled");
                Err("SQLite support requires the 'sqlite' feature".into())
            }
        }
        StorageType::Postgres => {
            #[cfg(feature = "postgres")]
            {
                let url = config
                    .url
                    .as_deref()
                    .ok_or("Postgres storage requires storage.url")?;
                let pool = sqlx::PgPool::connect(url).await?;
                let store = PostgresEntityStore::new(pool);
                store.init().await?;

                info!(storage_type = "postgres", "Entity store initialized");
                Ok(Arc::new(store))
            }

            #[cfg(not(feature = "postgres"))]
            {
                error!("Postgres storage requested but 'postgres' feature is not enabled");
                Err("Postgres support requires the 'postgres' feature".into())
            }
        }
    }
}
