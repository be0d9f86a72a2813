//! Entity change handling.
//!
//! Turns one inbound message body into a CRUD call against the entity model
//! named by its binding. The handler never touches the broker; its result
//! decides whether the subscriber acks or rejects.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::bus::envelope::{Envelope, EnvelopeError};
use crate::storage::{
    create_entity, delete_entity, update_entity, DeleteAck, EntityId, EntityRegistry, Record,
    StoreError,
};
use crate::topology::Operation;

/// Why a message could not be applied.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Failed to decode message: {0}")]
    Decode(#[from] EnvelopeError),

    #[error("Message data is not an object: {0}")]
    InvalidData(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A decoded change, ready to apply.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityChange {
    pub operation: Operation,
    /// Payload field carrying the primary key for update and delete.
    pub id_field: String,
    pub payload: Option<Record>,
    pub context: Value,
}

impl EntityChange {
    /// Primary key for update/delete, read from `payload[id_field]`.
    pub fn target_id(&self) -> Option<EntityId> {
        self.payload
            .as_ref()
            .and_then(|p| EntityId::from_field(p, &self.id_field))
    }
}

/// What a successfully applied change produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Created(Record),
    Updated(Record),
    Deleted(DeleteAck),
}

/// Applies inbound entity changes to the registry's models.
#[derive(Clone)]
pub struct EntityChangeHandler {
    registry: Arc<EntityRegistry>,
}

impl EntityChangeHandler {
    pub fn new(registry: Arc<EntityRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    /// Decode `body` and apply it as `operation` on `entity`.
    pub async fn handle(
        &self,
        entity: &str,
        operation: &Operation,
        body: &[u8],
    ) -> Result<Applied, SyncError> {
        if !operation.is_supported() {
            return Err(SyncError::UnsupportedOperation(operation.to_string()));
        }

        let change = self.decode(entity, operation, body)?;
        self.apply(entity, change).await
    }

    /// Parse the envelope and lift `data` into a change.
    ///
    /// `data` may be an object or a string holding an object. A null or absent
    /// `data` yields a change without payload, which the CRUD layer rejects.
    pub fn decode(
        &self,
        entity: &str,
        operation: &Operation,
        body: &[u8],
    ) -> Result<EntityChange, SyncError> {
        let envelope = Envelope::decode(body)?;
        let payload = match envelope.data {
            Value::Object(map) => Some(map),
            Value::Null => None,
            other => return Err(SyncError::InvalidData(type_name(&other).to_string())),
        };

        let id_field = match self.registry.get(entity) {
            Some(model) => model.id_field().to_string(),
            None => crate::storage::registry::id_field_for(entity),
        };

        Ok(EntityChange {
            operation: operation.clone(),
            id_field,
            payload,
            context: envelope.context,
        })
    }

    /// Run the CRUD call for one decoded change.
    pub async fn apply(&self, entity: &str, change: EntityChange) -> Result<Applied, SyncError> {
        let model = self.registry.get(entity);

        let applied = match &change.operation {
            Operation::Created => Applied::Created(create_entity(model, change.payload).await?),
            Operation::Updated => {
                let model = model.ok_or_else(missing_model)?;
                let id = change.target_id();
                let data = change.payload.unwrap_or_default();
                Applied::Updated(update_entity(model, data, id.as_ref()).await?)
            }
            Operation::Deleted => {
                let model = model.ok_or_else(missing_model)?;
                Applied::Deleted(delete_entity(model, change.target_id().as_ref()).await?)
            }
            Operation::Unsupported(tag) => {
                warn!(entity = %entity, operation = %tag, "Refusing unsupported operation");
                return Err(SyncError::UnsupportedOperation(tag.clone()));
            }
        };

        debug!(entity = %entity, operation = %change.operation, "Entity change applied");
        Ok(applied)
    }
}

fn missing_model() -> SyncError {
    SyncError::Store(StoreError::Validation("Entity model not provided".to_string()))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
