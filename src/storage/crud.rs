//! CRUD adapter applied by inbound entity change messages.
//!
//! Each function performs one operation against an entity model and maps the
//! outcome onto the store error taxonomy. Nothing here retries; the caller
//! decides what a failure means for the message that triggered it.

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::{EntityId, EntityModel, Record, Result, StoreError, StoreOperation, ID_FIELD};

/// Acknowledgment returned by a successful delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeleteAck {
    pub success: bool,
    pub message: String,
}

/// Create an entity.
///
/// `data.id`, when set, must not exist yet. When absent a fresh id is generated
/// and written into the stored record.
pub async fn create_entity(model: Option<&EntityModel>, data: Option<Record>) -> Result<Record> {
    let model = model.ok_or_else(|| StoreError::Validation("Entity model not provided".into()))?;
    let mut data = data.ok_or_else(|| StoreError::Validation("Entity data not provided".into()))?;

    let id = match EntityId::from_field(&data, ID_FIELD) {
        Some(id) => {
            let existing = model
                .store()
                .find_by_id(model.name(), &id)
                .await
                .map_err(|e| e.during(StoreOperation::Create))?;
            if existing.is_some() {
                return Err(StoreError::Conflict {
                    entity: model.name().to_string(),
                    id,
                });
            }
            id
        }
        None => {
            let id = EntityId::generate();
            data.insert(ID_FIELD.to_string(), Value::String(id.as_str().to_string()));
            id
        }
    };

    let created = model
        .store()
        .insert(model.name(), &id, data)
        .await
        .map_err(|e| e.during(StoreOperation::Create))?;

    debug!(entity = %model.name(), id = %id, "Entity created");
    Ok(created)
}

/// Partially update the entity with primary key `id`.
pub async fn update_entity(
    model: &EntityModel,
    data: Record,
    id: Option<&EntityId>,
) -> Result<Record> {
    let id = id.ok_or_else(|| StoreError::NotFound {
        entity: model.name().to_string(),
        id: None,
    })?;

    let updated = model
        .store()
        .update(model.name(), id, data)
        .await
        .map_err(|e| e.during(StoreOperation::Update))?
        .ok_or_else(|| StoreError::NotFound {
            entity: model.name().to_string(),
            id: Some(id.clone()),
        })?;

    debug!(entity = %model.name(), id = %id, "Entity updated");
    Ok(updated)
}

/// Delete the entity with primary key `id`.
pub async fn delete_entity(model: &EntityModel, id: Option<&EntityId>) -> Result<DeleteAck> {
    let id = id.ok_or_else(|| StoreError::NotFound {
        entity: model.name().to_string(),
        id: None,
    })?;

    let removed = model
        .store()
        .delete(model.name(), id)
        .await
        .map_err(|e| e.during(StoreOperation::Delete))?;
    if !removed {
        return Err(StoreError::NotFound {
            entity: model.name().to_string(),
            id: Some(id.clone()),
        });
    }

    debug!(entity = %model.name(), id = %id, "Entity deleted");
    Ok(DeleteAck {
        success: true,
        message: "Entity deleted successfully".to_string(),
    })
}
