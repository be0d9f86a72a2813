//! Entity registry: explicit mapping from entity names to store models.
//!
//! Inbound messages name their entity as a string. The registry resolves that
//! name once, so an unknown entity is caught at startup instead of per message.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::EntityStore;

/// Handle to one entity collection.
#[derive(Clone)]
pub struct EntityModel {
    name: String,
    id_field: String,
    store: Arc<dyn EntityStore>,
}

impl EntityModel {
    pub fn new(name: impl Into<String>, store: Arc<dyn EntityStore>) -> Self {
        let name = name.into();
        let id_field = id_field_for(&name);
        Self {
            name,
            id_field,
            store,
        }
    }

    /// Entity (collection) name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Payload member carrying the target id for updates and deletes.
    pub fn id_field(&self) -> &str {
        &self.id_field
    }

    pub fn store(&self) -> &dyn EntityStore {
        self.store.as_ref()
    }
}

impl std::fmt::Debug for EntityModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityModel")
            .field("name", &self.name)
            .field("id_field", &self.id_field)
            .finish()
    }
}

/// Derive the id member name: first letter lowercased, then `ID`.
///
/// `User` becomes `userID`, `OrderLine` becomes `orderLineID`.
pub fn id_field_for(entity: &str) -> String {
    let mut chars = entity.chars();
    match chars.next() {
        Some(first) => {
            let mut field: String = first.to_lowercase().collect();
            field.push_str(chars.as_str());
            field.push_str("ID");
            field
        }
        None => "ID".to_string(),
    }
}

/// Entity name to model lookup.
#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    models: BTreeMap<String, EntityModel>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every name against the same store.
    pub fn with_entities<I, S>(store: Arc<dyn EntityStore>, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut registry = Self::new();
        for name in names {
            registry.register(EntityModel::new(name, Arc::clone(&store)));
        }
        registry
    }

    /// Add or replace a model.
    pub fn register(&mut self, model: EntityModel) {
        self.models.insert(model.name().to_string(), model);
    }

    pub fn get(&self, entity: &str) -> Option<&EntityModel> {
        self.models.get(entity)
    }

    pub fn contains(&self, entity: &str) -> bool {
        self.models.contains_key(entity)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryEntityStore;

    #[test]
    fn test_id_field_for() {
        assert_eq!(id_field_for("User"), "userID");
        assert_eq!(id_field_for("OrderLine"), "orderLineID");
        assert_eq!(id_field_for("invoice"), "invoiceID");
        assert_eq!(id_field_for(""), "ID");
    }

    #[test]
    fn test_registry_lookup() {
        let store: Arc<dyn EntityStore> = Arc::new(MemoryEntityStore::new());
        let registry = EntityRegistry::with_entities(store, ["User", "Order"]);

        assert_eq!(registry.len(), 2);
        assert!(registry.contains("User"));
        assert!(!registry.contains("user"));
        assert_eq!(registry.get("Order").unwrap().id_field(), "orderID");
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["Order", "User"]);
    }
}
