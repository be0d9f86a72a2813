//! Microservice topology map.
//!
//! Declares which entities and operations of which microservices this
//! service consumes:
//!
//! ```yaml
//! auth:
//!   User:
//!     operations: [created, updated, deleted]
//! ```
//!
//! Read once at startup, never mutated afterwards.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// Entity lifecycle operation carried by a routing key.
///
/// Tags outside the known set are kept as `Unsupported` so a binding can still
/// be declared for them; every message on such a binding is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Operation {
    Created,
    Updated,
    Deleted,
    Unsupported(String),
}

impl Operation {
    pub fn parse(tag: &str) -> Self {
        match tag {
            "created" => Operation::Created,
            "updated" => Operation::Updated,
            "deleted" => Operation::Deleted,
            other => Operation::Unsupported(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Operation::Created => "created",
            Operation::Updated => "updated",
            Operation::Deleted => "deleted",
            Operation::Unsupported(tag) => tag,
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, Operation::Unsupported(_))
    }
}

impl From<String> for Operation {
    fn from(tag: String) -> Self {
        Operation::parse(&tag)
    }
}

impl From<Operation> for String {
    fn from(operation: Operation) -> Self {
        operation.as_str().to_string()
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operations consumed for one entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySubscription {
    #[serde(default)]
    pub operations: Vec<Operation>,
}

/// One (microservice, entity, operation) triple of the topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription<'a> {
    pub microservice: &'a str,
    pub entity: &'a str,
    pub operation: &'a Operation,
}

/// microservice → entity → operations.
///
/// Ordered maps give a deterministic startup order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topology(BTreeMap<String, BTreeMap<String, EntitySubscription>>);

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert for tests and programmatic setup.
    pub fn with(
        mut self,
        microservice: impl Into<String>,
        entity: impl Into<String>,
        operations: impl IntoIterator<Item = Operation>,
    ) -> Self {
        self.0
            .entry(microservice.into())
            .or_default()
            .entry(entity.into())
            .or_default()
            .operations
            .extend(operations);
        self
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.display().to_string(), e.to_string()))?;
        Self::from_yaml(&content)
    }

    /// Every (microservice, entity, operation) triple in map order. An
    /// operation listed twice for one entity yields one triple.
    pub fn subscriptions(&self) -> impl Iterator<Item = Subscription<'_>> {
        self.0.iter().flat_map(|(microservice, entities)| {
            entities.iter().flat_map(move |(entity, subscription)| {
                let operations = &subscription.operations;
                operations
                    .iter()
                    .enumerate()
                    .filter(move |(i, operation)| !operations[..*i].contains(operation))
                    .map(move |(_, operation)| Subscription {
                        microservice,
                        entity,
                        operation,
                    })
            })
        })
    }

    /// (microservice, entity) pairs in map order.
    pub fn entities(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().flat_map(|(microservice, entities)| {
            entities
                .keys()
                .map(move |entity| (microservice.as_str(), entity.as_str()))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(BTreeMap::is_empty)
    }
}
