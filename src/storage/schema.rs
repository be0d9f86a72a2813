//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query building.

use sea_query::Iden;

/// Entities table schema.
///
/// One row per entity; `data` holds the record as JSON text.
#[derive(Iden)]
pub enum Entities {
    Table,
    #[iden = "entity"]
    Entity,
    #[iden = "id"]
    Id,
    #[iden = "data"]
    Data,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "updated_at"]
    UpdatedAt,
}

/// SQL for creating the entities table (SQLite).
pub const CREATE_ENTITIES_TABLE_SQLITE: &str = r#"
CREATE TABLE IF NOT EXISTS entities (
    entity TEXT NOT NULL,
    id TEXT NOT NULL,
    data TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (entity, id)
)
"#;

/// SQL for creating the entities table (PostgreSQL).
pub const CREATE_ENTITIES_TABLE_POSTGRES: &str = r#"
CREATE TABLE IF NOT EXISTS entities (
    entity TEXT NOT NULL,
    id TEXT NOT NULL,
    data TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (entity, id)
)
"#;
