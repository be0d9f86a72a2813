//! PostgreSQL EntityStore implementation.

use async_trait::async_trait;
use sea_query::{Expr, PostgresQueryBuilder, Query};
use sqlx::{PgPool, Row};

use super::schema::{Entities, CREATE_ENTITIES_TABLE_POSTGRES};
use super::{merge_record, EntityId, EntityStore, Record, Result, StoreError};

/// PostgreSQL implementation of EntityStore.
pub struct PostgresEntityStore {
    pool: PgPool,
}

impl PostgresEntityStore {
    /// Create a new PostgreSQL entity store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the entities table if it does not exist.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(CREATE_ENTITIES_TABLE_POSTGRES)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn select_query(entity: &str, id: &EntityId, for_update: bool) -> String {
        let mut query = Query::select();
        query
            .column(Entities::Data)
            .from(Entities::Table)
            .and_where(Expr::col(Entities::Entity).eq(entity))
            .and_where(Expr::col(Entities::Id).eq(id.as_str()));
        if for_update {
            query.lock(sea_query::LockType::Update);
        }
        query.to_string(PostgresQueryBuilder)
    }
}

fn decode_row(row: &sqlx::postgres::PgRow) -> Result<Record> {
    let data: String = row.try_get("data")?;
    Ok(serde_json::from_str(&data)?)
}

#[async_trait]
impl EntityStore for PostgresEntityStore {
    async fn find_by_id(&self, entity: &str, id: &EntityId) -> Result<Option<Record>> {
        let query = Self::select_query(entity, id, false);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.as_ref().map(decode_row).transpose()
    }

    async fn insert(&self, entity: &str, id: &EntityId, record: Record) -> Result<Record> {
        let data = serde_json::to_string(&record)?;

        let query = Query::insert()
            .into_table(Entities::Table)
            .columns([
                Entities::Entity,
                Entities::Id,
                Entities::Data,
                Entities::CreatedAt,
                Entities::UpdatedAt,
            ])
            .values_panic([
                entity.into(),
                id.as_str().into(),
                data.into(),
                Expr::current_timestamp().into(),
                Expr::current_timestamp().into(),
            ])
            .to_string(PostgresQueryBuilder);

        match sqlx::query(&query).execute(&self.pool).await {
            Ok(_) => Ok(record),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(StoreError::Conflict {
                entity: entity.to_string(),
                id: id.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, entity: &str, id: &EntityId, changes: Record) -> Result<Option<Record>> {
        let mut tx = self.pool.begin().await?;

        // Row lock keeps concurrent partial updates from losing each other's fields
        let select = Self::select_query(entity, id, true);
        let Some(row) = sqlx::query(&select).fetch_optional(&mut *tx).await? else {
            return Ok(None);
        };
        let merged = merge_record(decode_row(&row)?, changes, id);

        let query = Query::update()
            .table(Entities::Table)
            .values([
                (Entities::Data, serde_json::to_string(&merged)?.into()),
                (Entities::UpdatedAt, Expr::current_timestamp().into()),
            ])
            .and_where(Expr::col(Entities::Entity).eq(entity))
            .and_where(Expr::col(Entities::Id).eq(id.as_str()))
            .to_string(PostgresQueryBuilder);

        sqlx::query(&query).execute(&mut *tx).await?;
        tx.commit().await?;

        Ok(Some(merged))
    }

    async fn delete(&self, entity: &str, id: &EntityId) -> Result<bool> {
        let query = Query::delete()
            .from_table(Entities::Table)
            .and_where(Expr::col(Entities::Entity).eq(entity))
            .and_where(Expr::col(Entities::Id).eq(id.as_str()))
            .to_string(PostgresQueryBuilder);

        let result = sqlx::query(&query).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }
}
