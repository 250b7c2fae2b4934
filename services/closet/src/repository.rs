use crate::config::DatabaseConfig;
use crate::error::DataError;
use crate::keys::ObjectKey;
use crate::model::{ClosetItem, ItemDetails, ItemId, ItemQuery, NewClosetItem, OwnerId};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Typed record API for closet items.
///
/// Every call is scoped to `owner`: records of other owners are invisible,
/// as if they did not exist.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ItemRepository: Send + Sync {
    async fn create(&self, item: NewClosetItem) -> Result<ClosetItem, DataError>;

    async fn list(&self, owner: &OwnerId, query: &ItemQuery) -> Result<Vec<ClosetItem>, DataError>;

    async fn get(&self, owner: &OwnerId, id: ItemId) -> Result<Option<ClosetItem>, DataError>;

    /// Replace the descriptive fields; photos are untouched
    async fn update(
        &self,
        owner: &OwnerId,
        id: ItemId,
        details: ItemDetails,
    ) -> Result<Option<ClosetItem>, DataError>;

    /// Returns whether a record was removed
    async fn delete(&self, owner: &OwnerId, id: ItemId) -> Result<bool, DataError>;
}

/// Closet item row as stored in PostgreSQL
#[derive(Debug, Clone, FromRow)]
struct ClosetItemRow {
    id: Uuid,
    owner_id: String,
    brand: String,
    item_name: String,
    category: String,
    size: String,
    color: String,
    photo_keys: Vec<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ClosetItemRow> for ClosetItem {
    type Error = DataError;

    fn try_from(row: ClosetItemRow) -> Result<Self, Self::Error> {
        let corrupt = |what: String| DataError::Backend(format!("record {} has {}", row.id, what));

        let owner_id = OwnerId::new(row.owner_id.clone())
            .ok_or_else(|| corrupt("an empty owner".to_string()))?;
        let category = row
            .category
            .parse()
            .map_err(|e| corrupt(format!("{e}")))?;
        let photo_keys = row
            .photo_keys
            .iter()
            .map(|k| ObjectKey::try_from(k.as_str()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| corrupt(e.to_string()))?;

        Ok(ClosetItem {
            id: ItemId(row.id),
            owner_id,
            details: ItemDetails {
                brand: row.brand,
                item_name: row.item_name,
                category,
                size: row.size,
                color: row.color,
            },
            photo_keys,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const ITEM_COLUMNS: &str = "id, owner_id, brand, item_name, category, size, color, \
                            photo_keys, created_at, updated_at";

/// PostgreSQL-backed item repository
pub struct PgItemRepository {
    pool: PgPool,
}

impl PgItemRepository {
    /// Create a new repository with connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl ItemRepository for PgItemRepository {
    #[instrument(skip(self, item), fields(owner = %item.owner_id, photos = item.photo_keys.len()))]
    async fn create(&self, item: NewClosetItem) -> Result<ClosetItem, DataError> {
        let photo_keys: Vec<String> = item
            .photo_keys
            .iter()
            .map(|k| k.as_str().to_string())
            .collect();

        let row = sqlx::query_as::<_, ClosetItemRow>(&format!(
            r#"
            INSERT INTO closet_items (
                id, owner_id, brand, item_name, category, size, color,
                photo_keys, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW(), NOW())
            RETURNING {ITEM_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(item.owner_id.as_str())
        .bind(&item.details.brand)
        .bind(&item.details.item_name)
        .bind(item.details.category.as_str())
        .bind(&item.details.size)
        .bind(&item.details.color)
        .bind(&photo_keys)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        debug!(item_id = %row.id, "Closet item inserted");
        row.try_into()
    }

    #[instrument(skip(self))]
    async fn list(&self, owner: &OwnerId, query: &ItemQuery) -> Result<Vec<ClosetItem>, DataError> {
        let rows = sqlx::query_as::<_, ClosetItemRow>(&format!(
            r#"
            SELECT {ITEM_COLUMNS}
            FROM closet_items
            WHERE owner_id = $1
              AND ($2::text IS NULL OR category = $2)
            ORDER BY created_at DESC, id
            LIMIT $3 OFFSET $4
            "#
        ))
        .bind(owner.as_str())
        .bind(query.category.map(|c| c.as_str()))
        .bind(query.limit)
        .bind(query.offset.unwrap_or(0))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter().map(ClosetItem::try_from).collect()
    }

    #[instrument(skip(self))]
    async fn get(&self, owner: &OwnerId, id: ItemId) -> Result<Option<ClosetItem>, DataError> {
        let row = sqlx::query_as::<_, ClosetItemRow>(&format!(
            "SELECT {ITEM_COLUMNS} FROM closet_items WHERE id = $1 AND owner_id = $2"
        ))
        .bind(id.0)
        .bind(owner.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.map(ClosetItem::try_from).transpose()
    }

    #[instrument(skip(self, details))]
    async fn update(
        &self,
        owner: &OwnerId,
        id: ItemId,
        details: ItemDetails,
    ) -> Result<Option<ClosetItem>, DataError> {
        let row = sqlx::query_as::<_, ClosetItemRow>(&format!(
            r#"
            UPDATE closet_items
            SET brand = $3, item_name = $4, category = $5, size = $6, color = $7,
                updated_at = NOW()
            WHERE id = $1 AND owner_id = $2
            RETURNING {ITEM_COLUMNS}
            "#
        ))
        .bind(id.0)
        .bind(owner.as_str())
        .bind(&details.brand)
        .bind(&details.item_name)
        .bind(details.category.as_str())
        .bind(&details.size)
        .bind(&details.color)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.map(ClosetItem::try_from).transpose()
    }

    #[instrument(skip(self))]
    async fn delete(&self, owner: &OwnerId, id: ItemId) -> Result<bool, DataError> {
        let result = sqlx::query("DELETE FROM closet_items WHERE id = $1 AND owner_id = $2")
            .bind(id.0)
            .bind(owner.as_str())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() > 0)
    }
}

/// Constraint violations are the data API's validation errors
fn map_sqlx_error(error: sqlx::Error) -> DataError {
    match &error {
        sqlx::Error::RowNotFound => DataError::NotFound("row".to_string()),
        sqlx::Error::Database(db) => match db.constraint() {
            Some(constraint) => DataError::Validation(vec![format!(
                "violates {constraint}: {}",
                db.message()
            )]),
            None => DataError::Backend(error.to_string()),
        },
        _ => DataError::Backend(error.to_string()),
    }
}
