//! Script store: the trait the engine reads scripts through, and its
//! SQLite implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::warn;

use super::types::{Category, ScriptRecord};
use crate::db::DbPool;
use crate::error::Result;
use crate::WardenError;

/// Where scripts are persisted.
#[async_trait]
pub trait ScriptStore: Send + Sync {
    /// Get a script by id.
    async fn find_by_id(&self, id: &str) -> Result<Option<ScriptRecord>>;

    /// All enabled scripts, optionally limited to one category.
    async fn find_all_enabled(&self, category: Option<Category>) -> Result<Vec<ScriptRecord>>;

    /// Enable or disable a script. Returns false if it does not exist.
    async fn set_enabled(&self, id: &str, enabled: bool) -> Result<bool>;
}

#[derive(Debug, sqlx::FromRow)]
struct ScriptRow {
    id: String,
    name: String,
    category: String,
    content: String,
    enabled: bool,
    priority: i64,
    metadata: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ScriptRow> for ScriptRecord {
    type Error = WardenError;

    fn try_from(row: ScriptRow) -> Result<Self> {
        let metadata = serde_json::from_str::<Map<String, Value>>(&row.metadata).map_err(|e| {
            WardenError::Validation(format!("invalid metadata for script '{}': {e}", row.id))
        })?;
        Ok(ScriptRecord {
            id: row.id,
            name: row.name,
            category: row.category,
            content: row.content,
            enabled: row.enabled,
            priority: row.priority,
            metadata,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const SELECT_COLUMNS: &str =
    "SELECT id, name, category, content, enabled, priority, metadata, created_at, updated_at FROM scripts";

/// SQLite-backed [`ScriptStore`].
#[derive(Clone)]
pub struct ScriptRepository {
    pool: DbPool,
}

impl ScriptRepository {
    /// Create a new script repository.
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Insert a script or replace the one with the same id.
    pub async fn upsert(&self, record: &ScriptRecord) -> Result<()> {
        let metadata = serde_json::to_string(&record.metadata)?;
        sqlx::query(
            r#"
            INSERT INTO scripts (id, name, category, content, enabled, priority, metadata, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                category = excluded.category,
                content = excluded.content,
                enabled = excluded.enabled,
                priority = excluded.priority,
                metadata = excluded.metadata,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.id)
        .bind(&record.name)
        .bind(&record.category)
        .bind(&record.content)
        .bind(record.enabled)
        .bind(record.priority)
        .bind(metadata)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Delete a script. Returns false if it did not exist.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM scripts WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl ScriptStore for ScriptRepository {
    async fn find_by_id(&self, id: &str) -> Result<Option<ScriptRecord>> {
        let row = sqlx::query_as::<_, ScriptRow>(&format!("{SELECT_COLUMNS} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(ScriptRecord::try_from).transpose()
    }

    async fn find_all_enabled(&self, category: Option<Category>) -> Result<Vec<ScriptRecord>> {
        let rows = match category {
            Some(category) => {
                sqlx::query_as::<_, ScriptRow>(&format!(
                    "{SELECT_COLUMNS} WHERE enabled = 1 AND category = $1 ORDER BY priority DESC, name"
                ))
                .bind(category.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, ScriptRow>(&format!(
                    "{SELECT_COLUMNS} WHERE enabled = 1 ORDER BY priority DESC, name"
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };
        // One unreadable row must not keep the rest from loading
        Ok(rows
            .into_iter()
            .filter_map(|row| match ScriptRecord::try_from(row) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!("Skipping stored script: {}", e);
                    None
                }
            })
            .collect())
    }

    async fn set_enabled(&self, id: &str, enabled: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE scripts SET enabled = $1, updated_at = $2 WHERE id = $3")
            .bind(enabled)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
