//! Record storage for `dbx` scripts.
//!
//! Records are JSON objects grouped into named collections. The `db`
//! binding group reads and writes them through this repository.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::{Map, Value};

use crate::db::DbPool;
use crate::error::Result;
use crate::WardenError;

/// Largest page `list` returns.
pub const MAX_LIST_LIMIT: i64 = 500;

/// Keys managed by the repository; ignored in caller data.
const RESERVED_KEYS: [&str; 3] = ["id", "created", "updated"];

static COLLECTION_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]{0,63}$").expect("valid regex"));

#[derive(Debug, sqlx::FromRow)]
struct RecordRow {
    id: String,
    data: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl RecordRow {
    /// Flatten into `{id, created, updated, ...fields}`.
    fn into_value(self) -> Result<Value> {
        let mut fields: Map<String, Value> = serde_json::from_str(&self.data)?;
        fields.insert("id".to_string(), Value::String(self.id));
        fields.insert("created".to_string(), Value::String(self.created_at.to_rfc3339()));
        fields.insert("updated".to_string(), Value::String(self.updated_at.to_rfc3339()));
        Ok(Value::Object(fields))
    }
}

fn check_collection(collection: &str) -> Result<()> {
    if COLLECTION_NAME.is_match(collection) {
        Ok(())
    } else {
        Err(WardenError::Validation(format!(
            "invalid collection name: '{collection}'"
        )))
    }
}

fn data_fields(data: Value) -> Result<Map<String, Value>> {
    match data {
        Value::Object(mut fields) => {
            for key in RESERVED_KEYS {
                fields.remove(key);
            }
            Ok(fields)
        }
        Value::Null => Ok(Map::new()),
        other => Err(WardenError::Validation(format!(
            "record data must be an object, got {other}"
        ))),
    }
}

/// SQLite-backed collection records.
#[derive(Clone)]
pub struct RecordRepository {
    pool: DbPool,
}

impl RecordRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Get one record.
    pub async fn find(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        check_collection(collection)?;
        let row = sqlx::query_as::<_, RecordRow>(
            "SELECT id, data, created_at, updated_at FROM script_records WHERE collection = $1 AND id = $2",
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(RecordRow::into_value).transpose()
    }

    /// Oldest records first, at most `limit` (capped at [`MAX_LIST_LIMIT`]).
    pub async fn list(&self, collection: &str, limit: i64) -> Result<Vec<Value>> {
        check_collection(collection)?;
        let rows = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT id, data, created_at, updated_at FROM script_records
            WHERE collection = $1
            ORDER BY created_at, id
            LIMIT $2
            "#,
        )
        .bind(collection)
        .bind(limit.clamp(0, MAX_LIST_LIMIT))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(RecordRow::into_value).collect()
    }

    /// Insert a record with a fresh id and return it.
    pub async fn insert(&self, collection: &str, data: Value) -> Result<Value> {
        check_collection(collection)?;
        let data = serde_json::to_string(&data_fields(data)?)?;
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO script_records (collection, id, data, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(collection)
        .bind(&id)
        .bind(&data)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        RecordRow {
            id,
            data,
            created_at: now,
            updated_at: now,
        }
        .into_value()
    }

    /// Merge `data` into an existing record. Returns the updated record, or
    /// None if it does not exist.
    pub async fn update(&self, collection: &str, id: &str, data: Value) -> Result<Option<Value>> {
        check_collection(collection)?;
        let changes = data_fields(data)?;

        let mut tx = self.pool.begin().await?;
        let current: Option<(String,)> = sqlx::query_as(
            "SELECT data FROM script_records WHERE collection = $1 AND id = $2",
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((current,)) = current else {
            return Ok(None);
        };

        let mut fields: Map<String, Value> = serde_json::from_str(&current)?;
        fields.extend(changes);
        sqlx::query(
            "UPDATE script_records SET data = $1, updated_at = $2 WHERE collection = $3 AND id = $4",
        )
        .bind(serde_json::to_string(&fields)?)
        .bind(Utc::now())
        .bind(collection)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.find(collection, id).await
    }

    /// Delete a record. Returns false if it did not exist.
    pub async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        check_collection(collection)?;
        let result = sqlx::query("DELETE FROM script_records WHERE collection = $1 AND id = $2")
            .bind(collection)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count(&self, collection: &str) -> Result<i64> {
        check_collection(collection)?;
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM script_records WHERE collection = $1")
                .bind(collection)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.0)
    }
}
