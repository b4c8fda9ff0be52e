//! Script execution log.
//!
//! Every execution result is mirrored here; the engine reads it back for
//! per-script history and metrics.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use super::types::{ExecutionResult, ExecutionStatus, Trigger};
use crate::db::DbPool;
use crate::error::Result;

/// A single script execution log entry.
#[derive(Debug, Clone, Serialize)]
pub struct ScriptLog {
    /// Unique identifier.
    pub id: i64,
    pub script_id: String,
    pub trigger: Trigger,
    pub status: ExecutionStatus,
    pub executed_at: DateTime<Utc>,
    /// Execution time in milliseconds.
    pub execution_ms: i64,
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub stack_trace: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct ScriptLogRow {
    id: i64,
    script_id: String,
    trigger_type: String,
    status: String,
    executed_at: DateTime<Utc>,
    execution_ms: i64,
    input: Option<String>,
    output: Option<String>,
    error_message: Option<String>,
    stack_trace: Option<String>,
}

impl TryFrom<ScriptLogRow> for ScriptLog {
    type Error = crate::WardenError;

    fn try_from(row: ScriptLogRow) -> Result<Self> {
        Ok(ScriptLog {
            id: row.id,
            script_id: row.script_id,
            trigger: row.trigger_type.parse()?,
            status: row.status.parse()?,
            executed_at: row.executed_at,
            execution_ms: row.execution_ms,
            input: row.input.as_deref().map(serde_json::from_str).transpose()?,
            output: row.output.as_deref().map(serde_json::from_str).transpose()?,
            error_message: row.error_message,
            stack_trace: row.stack_trace,
        })
    }
}

/// Aggregate statistics for one script.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScriptMetrics {
    pub total: i64,
    pub success: i64,
    pub error: i64,
    pub timeout: i64,
    /// Percentage of successful runs (0-100).
    pub success_rate: f64,
    pub avg_duration_ms: f64,
}

/// Where execution results are recorded.
#[async_trait]
pub trait ExecutionLogSink: Send + Sync {
    /// Record an execution. Returns the log id.
    async fn append(&self, result: &ExecutionResult) -> Result<i64>;

    /// Most recent entries for a script, newest first.
    async fn recent(&self, script_id: &str, limit: usize) -> Result<Vec<ScriptLog>>;

    /// Aggregate statistics for a script.
    async fn metrics(&self, script_id: &str) -> Result<ScriptMetrics>;

    /// Delete entries older than `days`. Returns the number removed.
    async fn prune(&self, days: i32) -> Result<u64>;
}

/// SQLite-backed [`ExecutionLogSink`].
#[derive(Clone)]
pub struct ScriptLogRepository {
    pool: DbPool,
}

impl ScriptLogRepository {
    /// Create a new script log repository.
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Get execution count for a script.
    pub async fn count(&self, script_id: &str) -> Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM script_logs WHERE script_id = $1")
            .bind(script_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(count.0)
    }
}

#[async_trait]
impl ExecutionLogSink for ScriptLogRepository {
    async fn append(&self, result: &ExecutionResult) -> Result<i64> {
        let input = match &result.input_snapshot {
            serde_json::Value::Null => None,
            value => Some(serde_json::to_string(value)?),
        };
        let output = result.output.as_ref().map(serde_json::to_string).transpose()?;

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO script_logs
                (script_id, trigger_type, status, executed_at, execution_ms, input, output, error_message, stack_trace)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id
            "#,
        )
        .bind(&result.script_id)
        .bind(result.trigger.as_str())
        .bind(result.status.as_str())
        .bind(result.executed_at)
        .bind(result.duration.as_millis() as i64)
        .bind(input)
        .bind(output)
        .bind(result.error.as_deref())
        .bind(result.stack_trace.as_deref())
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn recent(&self, script_id: &str, limit: usize) -> Result<Vec<ScriptLog>> {
        let rows = sqlx::query_as::<_, ScriptLogRow>(
            r#"
            SELECT id, script_id, trigger_type, status, executed_at, execution_ms,
                   input, output, error_message, stack_trace
            FROM script_logs
            WHERE script_id = $1
            ORDER BY id DESC
            LIMIT $2
            "#,
        )
        .bind(script_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ScriptLog::try_from).collect()
    }

    async fn metrics(&self, script_id: &str) -> Result<ScriptMetrics> {
        let (total, success, error, timeout, avg): (
            i64,
            Option<i64>,
            Option<i64>,
            Option<i64>,
            Option<f64>,
        ) = sqlx::query_as(
            r#"
            SELECT COUNT(*),
                   SUM(CASE WHEN status = 'success' THEN 1 ELSE 0 END),
                   SUM(CASE WHEN status = 'error' THEN 1 ELSE 0 END),
                   SUM(CASE WHEN status = 'timeout' THEN 1 ELSE 0 END),
                   AVG(execution_ms)
            FROM script_logs
            WHERE script_id = $1
            "#,
        )
        .bind(script_id)
        .fetch_one(&self.pool)
        .await?;

        if total == 0 {
            return Ok(ScriptMetrics::default());
        }

        let success = success.unwrap_or(0);
        Ok(ScriptMetrics {
            total,
            success,
            error: error.unwrap_or(0),
            timeout: timeout.unwrap_or(0),
            success_rate: (success as f64 / total as f64) * 100.0,
            avg_duration_ms: avg.unwrap_or(0.0),
        })
    }

    async fn prune(&self, days: i32) -> Result<u64> {
        let cutoff = Utc::now() - Duration::days(i64::from(days));

        let result = sqlx::query("DELETE FROM script_logs WHERE executed_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
