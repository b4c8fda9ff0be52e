//! Script types and data structures.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Result, WardenError};

/// Script category.
///
/// The first four decide how a script is triggered; the rest name the
/// binding group installed while the script runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Manual,
    Hook,
    Router,
    Cron,
    Dbx,
    Mails,
    Security,
    Filesystem,
    Filepath,
    Os,
    Forms,
    Apis,
    Http,
}

impl Category {
    /// Every category, in declaration order.
    pub const ALL: [Category; 13] = [
        Category::Manual,
        Category::Hook,
        Category::Router,
        Category::Cron,
        Category::Dbx,
        Category::Mails,
        Category::Security,
        Category::Filesystem,
        Category::Filepath,
        Category::Os,
        Category::Forms,
        Category::Apis,
        Category::Http,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Manual => "manual",
            Category::Hook => "hook",
            Category::Router => "router",
            Category::Cron => "cron",
            Category::Dbx => "dbx",
            Category::Mails => "mails",
            Category::Security => "security",
            Category::Filesystem => "filesystem",
            Category::Filepath => "filepath",
            Category::Os => "os",
            Category::Forms => "forms",
            Category::Apis => "apis",
            Category::Http => "http",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self> {
        Category::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| WardenError::Validation(format!("invalid script category: {s}")))
    }
}

/// A script as persisted by the store, before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptRecord {
    pub id: String,
    pub name: String,
    /// Free-form category string; validated on conversion to [`Script`].
    pub category: String,
    pub content: String,
    pub enabled: bool,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScriptRecord {
    /// Create an enabled record with empty metadata.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        category: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            category: category.into(),
            content: content.into(),
            enabled: true,
            priority: 0,
            metadata: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Set a metadata key.
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A validated script held by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Script {
    pub id: String,
    pub name: String,
    pub category: Category,
    pub content: String,
    pub enabled: bool,
    pub priority: i64,
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Script {
    /// Hook names this script declares.
    ///
    /// Reads `hooks` (a list of strings) and the legacy single `hook_type`.
    pub fn hook_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .metadata
            .get("hooks")
            .and_then(Value::as_array)
            .map(|hooks| hooks.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        if let Some(legacy) = self.metadata.get("hook_type").and_then(Value::as_str) {
            names.push(legacy);
        }
        names
    }

    /// Cron expression from `cron_expression` or `cron`.
    pub fn cron_expression(&self) -> Option<&str> {
        self.metadata
            .get("cron_expression")
            .or_else(|| self.metadata.get("cron"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Route `(method, path)` for router scripts. Method defaults to `GET`.
    pub fn route(&self) -> Option<(String, String)> {
        let path = self.metadata.get("path").and_then(Value::as_str)?;
        let method = self
            .metadata
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .to_uppercase();
        Some((method, path.to_string()))
    }
}

impl TryFrom<ScriptRecord> for Script {
    type Error = WardenError;

    fn try_from(record: ScriptRecord) -> Result<Self> {
        if record.id.trim().is_empty() {
            return Err(WardenError::Validation("script id is required".to_string()));
        }
        if record.name.trim().is_empty() {
            return Err(WardenError::Validation(
                "script name is required".to_string(),
            ));
        }
        if record.content.trim().is_empty() {
            return Err(WardenError::Validation(
                "script content is required".to_string(),
            ));
        }
        let category = record.category.parse::<Category>()?;

        Ok(Script {
            id: record.id,
            name: record.name,
            category,
            content: record.content,
            enabled: record.enabled,
            priority: record.priority,
            metadata: record.metadata,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }
}

impl From<&Script> for ScriptRecord {
    fn from(script: &Script) -> Self {
        ScriptRecord {
            id: script.id.clone(),
            name: script.name.clone(),
            category: script.category.to_string(),
            content: script.content.clone(),
            enabled: script.enabled,
            priority: script.priority,
            metadata: script.metadata.clone(),
            created_at: script.created_at,
            updated_at: script.updated_at,
        }
    }
}

/// What caused an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Manual,
    Hook,
    Cron,
    Route,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Manual => "manual",
            Trigger::Hook => "hook",
            Trigger::Cron => "cron",
            Trigger::Route => "route",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Trigger {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "manual" => Ok(Trigger::Manual),
            "hook" => Ok(Trigger::Hook),
            "cron" => Ok(Trigger::Cron),
            "route" => Ok(Trigger::Route),
            other => Err(WardenError::Validation(format!("invalid trigger: {other}"))),
        }
    }
}

/// Outcome of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Error,
    Timeout,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Error => "error",
            ExecutionStatus::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "success" => Ok(ExecutionStatus::Success),
            "error" => Ok(ExecutionStatus::Error),
            "timeout" => Ok(ExecutionStatus::Timeout),
            other => Err(WardenError::Validation(format!(
                "invalid execution status: {other}"
            ))),
        }
    }
}

/// Result of one script execution.
///
/// Exactly one of `output` and `error` is populated.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub script_id: String,
    pub trigger: Trigger,
    pub status: ExecutionStatus,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub stack_trace: Option<String>,
    pub input_snapshot: Value,
    pub executed_at: DateTime<Utc>,
}

fn serialize_millis<S: serde::Serializer>(
    duration: &Duration,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// What the interpreter produced, before timing is attached.
#[derive(Debug, Clone)]
pub(crate) enum Outcome {
    Success(Value),
    Error {
        message: String,
        stack_trace: Option<String>,
    },
    Timeout,
}

impl ExecutionResult {
    pub(crate) fn from_outcome(
        script_id: &str,
        trigger: Trigger,
        input: Value,
        outcome: Outcome,
        started_at: DateTime<Utc>,
        duration: Duration,
        ceiling: Duration,
    ) -> Self {
        let (status, output, error, stack_trace) = match outcome {
            Outcome::Success(value) => (ExecutionStatus::Success, Some(value), None, None),
            Outcome::Error {
                message,
                stack_trace,
            } => (ExecutionStatus::Error, None, Some(message), stack_trace),
            Outcome::Timeout => (
                ExecutionStatus::Timeout,
                None,
                Some(WardenError::Timeout(ceiling).to_string()),
                None,
            ),
        };

        Self {
            script_id: script_id.to_string(),
            trigger,
            status,
            duration,
            output,
            error,
            stack_trace,
            input_snapshot: input,
            executed_at: started_at,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}
