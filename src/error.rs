//! Error types for warden.

use std::time::Duration;

use thiserror::Error;

/// Common error type for warden.
#[derive(Error, Debug)]
pub enum WardenError {
    /// Malformed script definition or a script that fails to compile.
    #[error("validation error: {0}")]
    Validation(String),

    /// A script or operation rejected by the sandbox policy.
    ///
    /// Raised statically by pattern matching at load time, or at runtime when
    /// a script reaches for a blocked module.
    #[error("security violation [{kind}]: {description}")]
    SecurityViolation { kind: String, description: String },

    /// Resource not found.
    #[error("{0} not found")]
    NotFound(String),

    /// The script exists but is disabled.
    #[error("script is disabled: {0}")]
    Disabled(String),

    /// The script raised an error while running.
    #[error("runtime error: {message}")]
    Runtime {
        message: String,
        stack_trace: Option<String>,
    },

    /// The script exceeded its time ceiling.
    #[error("script execution timed out after {0:?}")]
    Timeout(Duration),

    /// Interpreter construction or pool failure.
    #[error("resource error: {0}")]
    Resource(String),

    /// Database error.
    ///
    /// Database errors from sqlx are automatically converted.
    #[error("database error: {0}")]
    Database(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl WardenError {
    /// Build a security violation of the given kind.
    pub fn security(kind: impl Into<String>, description: impl Into<String>) -> Self {
        WardenError::SecurityViolation {
            kind: kind.into(),
            description: description.into(),
        }
    }

    /// Whether this error is terminal at load time.
    pub fn is_load_rejection(&self) -> bool {
        matches!(
            self,
            WardenError::Validation(_) | WardenError::SecurityViolation { .. }
        )
    }
}

impl From<sqlx::Error> for WardenError {
    fn from(e: sqlx::Error) -> Self {
        WardenError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for WardenError {
    fn from(e: serde_json::Error) -> Self {
        WardenError::Validation(format!("invalid JSON: {e}"))
    }
}

/// Result type alias for warden operations.
pub type Result<T> = std::result::Result<T, WardenError>;
