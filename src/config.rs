//! Configuration module for warden.

use serde::Deserialize;
use std::path::Path;

use crate::{Result, WardenError};

/// Engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Number of pre-warmed interpreters in the pool.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Fall back to matching hook events against script names when no
    /// script declares the event in its metadata.
    #[serde(default = "default_hook_name_fallback")]
    pub hook_name_fallback: bool,
    /// Execution logs older than this are pruned on start (0 = keep forever).
    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: i32,
    /// Capacity of the hook event bus.
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
}

fn default_pool_size() -> usize {
    5
}

fn default_hook_name_fallback() -> bool {
    true
}

fn default_log_retention_days() -> i32 {
    30
}

fn default_event_bus_capacity() -> usize {
    256
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            hook_name_fallback: default_hook_name_fallback(),
            log_retention_days: default_log_retention_days(),
            event_bus_capacity: default_event_bus_capacity(),
        }
    }
}

/// Sandbox configuration applied to every interpreter.
#[derive(Debug, Clone, Deserialize)]
pub struct SandboxConfig {
    /// Maximum execution time in seconds.
    #[serde(default = "default_max_execution_secs")]
    pub max_execution_secs: u64,
    /// Maximum call stack depth.
    #[serde(default = "default_max_call_depth")]
    pub max_call_depth: usize,
    /// Maximum memory per interpreter in megabytes (0 = unlimited).
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: usize,
    /// Maximum script size in bytes.
    #[serde(default = "default_max_script_bytes")]
    pub max_script_bytes: usize,
    /// Maximum number of `{` characters in a script.
    #[serde(default = "default_max_brace_count")]
    pub max_brace_count: usize,
    /// Modules that `require` may return.
    #[serde(default = "default_allowed_modules")]
    pub allowed_modules: Vec<String>,
    /// Globals removed from every interpreter.
    #[serde(default = "default_blocked_globals")]
    pub blocked_globals: Vec<String>,
    /// Expose the `http` binding group.
    #[serde(default)]
    pub allow_network: bool,
    /// Expose `io`, file functions of `os` and the `fs` binding group.
    #[serde(default)]
    pub allow_filesystem: bool,
    /// Expose process functions of `os` and the `sys` binding group.
    #[serde(default)]
    pub allow_process: bool,
    /// Directory the `fs` binding group is confined to.
    #[serde(default)]
    pub fs_root: Option<String>,
}

fn default_max_execution_secs() -> u64 {
    30
}

fn default_max_call_depth() -> usize {
    1000
}

fn default_max_memory_mb() -> usize {
    50
}

fn default_max_script_bytes() -> usize {
    100_000 // 100KB
}

fn default_max_brace_count() -> usize {
    1000
}

pub(crate) fn default_allowed_modules() -> Vec<String> {
    ["console", "json", "math", "string", "table", "utf8"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

pub(crate) fn default_blocked_globals() -> Vec<String> {
    [
        "load",
        "loadstring",
        "dofile",
        "loadfile",
        "collectgarbage",
        "getmetatable",
        "setmetatable",
        "rawget",
        "rawset",
        "rawequal",
        "rawlen",
        "_G",
        "debug",
        "package",
        "eval",
        "Function",
        "setTimeout",
        "setInterval",
        "process",
        "global",
        "globalThis",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_execution_secs: default_max_execution_secs(),
            max_call_depth: default_max_call_depth(),
            max_memory_mb: default_max_memory_mb(),
            max_script_bytes: default_max_script_bytes(),
            max_brace_count: default_max_brace_count(),
            allowed_modules: default_allowed_modules(),
            blocked_globals: default_blocked_globals(),
            allow_network: false,
            allow_filesystem: false,
            allow_process: false,
            fs_root: None,
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "data/warden.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Path to the log file.
    #[serde(default = "default_log_file")]
    pub file: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "logs/warden.log".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Sandbox configuration.
    #[serde(default)]
    pub sandbox: SandboxConfig,
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(WardenError::Io)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML file and apply environment variable overrides.
    pub fn load_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| WardenError::Config(format!("config parse error: {e}")))
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported environment variables:
    /// - `WARDEN_DATABASE_PATH`: Override the database path
    /// - `WARDEN_LOG_LEVEL`: Override the log level
    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("WARDEN_DATABASE_PATH") {
            if !path.is_empty() {
                self.database.path = path;
            }
        }
        if let Ok(level) = std::env::var("WARDEN_LOG_LEVEL") {
            if !level.is_empty() {
                self.logging.level = level;
            }
        }
    }

    /// Validate the configuration.
    ///
    /// Returns an error if:
    /// - The pool size or execution time is zero
    /// - The filesystem capability is enabled without an `fs_root`
    pub fn validate(&self) -> Result<()> {
        if self.engine.pool_size == 0 {
            return Err(WardenError::Config(
                "engine.pool_size must be at least 1".to_string(),
            ));
        }
        if self.sandbox.max_execution_secs == 0 {
            return Err(WardenError::Config(
                "sandbox.max_execution_secs must be at least 1".to_string(),
            ));
        }
        if self.sandbox.allow_filesystem && self.sandbox.fs_root.is_none() {
            return Err(WardenError::Config(
                "sandbox.allow_filesystem requires sandbox.fs_root to be set".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.engine.pool_size, 5);
        assert!(config.engine.hook_name_fallback);
        assert_eq!(config.engine.log_retention_days, 30);
        assert_eq!(config.engine.event_bus_capacity, 256);

        assert_eq!(config.sandbox.max_execution_secs, 30);
        assert_eq!(config.sandbox.max_call_depth, 1000);
        assert_eq!(config.sandbox.max_memory_mb, 50);
        assert_eq!(config.sandbox.max_script_bytes, 100_000);
        assert_eq!(config.sandbox.max_brace_count, 1000);
        assert!(config.sandbox.allowed_modules.contains(&"json".to_string()));
        assert!(config.sandbox.blocked_globals.contains(&"load".to_string()));
        assert!(!config.sandbox.allow_network);
        assert!(!config.sandbox.allow_filesystem);
        assert!(!config.sandbox.allow_process);
        assert!(config.sandbox.fs_root.is_none());

        assert_eq!(config.database.path, "data/warden.db");

        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.file, "logs/warden.log");
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[engine]
pool_size = 8
hook_name_fallback = false
log_retention_days = 7
event_bus_capacity = 64

[sandbox]
max_execution_secs = 5
max_call_depth = 200
max_memory_mb = 16
max_script_bytes = 2048
max_brace_count = 50
allowed_modules = ["json"]
blocked_globals = ["load"]
allow_network = true
allow_filesystem = true
allow_process = true
fs_root = "/srv/scripts"

[database]
path = "custom/db.sqlite"

[logging]
level = "debug"
file = "custom/logs/app.log"
"#;

        let config = Config::parse(toml).unwrap();

        assert_eq!(config.engine.pool_size, 8);
        assert!(!config.engine.hook_name_fallback);
        assert_eq!(config.engine.log_retention_days, 7);
        assert_eq!(config.engine.event_bus_capacity, 64);

        assert_eq!(config.sandbox.max_execution_secs, 5);
        assert_eq!(config.sandbox.max_call_depth, 200);
        assert_eq!(config.sandbox.max_memory_mb, 16);
        assert_eq!(config.sandbox.max_script_bytes, 2048);
        assert_eq!(config.sandbox.max_brace_count, 50);
        assert_eq!(config.sandbox.allowed_modules, vec!["json".to_string()]);
        assert_eq!(config.sandbox.blocked_globals, vec!["load".to_string()]);
        assert!(config.sandbox.allow_network);
        assert!(config.sandbox.allow_filesystem);
        assert!(config.sandbox.allow_process);
        assert_eq!(config.sandbox.fs_root.as_deref(), Some("/srv/scripts"));

        assert_eq!(config.database.path, "custom/db.sqlite");

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.file, "custom/logs/app.log");

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_config() {
        let toml = r#"
[engine]
pool_size = 2
"#;

        let config = Config::parse(toml).unwrap();

        assert_eq!(config.engine.pool_size, 2);
        assert!(config.engine.hook_name_fallback);
        assert_eq!(config.sandbox.max_execution_secs, 30);
        assert_eq!(config.database.path, "data/warden.db");
    }

    #[test]
    fn test_parse_empty_config() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.engine.pool_size, 5);
    }

    #[test]
    fn test_parse_invalid_toml() {
        let result = Config::parse("invalid toml [[[");
        assert!(matches!(result, Err(WardenError::Config(_))));
    }

    #[test]
    fn test_validate_zero_pool_size() {
        let mut config = Config::default();
        config.engine.pool_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_filesystem_requires_root() {
        let mut config = Config::default();
        config.sandbox.allow_filesystem = true;
        assert!(config.validate().is_err());

        config.sandbox.fs_root = Some("/tmp".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[database]\npath = \"x.db\"\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.database.path, "x.db");
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load("/nonexistent/config.toml");
        assert!(matches!(result, Err(WardenError::Io(_))));
    }
}
