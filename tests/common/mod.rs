//! Test helpers for engine integration tests.

#![allow(dead_code)]

use std::path::PathBuf;
use std::time::Duration;

use tempfile::TempDir;

use warden::config::Config;
use warden::script::ScriptRepository;
use warden::{Database, ScriptEngine, ScriptRecord};

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// An engine backed by a file database in a temporary directory.
pub struct TestEngine {
    pub engine: ScriptEngine,
    pub scripts: ScriptRepository,
    pub db: Database,
    _dir: TempDir,
}

impl TestEngine {
    /// Create an engine with the default configuration.
    pub async fn new() -> Self {
        Self::with_config(Config::default()).await
    }

    /// Create an engine with a custom configuration.
    ///
    /// The database path is always replaced with one inside a temporary
    /// directory.
    pub async fn with_config(mut config: Config) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path: PathBuf = dir.path().join("warden.db");
        config.database.path = path.to_string_lossy().to_string();

        let db = Database::open(&path).await.expect("Failed to open database");
        let engine = ScriptEngine::with_database(&config, &db).expect("Failed to build engine");
        let scripts = ScriptRepository::new(db.pool().clone());

        Self {
            engine,
            scripts,
            db,
            _dir: dir,
        }
    }

    /// Store a script and load it into the engine.
    pub async fn add(&self, record: ScriptRecord) {
        self.scripts.upsert(&record).await.expect("Failed to store script");
        self.engine.load(record).await.expect("Failed to load script");
    }
}

/// A config whose execution ceiling is `secs` seconds.
pub fn config_with_ceiling(secs: u64, pool_size: usize) -> Config {
    let mut config = Config::default();
    config.sandbox.max_execution_secs = secs;
    config.engine.pool_size = pool_size;
    config
}
