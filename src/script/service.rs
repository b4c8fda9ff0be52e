//! Execution coordinator.
//!
//! Every trigger (manual, hook, cron, route) funnels through
//! [`ScriptService::run`]: resolve the script, borrow an interpreter, race
//! the run against the time ceiling, then record the result.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};

use super::interpreter::CancelToken;
use super::log_repository::ExecutionLogSink;
use super::pool::InterpreterPool;
use super::registry::ScriptRegistry;
use super::repository::ScriptStore;
use super::types::{ExecutionResult, ExecutionStatus, Outcome, Script, ScriptRecord, Trigger};
use crate::{Result, WardenError};

/// Runs scripts and records the results.
pub struct ScriptService {
    registry: Arc<ScriptRegistry>,
    pool: Arc<InterpreterPool>,
    store: Arc<dyn ScriptStore>,
    sink: Arc<dyn ExecutionLogSink>,
    ceiling: Duration,
}

impl ScriptService {
    pub fn new(
        registry: Arc<ScriptRegistry>,
        pool: Arc<InterpreterPool>,
        store: Arc<dyn ScriptStore>,
        sink: Arc<dyn ExecutionLogSink>,
        ceiling: Duration,
    ) -> Self {
        Self {
            registry,
            pool,
            store,
            sink,
            ceiling,
        }
    }

    pub fn registry(&self) -> &Arc<ScriptRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<InterpreterPool> {
        &self.pool
    }

    pub fn store(&self) -> &Arc<dyn ScriptStore> {
        &self.store
    }

    pub fn sink(&self) -> &Arc<dyn ExecutionLogSink> {
        &self.sink
    }

    /// Maximum wall-clock time of a single run.
    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }

    /// Load a record into the registry off the async runtime.
    pub async fn load(&self, record: ScriptRecord) -> Result<Arc<Script>> {
        let registry = Arc::clone(&self.registry);
        tokio::task::spawn_blocking(move || registry.load(record))
            .await
            .map_err(|e| WardenError::Resource(format!("script load task failed: {e}")))?
    }

    /// Run a script.
    ///
    /// Script failures and timeouts are reported in the result. Errors are
    /// returned only when the script cannot be run at all; those runs are
    /// not logged.
    pub async fn run(&self, id: &str, input: Value, trigger: Trigger) -> Result<ExecutionResult> {
        let script = self.resolve(id).await?;
        if !script.enabled {
            return Err(WardenError::Disabled(id.to_string()));
        }

        let started_at = Utc::now();
        let start = Instant::now();
        let cancel = CancelToken::new();
        let ceiling = self.ceiling;

        let worker = {
            let pool = Arc::clone(&self.pool);
            let script = Arc::clone(&script);
            let input = input.clone();
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || {
                pool.run(|interpreter| interpreter.run(&script, &input, &cancel, ceiling))
            })
        };

        let outcome = match tokio::time::timeout(ceiling, worker).await {
            Ok(Ok(outcome)) => outcome?,
            Ok(Err(e)) => Outcome::Error {
                message: format!("script worker failed: {e}"),
                stack_trace: None,
            },
            Err(_) => {
                // The interpreter stops at its next instruction boundary and
                // its slot goes back to the pool.
                cancel.cancel();
                Outcome::Timeout
            }
        };

        let result = ExecutionResult::from_outcome(
            id,
            trigger,
            input,
            outcome,
            started_at,
            start.elapsed(),
            ceiling,
        );
        debug!(
            "Script '{}' ({}) finished: {} in {:?}",
            id, trigger, result.status, result.duration
        );

        if let Err(e) = self.sink.append(&result).await {
            warn!("Failed to record execution of script '{}': {}", id, e);
        }
        Ok(result)
    }

    /// Run a script manually, turning failed runs into errors.
    pub async fn execute(&self, id: &str, input: Value) -> Result<ExecutionResult> {
        let result = self.run(id, input, Trigger::Manual).await?;
        match result.status {
            ExecutionStatus::Success => Ok(result),
            ExecutionStatus::Error => Err(WardenError::Runtime {
                message: result.error.unwrap_or_default(),
                stack_trace: result.stack_trace,
            }),
            ExecutionStatus::Timeout => Err(WardenError::Timeout(self.ceiling)),
        }
    }

    pub(crate) async fn resolve(&self, id: &str) -> Result<Arc<Script>> {
        if let Some(script) = self.registry.get(id) {
            return Ok(script);
        }

        let record = self
            .store
            .find_by_id(id)
            .await?
            .ok_or_else(|| WardenError::NotFound(format!("script '{id}'")))?;
        debug!("Script '{}' not cached, loading from store", id);
        self.load(record).await?;

        self.registry
            .get(id)
            .ok_or_else(|| WardenError::NotFound(format!("script '{id}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::script::log_repository::{ScriptLog, ScriptLogRepository, ScriptMetrics};
    use crate::script::repository::ScriptRepository;
    use crate::script::sandbox::{Sandbox, SandboxProfile};
    use crate::script::scheduler::{CronScheduler, TriggerManager};
    use async_trait::async_trait;
    use serde_json::json;

    struct Fixture {
        _db: Database,
        service: ScriptService,
        scripts: ScriptRepository,
        logs: ScriptLogRepository,
    }

    async fn fixture_with(profile: SandboxProfile, pool_size: usize) -> Fixture {
        let db = Database::open_in_memory().await.unwrap();
        let scripts = ScriptRepository::new(db.pool().clone());
        let logs = ScriptLogRepository::new(db.pool().clone());

        let ceiling = profile.max_execution_time;
        let sandbox = Sandbox::new(Arc::new(profile));
        let triggers = Arc::new(TriggerManager::new(Arc::new(CronScheduler::new())));
        let registry = Arc::new(ScriptRegistry::new(sandbox.clone(), triggers).unwrap());
        let pool = Arc::new(InterpreterPool::with_sandbox(pool_size, sandbox).unwrap());
        let service = ScriptService::new(
            registry,
            pool,
            Arc::new(scripts.clone()),
            Arc::new(logs.clone()),
            ceiling,
        );

        Fixture {
            _db: db,
            service,
            scripts,
            logs,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(SandboxProfile::default(), 2).await
    }

    #[tokio::test]
    async fn test_run_success_is_logged() {
        let f = fixture().await;
        f.service
            .load(ScriptRecord::new("s1", "Sum", "manual", "return 2+2;"))
            .await
            .unwrap();

        let result = f.service.run("s1", Value::Null, Trigger::Manual).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.output, Some(json!(4)));
        assert!(result.error.is_none());

        let logs = f.logs.recent("s1", 10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, ExecutionStatus::Success);
    }

    #[tokio::test]
    async fn test_input_is_bound() {
        let f = fixture().await;
        f.service
            .load(ScriptRecord::new("s1", "Echo", "manual", "return input.n * 2"))
            .await
            .unwrap();

        let result = f.service.run("s1", json!({"n": 21}), Trigger::Manual).await.unwrap();
        assert_eq!(result.output, Some(json!(42)));
        assert_eq!(result.input_snapshot, json!({"n": 21}));
    }

    #[tokio::test]
    async fn test_runtime_error_result() {
        let f = fixture().await;
        f.service
            .load(ScriptRecord::new("s1", "Broken", "manual", "error('kaput')"))
            .await
            .unwrap();

        let result = f.service.run("s1", Value::Null, Trigger::Hook).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Error);
        assert!(result.output.is_none());
        assert!(result.error.as_deref().unwrap().contains("kaput"));

        let err = f.service.execute("s1", Value::Null).await.unwrap_err();
        assert!(matches!(err, WardenError::Runtime { .. }));
        // Both runs are logged
        assert_eq!(f.logs.count("s1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_caught_timeout_is_still_a_timeout() {
        let profile = SandboxProfile {
            max_execution_time: Duration::from_secs(1),
            ..SandboxProfile::default()
        };
        let f = fixture_with(profile, 1).await;
        f.service
            .load(ScriptRecord::new(
                "s1",
                "Escape",
                "manual",
                "local ok, e = pcall(function() while true do end end) return 'escaped'",
            ))
            .await
            .unwrap();

        let result = f.service.run("s1", Value::Null, Trigger::Manual).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Timeout);
        assert!(result.output.is_none());
        let logs = f.logs.recent("s1", 10).await.unwrap();
        assert_eq!(logs[0].status, ExecutionStatus::Timeout);
    }

    #[tokio::test]
    async fn test_timeout_returns_slot() {
        let profile = SandboxProfile {
            max_execution_time: Duration::from_secs(1),
            ..SandboxProfile::default()
        };
        let f = fixture_with(profile, 1).await;
        f.service
            .load(ScriptRecord::new("s1", "Spin", "manual", "while true do end"))
            .await
            .unwrap();

        let start = Instant::now();
        let result = f.service.run("s1", Value::Null, Trigger::Manual).await.unwrap();
        let elapsed = start.elapsed();
        assert_eq!(result.status, ExecutionStatus::Timeout);
        assert!(result.output.is_none());
        assert!(elapsed >= Duration::from_millis(900), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(3), "{elapsed:?}");

        // Slot comes back once the interpreter notices the interrupt
        let mut busy = f.service.pool().stats().busy;
        for _ in 0..50 {
            if busy == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            busy = f.service.pool().stats().busy;
        }
        assert_eq!(busy, 0);

        let err = f.service.execute("s1", Value::Null).await.unwrap_err();
        assert!(matches!(err, WardenError::Timeout(_)));
        assert_eq!(f.service.pool().stats().overflow_total, 0);
    }

    #[tokio::test]
    async fn test_store_miss_loads_on_demand() {
        let f = fixture().await;
        f.scripts
            .upsert(&ScriptRecord::new("s1", "Stored", "manual", "return 'hi'"))
            .await
            .unwrap();

        assert!(f.service.registry().get("s1").is_none());
        let result = f.service.execute("s1", Value::Null).await.unwrap();
        assert_eq!(result.output, Some(json!("hi")));
        assert!(f.service.registry().get("s1").is_some());
    }

    #[tokio::test]
    async fn test_not_found_and_disabled_are_not_logged() {
        let f = fixture().await;
        let err = f.service.run("ghost", Value::Null, Trigger::Manual).await.unwrap_err();
        assert!(matches!(err, WardenError::NotFound(_)));

        f.service
            .load(ScriptRecord::new("s1", "Off", "manual", "return 1").with_enabled(false))
            .await
            .unwrap();
        let err = f.service.execute("s1", Value::Null).await.unwrap_err();
        assert!(matches!(err, WardenError::Disabled(_)));

        assert_eq!(f.logs.count("ghost").await.unwrap(), 0);
        assert_eq!(f.logs.count("s1").await.unwrap(), 0);
    }

    struct FailingSink;

    #[async_trait]
    impl ExecutionLogSink for FailingSink {
        async fn append(&self, _result: &ExecutionResult) -> Result<i64> {
            Err(WardenError::Database("disk full".to_string()))
        }

        async fn recent(&self, _script_id: &str, _limit: usize) -> Result<Vec<ScriptLog>> {
            Ok(Vec::new())
        }

        async fn metrics(&self, _script_id: &str) -> Result<ScriptMetrics> {
            Ok(ScriptMetrics::default())
        }

        async fn prune(&self, _days: i32) -> Result<u64> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_sink_failure_does_not_fail_run() {
        let f = fixture().await;
        let service = ScriptService::new(
            Arc::clone(f.service.registry()),
            Arc::clone(f.service.pool()),
            Arc::new(f.scripts.clone()),
            Arc::new(FailingSink),
            f.service.ceiling(),
        );
        service
            .load(ScriptRecord::new("s1", "Sum", "manual", "return 1"))
            .await
            .unwrap();

        let result = service.execute("s1", Value::Null).await.unwrap();
        assert!(result.is_success());
    }
}
