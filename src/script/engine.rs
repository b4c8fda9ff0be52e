//! Script engine facade.
//!
//! Wires the sandbox, pool, registry, coordinator, hooks and scheduler
//! together and exposes the management operations.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::hooks::{HookDispatcher, HookEvent};
use super::log_repository::{ExecutionLogSink, ScriptLog, ScriptLogRepository, ScriptMetrics};
use super::pool::{InterpreterPool, PoolStats};
use super::record_repository::RecordRepository;
use super::registry::ScriptRegistry;
use super::repository::{ScriptRepository, ScriptStore};
use super::sandbox::{Sandbox, SandboxProfile};
use super::scheduler::{CronScheduler, Scheduler, TriggerManager};
use super::service::ScriptService;
use super::types::{Category, ExecutionResult, ExecutionStatus, Script, ScriptRecord, Trigger};
use crate::config::{Config, EngineConfig};
use crate::db::Database;
use crate::{Result, WardenError};

/// How often execution logs are pruned while the engine runs.
const RETENTION_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Point-in-time engine health.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: String,
    pub total_scripts: usize,
    pub enabled_scripts: usize,
    pub categories: BTreeMap<String, usize>,
    pub pool: PoolStats,
    pub scheduled_jobs: usize,
    pub checked_at: DateTime<Utc>,
}

/// A route exposed by a `router` script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    pub method: String,
    pub path: String,
    pub script_id: String,
}

/// Request handed to a router script.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

/// Response produced by a router script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteResponse {
    pub status: u16,
    pub body: String,
}

impl RouteResponse {
    fn from_result(result: &ExecutionResult) -> Self {
        match result.status {
            ExecutionStatus::Success => match &result.output {
                Some(Value::Object(map)) => {
                    let status = map
                        .get("status")
                        .and_then(Value::as_u64)
                        .and_then(|s| u16::try_from(s).ok())
                        .unwrap_or(200);
                    let body = match map.get("body") {
                        None | Some(Value::Null) => String::new(),
                        Some(Value::String(s)) => s.clone(),
                        Some(other) => other.to_string(),
                    };
                    Self { status, body }
                }
                Some(Value::String(s)) => Self {
                    status: 200,
                    body: s.clone(),
                },
                Some(Value::Null) | None => Self {
                    status: 200,
                    body: String::new(),
                },
                Some(other) => Self {
                    status: 200,
                    body: other.to_string(),
                },
            },
            ExecutionStatus::Error => Self {
                status: 500,
                body: result.error.clone().unwrap_or_default(),
            },
            ExecutionStatus::Timeout => Self {
                status: 504,
                body: result.error.clone().unwrap_or_default(),
            },
        }
    }
}

/// The sandboxed script engine.
pub struct ScriptEngine {
    config: EngineConfig,
    service: Arc<ScriptService>,
    hooks: Arc<HookDispatcher>,
    triggers: Arc<TriggerManager>,
    events: broadcast::Sender<HookEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl ScriptEngine {
    /// Build an engine with the cron scheduler.
    pub fn new(
        config: &EngineConfig,
        profile: SandboxProfile,
        store: Arc<dyn ScriptStore>,
        sink: Arc<dyn ExecutionLogSink>,
    ) -> Result<Self> {
        Self::with_scheduler(config, profile, store, sink, Arc::new(CronScheduler::new()))
    }

    /// Build an engine backed by the SQLite store and log. `dbx` scripts
    /// get a `db` group over the same database.
    pub fn with_database(config: &Config, db: &Database) -> Result<Self> {
        Self::build(
            &config.engine,
            SandboxProfile::from(&config.sandbox),
            Arc::new(ScriptRepository::new(db.pool().clone())),
            Arc::new(ScriptLogRepository::new(db.pool().clone())),
            Arc::new(CronScheduler::new()),
            Some(RecordRepository::new(db.pool().clone())),
        )
    }

    pub fn with_scheduler(
        config: &EngineConfig,
        profile: SandboxProfile,
        store: Arc<dyn ScriptStore>,
        sink: Arc<dyn ExecutionLogSink>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Result<Self> {
        Self::build(config, profile, store, sink, scheduler, None)
    }

    fn build(
        config: &EngineConfig,
        profile: SandboxProfile,
        store: Arc<dyn ScriptStore>,
        sink: Arc<dyn ExecutionLogSink>,
        scheduler: Arc<dyn Scheduler>,
        records: Option<RecordRepository>,
    ) -> Result<Self> {
        let ceiling = profile.max_execution_time;
        let sandbox = Sandbox::new(Arc::new(profile));

        let triggers = Arc::new(TriggerManager::new(scheduler));
        let registry = Arc::new(ScriptRegistry::new(sandbox.clone(), Arc::clone(&triggers))?);
        let pool = match records {
            Some(records) => InterpreterPool::with_records(config.pool_size, sandbox, records)?,
            None => InterpreterPool::with_sandbox(config.pool_size, sandbox)?,
        };
        let pool = Arc::new(pool);
        let service = Arc::new(ScriptService::new(registry, pool, store, sink, ceiling));
        triggers.bind(Arc::downgrade(&service));

        let hooks = Arc::new(HookDispatcher::new(
            Arc::clone(&service),
            config.hook_name_fallback,
        ));
        let (events, _) = broadcast::channel(config.event_bus_capacity.max(1));

        Ok(Self {
            config: config.clone(),
            service,
            hooks,
            triggers,
            events,
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        })
    }

    pub fn service(&self) -> &Arc<ScriptService> {
        &self.service
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Load every enabled script from the store and start the triggers.
    ///
    /// Scripts that fail to load are logged and skipped. Returns the number
    /// loaded.
    pub async fn start(&self) -> Result<usize> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(self.service.registry().len());
        }

        let records = match self.service.store().find_all_enabled(None).await {
            Ok(records) => records,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        let total = records.len();
        let mut loaded = 0;
        for record in records {
            let id = record.id.clone();
            match self.service.load(record).await {
                Ok(_) => loaded += 1,
                Err(e) if e.is_load_rejection() => warn!("Skipping script '{}': {}", id, e),
                Err(e) => error!("Failed to load script '{}': {}", id, e),
            }
        }

        self.triggers.scheduler().start();

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.push(self.hooks.subscribe(self.events.subscribe()));
        if self.config.log_retention_days > 0 {
            tasks.push(self.spawn_retention());
        }

        info!("Script engine started: {}/{} scripts loaded", loaded, total);
        Ok(loaded)
    }

    /// Stop the triggers and drop every cached script.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.triggers.scheduler().stop();
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
        self.service.registry().clear();
        info!("Script engine stopped");
    }

    fn spawn_retention(&self) -> JoinHandle<()> {
        let sink = Arc::clone(self.service.sink());
        let days = self.config.log_retention_days;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(RETENTION_INTERVAL);
            loop {
                interval.tick().await;
                match sink.prune(days).await {
                    Ok(0) => {}
                    Ok(removed) => info!("Pruned {} execution logs older than {} days", removed, days),
                    Err(e) => warn!("Failed to prune execution logs: {}", e),
                }
            }
        })
    }

    pub fn list_scripts(&self) -> Vec<Arc<Script>> {
        self.service.registry().list()
    }

    pub fn get_script(&self, id: &str) -> Result<Arc<Script>> {
        self.service
            .registry()
            .get(id)
            .ok_or_else(|| WardenError::NotFound(format!("script '{id}'")))
    }

    pub async fn execute(&self, id: &str, input: Value) -> Result<ExecutionResult> {
        self.service.execute(id, input).await
    }

    /// Execute with `__test_mode__` set in the input.
    pub async fn test(&self, id: &str, input: Value) -> Result<ExecutionResult> {
        let input = match input {
            Value::Object(mut map) => {
                map.insert("__test_mode__".to_string(), Value::Bool(true));
                Value::Object(map)
            }
            Value::Null => json!({ "__test_mode__": true }),
            _ => {
                return Err(WardenError::Validation(
                    "test input must be a JSON object".to_string(),
                ))
            }
        };
        self.service.execute(id, input).await
    }

    /// Persist the enabled flag and reload the script.
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<Option<Arc<Script>>> {
        if !self.service.store().set_enabled(id, enabled).await? {
            return Err(WardenError::NotFound(format!("script '{id}'")));
        }
        self.reload(id).await
    }

    /// Replace a script with the store's copy.
    ///
    /// Returns `None` when the store no longer has it; the script is then
    /// unloaded.
    pub async fn reload(&self, id: &str) -> Result<Option<Arc<Script>>> {
        match self.service.store().find_by_id(id).await? {
            Some(record) => self.service.load(record).await.map(Some),
            None => {
                match self.service.registry().unload(id) {
                    Ok(_) | Err(WardenError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
                Ok(None)
            }
        }
    }

    pub async fn load(&self, record: ScriptRecord) -> Result<Arc<Script>> {
        self.service.load(record).await
    }

    pub fn unload(&self, id: &str) -> Result<Arc<Script>> {
        self.service.registry().unload(id)
    }

    /// Most recent executions of a script, newest first.
    pub async fn logs(&self, id: &str, limit: usize) -> Result<Vec<ScriptLog>> {
        self.service.sink().recent(id, limit).await
    }

    pub async fn metrics(&self, id: &str) -> Result<ScriptMetrics> {
        self.service.sink().metrics(id).await
    }

    pub async fn prune_logs(&self, days: i32) -> Result<u64> {
        self.service.sink().prune(days).await
    }

    pub fn health(&self) -> HealthSnapshot {
        let scripts = self.service.registry().list();
        let mut categories = BTreeMap::new();
        for script in &scripts {
            *categories.entry(script.category.to_string()).or_insert(0) += 1;
        }

        HealthSnapshot {
            status: if self.is_running() { "healthy" } else { "stopped" }.to_string(),
            total_scripts: scripts.len(),
            enabled_scripts: scripts.iter().filter(|s| s.enabled).count(),
            categories,
            pool: self.service.pool().stats(),
            scheduled_jobs: self.triggers.scheduler().jobs().len(),
            checked_at: Utc::now(),
        }
    }

    /// Run the hook scripts for an event in the background.
    pub fn dispatch_hook(&self, event: &str, payload: Value) -> Vec<JoinHandle<()>> {
        self.hooks.dispatch(event, payload)
    }

    /// Sender for host events. Events are dispatched while the engine runs.
    pub fn event_bus(&self) -> broadcast::Sender<HookEvent> {
        self.events.clone()
    }

    /// Routes of enabled router scripts.
    pub fn routes(&self) -> Vec<Route> {
        self.service
            .registry()
            .list()
            .into_iter()
            .filter(|s| s.enabled && s.category == Category::Router)
            .filter_map(|s| {
                s.route().map(|(method, path)| Route {
                    method,
                    path,
                    script_id: s.id.clone(),
                })
            })
            .collect()
    }

    /// Run a router script for a request.
    ///
    /// Script failures become 500 responses and timeouts 504.
    pub async fn execute_route(&self, id: &str, request: RouteRequest) -> Result<RouteResponse> {
        let script = self.service.resolve(id).await?;
        if script.category != Category::Router {
            return Err(WardenError::Validation(format!(
                "script '{id}' is not a router script"
            )));
        }

        let input = json!({
            "request": {
                "method": request.method,
                "url": request.url,
                "headers": request.headers,
                "body": request.body,
            },
            "response": { "status": 200, "body": "" },
        });
        let result = self.service.run(id, input, Trigger::Route).await?;
        Ok(RouteResponse::from_result(&result))
    }
}

impl Drop for ScriptEngine {
    fn drop(&mut self) {
        for task in self
            .tasks
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
        self.triggers.scheduler().stop();
    }
}
