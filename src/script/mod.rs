//! Sandboxed script execution.
//!
//! Scripts are Lua chunks run inside hardened interpreters borrowed from a
//! bounded pool. They are triggered manually, by host lifecycle hooks, on a
//! cron schedule, or as route handlers; every run is recorded in the
//! execution log.

pub mod api;
pub mod engine;
pub mod hooks;
pub mod interpreter;
pub mod log_repository;
pub mod net;
pub mod pool;
pub mod record_repository;
pub mod registry;
pub mod repository;
pub mod sandbox;
pub mod scheduler;
pub mod service;
pub mod types;

pub use engine::{HealthSnapshot, Route, RouteRequest, RouteResponse, ScriptEngine};
pub use hooks::{HookDispatcher, HookEvent};
pub use interpreter::{CancelToken, Interpreter};
pub use log_repository::{ExecutionLogSink, ScriptLog, ScriptLogRepository, ScriptMetrics};
pub use pool::{InterpreterFactory, InterpreterPool, PoolStats};
pub use record_repository::RecordRepository;
pub use registry::ScriptRegistry;
pub use repository::{ScriptRepository, ScriptStore};
pub use sandbox::{Sandbox, SandboxProfile};
pub use scheduler::{CronScheduler, JobAction, ScheduledJob, Scheduler, TriggerManager};
pub use service::ScriptService;
pub use types::{Category, ExecutionResult, ExecutionStatus, Script, ScriptRecord, Trigger};
