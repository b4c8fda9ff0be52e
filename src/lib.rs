//! Warden - sandboxed script execution engine
//!
//! Loads short untrusted Lua scripts, runs them under static and runtime
//! sandbox policy with time and call-depth ceilings, and reports structured
//! results.

pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod script;

pub use config::Config;
pub use db::{Database, DbPool};
pub use error::{Result, WardenError};
pub use script::{
    Category, ExecutionResult, ExecutionStatus, HookEvent, Sandbox, SandboxProfile, Script,
    ScriptEngine, ScriptRecord, Trigger,
};
