//! One hardened Lua state.
//!
//! Every run gets a fresh environment table populated with copies of the
//! hardened globals, so nothing a script writes survives into the next run
//! on the same interpreter. An instruction hook checks the run's cancel
//! token and deadline and enforces the call-depth ceiling. A run the hook
//! interrupted reports a timeout even if the script caught the error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mlua::{
    DebugEvent, DeserializeOptions, HookTriggers, Lua, LuaOptions, LuaSerdeExt, SerializeOptions,
    StdLib, Table, Value, VmState,
};
use tracing::warn;

use super::api;
use super::net;
use super::record_repository::RecordRepository;
use super::sandbox::Sandbox;
use super::types::{Category, Outcome, Script};
use crate::{Result, WardenError};

/// VM instructions between interrupt checks.
pub const HOOK_INTERVAL: u32 = 1000;

/// Cooperative cancellation flag shared between a caller and a running script.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-run state stored as Lua app data while a script executes.
#[derive(Debug)]
pub(crate) struct RunContext {
    pub script_id: String,
    cancel: CancelToken,
    deadline: Instant,
    ceiling: Duration,
    interrupted: AtomicBool,
}

impl RunContext {
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn expired(&self) -> bool {
        self.cancel.is_cancelled() || Instant::now() >= self.deadline
    }
}

/// A sandboxed Lua interpreter.
pub struct Interpreter {
    lua: Lua,
    sandbox: Sandbox,
    http: Option<reqwest::Client>,
    records: Option<RecordRepository>,
    minimal: bool,
}

impl Interpreter {
    /// Create a fully hardened interpreter.
    pub fn new(sandbox: &Sandbox) -> Result<Self> {
        let lua = Lua::new_with(sandbox.std_libs(), LuaOptions::new())
            .map_err(|e| WardenError::Resource(format!("failed to create interpreter: {e}")))?;
        sandbox.harden(&lua)?;
        install_hook(&lua, sandbox.profile().max_call_depth);

        let http = if sandbox.profile().allow_network {
            Some(net::build_client()?)
        } else {
            None
        };

        Ok(Self {
            lua,
            sandbox: sandbox.clone(),
            http,
            records: None,
            minimal: false,
        })
    }

    /// Create the fallback interpreter: string, table and math only, no
    /// bindings except the routed console.
    pub fn minimal(sandbox: &Sandbox) -> Result<Self> {
        let lua = Lua::new_with(
            StdLib::STRING | StdLib::TABLE | StdLib::MATH,
            LuaOptions::new(),
        )
        .map_err(|e| WardenError::Resource(format!("failed to create interpreter: {e}")))?;
        sandbox.harden_minimal(&lua)?;
        install_hook(&lua, sandbox.profile().max_call_depth);

        Ok(Self {
            lua,
            sandbox: sandbox.clone(),
            http: None,
            records: None,
            minimal: true,
        })
    }

    /// Hardened interpreter, falling back to [`Interpreter::minimal`] when
    /// hardening fails.
    pub fn hardened_or_minimal(sandbox: &Sandbox) -> Result<Self> {
        match Self::new(sandbox) {
            Ok(interpreter) => Ok(interpreter),
            Err(e) => {
                warn!("Falling back to minimal interpreter: {}", e);
                Self::minimal(sandbox)
            }
        }
    }

    /// Back the `db` group of `dbx` scripts with `records`.
    pub fn with_records(mut self, records: RecordRepository) -> Self {
        self.records = Some(records);
        self
    }

    pub fn is_minimal(&self) -> bool {
        self.minimal
    }

    /// Compile without running.
    pub fn check_syntax(&self, script: &Script) -> Result<()> {
        self.lua
            .load(&script.content)
            .set_name(chunk_name(script))
            .into_function()
            .map(|_| ())
            .map_err(|e| {
                WardenError::Validation(format!("syntax error in script '{}': {}", script.id, e))
            })
    }

    /// Run a script to completion, cancellation or deadline.
    pub(crate) fn run(
        &self,
        script: &Script,
        input: &serde_json::Value,
        cancel: &CancelToken,
        ceiling: Duration,
    ) -> Outcome {
        let (result, interrupted) = self.run_raw(script, input, cancel, ceiling);
        if interrupted {
            return Outcome::Timeout;
        }
        match result {
            Ok(value) => Outcome::Success(value),
            Err(e) => match lua_cause(&e) {
                Some(WardenError::Timeout(_)) => Outcome::Timeout,
                _ => {
                    let (message, stack_trace) = split_traceback(&e.to_string());
                    Outcome::Error {
                        message,
                        stack_trace,
                    }
                }
            },
        }
    }

    /// Run a script briefly and report only security violations.
    ///
    /// Other runtime errors and running out of time are not failures here.
    pub fn dry_run(&self, script: &Script, budget: Duration) -> Result<()> {
        let cancel = CancelToken::new();
        let (result, _) = self.run_raw(script, &serde_json::Value::Null, &cancel, budget);
        match result {
            Ok(_) => Ok(()),
            Err(e) => match super::sandbox::security_violation(&e) {
                Some(violation) => Err(violation),
                None => Ok(()),
            },
        }
    }

    /// Evaluate under a fresh [`RunContext`].
    ///
    /// The flag is true when the run was interrupted or ran past its
    /// deadline, whatever the script itself returned.
    fn run_raw(
        &self,
        script: &Script,
        input: &serde_json::Value,
        cancel: &CancelToken,
        ceiling: Duration,
    ) -> (mlua::Result<serde_json::Value>, bool) {
        self.lua.set_app_data(RunContext {
            script_id: script.id.clone(),
            cancel: cancel.clone(),
            deadline: Instant::now() + ceiling,
            ceiling,
            interrupted: AtomicBool::new(false),
        });

        let result = self.evaluate(script, input);

        let interrupted = self
            .lua
            .remove_app_data::<RunContext>()
            .is_some_and(|ctx| ctx.interrupted.load(Ordering::SeqCst) || ctx.expired());
        if let Err(e) = self.lua.gc_collect() {
            warn!("Garbage collection after script '{}' failed: {}", script.id, e);
        }

        (result, interrupted)
    }

    fn evaluate(&self, script: &Script, input: &serde_json::Value) -> mlua::Result<serde_json::Value> {
        let env = self.environment()?;
        if !self.minimal {
            self.install_bindings(&env, script.category)?;
        }
        env.set("input", self.lua.to_value_with(input, serialize_options())?)?;

        let value: Value = self
            .lua
            .load(&script.content)
            .set_name(chunk_name(script))
            .set_environment(env)
            .eval()?;

        self.lua.from_value_with(
            value,
            DeserializeOptions::new().deny_unsupported_types(false),
        )
    }

    /// Fresh environment: globals with their tables shallow-copied.
    fn environment(&self) -> mlua::Result<Table> {
        let env = self.lua.create_table()?;
        let globals = self.lua.globals();
        for pair in globals.pairs::<Value, Value>() {
            let (key, value) = pair?;
            let value = match value {
                Value::Table(table) => Value::Table(api::shallow_copy(&self.lua, &table)?),
                other => other,
            };
            env.raw_set(key, value)?;
        }
        Ok(env)
    }

    fn install_bindings(&self, env: &Table, category: Category) -> mlua::Result<()> {
        let profile = self.sandbox.profile();
        match category {
            Category::Http | Category::Apis => {
                if let Some(client) = &self.http {
                    env.set("http", net::http_table(&self.lua, client.clone())?)?;
                }
            }
            Category::Dbx => {
                if let Some(records) = &self.records {
                    env.set("db", api::db_table(&self.lua, records.clone())?)?;
                }
            }
            Category::Forms => env.set("validate", api::validate_table(&self.lua)?)?,
            Category::Filesystem => {
                if profile.allow_filesystem {
                    if let Some(root) = &profile.fs_root {
                        env.set("fs", api::fs_table(&self.lua, root.clone())?)?;
                    }
                }
            }
            Category::Filepath => env.set("path", api::path_table(&self.lua)?)?,
            Category::Os => {
                if profile.allow_process {
                    env.set("sys", api::sys_table(&self.lua)?)?;
                }
            }
            Category::Security => env.set("crypto", api::crypto_table(&self.lua)?)?,
            _ => {}
        }
        Ok(())
    }
}

fn install_hook(lua: &Lua, max_call_depth: usize) {
    lua.set_hook(
        HookTriggers::new()
            .on_calls()
            .every_nth_instruction(HOOK_INTERVAL),
        move |lua, debug| {
            if let Some(ctx) = lua.app_data_ref::<RunContext>() {
                if ctx.expired() {
                    ctx.interrupted.store(true, Ordering::SeqCst);
                    return Err(mlua::Error::external(WardenError::Timeout(ctx.ceiling)));
                }
            }
            if max_call_depth > 0
                && matches!(debug.event(), DebugEvent::Call)
                && lua.inspect_stack(max_call_depth).is_some()
            {
                return Err(mlua::Error::RuntimeError(format!(
                    "call depth limit exceeded (max {max_call_depth})"
                )));
            }
            Ok(VmState::Continue)
        },
    );
}

fn chunk_name(script: &Script) -> String {
    format!("={}", script.id)
}

pub(crate) fn serialize_options() -> SerializeOptions {
    SerializeOptions::new()
        .serialize_none_to_null(false)
        .serialize_unit_to_null(false)
}

/// Find the [`WardenError`] that caused an mlua error, if any.
pub(crate) fn lua_cause(err: &mlua::Error) -> Option<&WardenError> {
    match err {
        mlua::Error::CallbackError { cause, .. } => lua_cause(cause),
        mlua::Error::WithContext { cause, .. } => lua_cause(cause),
        mlua::Error::ExternalError(inner) => inner.downcast_ref::<WardenError>(),
        _ => None,
    }
}

/// Split an error message from the traceback mlua appends to it.
fn split_traceback(message: &str) -> (String, Option<String>) {
    match message.split_once("\nstack traceback:") {
        Some((head, trace)) => (
            head.trim_end().to_string(),
            Some(format!("stack traceback:{trace}")),
        ),
        None => (message.to_string(), None),
    }
}
