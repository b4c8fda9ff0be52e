//! Script API: the globals every interpreter carries and the per-category
//! binding groups installed into a run's environment.
//!
//! Always present: `console` (and `print`), `json`, `util` and an
//! allow-listed `require`. Per category: `fs`, `path`, `sys`, `crypto`,
//! `db`, `validate` (and `http`, see [`super::net`]).

use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use base64::Engine;
use chrono::Utc;
use mlua::{
    DeserializeOptions, Lua, LuaSerdeExt, MultiValue, Result as LuaResult, Table, Value,
};
use rand::distr::Alphanumeric;
use rand::Rng;
use regex::Regex;
use sha2::{Digest, Sha256};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use super::interpreter::{serialize_options, RunContext};
use super::record_repository::RecordRepository;
use super::sandbox::SandboxProfile;
use crate::WardenError;

/// Tracing target for script console output.
pub const SCRIPT_LOG_TARGET: &str = "warden::script";

/// Maximum file size `fs.read` returns.
const MAX_READ_BYTES: u64 = 5 * 1024 * 1024;

/// Longest single `util.sleep`, in milliseconds.
const MAX_SLEEP_MS: u64 = 60_000;

/// Granularity at which `util.sleep` notices cancellation.
const SLEEP_SLICE: Duration = Duration::from_millis(10);

/// Page size of `db.list` when none is given.
const DEFAULT_LIST_LIMIT: i64 = 100;

static EMAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("valid regex"));

/// Install `console` and route `print` through it.
pub(crate) fn install_console(lua: &Lua) -> LuaResult<()> {
    let console = lua.create_table()?;

    for level in ["log", "info", "debug", "warn", "error"] {
        let log_fn = lua.create_function(move |lua, args: MultiValue| {
            script_log(lua, level, &args);
            Ok(())
        })?;
        console.set(level, log_fn)?;
    }

    let print_fn: Value = console.get("log")?;
    lua.globals().set("print", print_fn)?;
    lua.globals().set("console", console)?;

    Ok(())
}

fn script_log(lua: &Lua, level: &str, args: &MultiValue) {
    let message = args
        .iter()
        .map(value_to_string)
        .collect::<Vec<_>>()
        .join(" ");
    let script_id = lua
        .app_data_ref::<RunContext>()
        .map(|ctx| ctx.script_id.clone())
        .unwrap_or_default();

    match level {
        "error" => error!(target: SCRIPT_LOG_TARGET, script_id = %script_id, "{}", message),
        "warn" => warn!(target: SCRIPT_LOG_TARGET, script_id = %script_id, "{}", message),
        "debug" => debug!(target: SCRIPT_LOG_TARGET, script_id = %script_id, "{}", message),
        _ => info!(target: SCRIPT_LOG_TARGET, script_id = %script_id, "{}", message),
    }
}

/// Install `json` and `util`.
pub(crate) fn install_base(lua: &Lua) -> LuaResult<()> {
    let globals = lua.globals();

    let json = lua.create_table()?;
    json.set(
        "encode",
        lua.create_function(|lua, value: Value| {
            let value: serde_json::Value = lua.from_value_with(
                value,
                DeserializeOptions::new().deny_unsupported_types(false),
            )?;
            serde_json::to_string(&value).map_err(mlua::Error::external)
        })?,
    )?;
    json.set(
        "decode",
        lua.create_function(|lua, text: String| {
            let value: serde_json::Value =
                serde_json::from_str(&text).map_err(mlua::Error::external)?;
            lua.to_value_with(&value, serialize_options())
        })?,
    )?;
    globals.set("json", json)?;

    let util = lua.create_table()?;
    util.set(
        "now",
        lua.create_function(|_, ()| Ok(Utc::now().to_rfc3339()))?,
    )?;
    util.set(
        "timestamp",
        lua.create_function(|_, ()| Ok(Utc::now().timestamp_millis()))?,
    )?;
    util.set(
        "uuid",
        lua.create_function(|_, ()| Ok(uuid::Uuid::new_v4().to_string()))?,
    )?;
    util.set(
        "hash",
        lua.create_function(|_, data: mlua::String| Ok(sha256_hex(&data.as_bytes())))?,
    )?;
    util.set(
        "random",
        lua.create_function(|_, (min, max): (i64, i64)| {
            if min > max {
                return Err(mlua::Error::RuntimeError(
                    "random: min must be less than or equal to max".to_string(),
                ));
            }
            let mut rng = rand::rng();
            Ok(rng.random_range(min..=max))
        })?,
    )?;
    util.set(
        "base64_encode",
        lua.create_function(|_, data: mlua::String| {
            Ok(base64::engine::general_purpose::STANDARD.encode(data.as_bytes()))
        })?,
    )?;
    util.set(
        "base64_decode",
        lua.create_function(|lua, text: String| {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(text.trim())
                .map_err(|e| mlua::Error::RuntimeError(format!("base64_decode: {e}")))?;
            lua.create_string(bytes)
        })?,
    )?;
    util.set("sleep", lua.create_function(|lua, ms: u64| sleep(lua, ms))?)?;
    globals.set("util", util)?;

    Ok(())
}

/// Sleep for `ms`, but never past the run's deadline or a cancel.
fn sleep(lua: &Lua, ms: u64) -> LuaResult<()> {
    let started = Instant::now();
    let mut until = started + Duration::from_millis(ms.min(MAX_SLEEP_MS));
    let cancel = match lua.app_data_ref::<RunContext>() {
        Some(ctx) => {
            until = until.min(ctx.deadline());
            Some(ctx.cancel_token())
        }
        None => None,
    };

    loop {
        let now = Instant::now();
        if now >= until || cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
            return Ok(());
        }
        std::thread::sleep(SLEEP_SLICE.min(until - now));
    }
}

/// Install `require`, which hands out copies of allow-listed modules.
pub(crate) fn install_require(lua: &Lua, profile: Arc<SandboxProfile>) -> LuaResult<()> {
    let require_fn = lua.create_function(move |lua, name: String| {
        if !profile.allows_module(&name) {
            return Err(mlua::Error::external(WardenError::security(
                "module",
                format!("module '{name}' is not allowed"),
            )));
        }
        match lua.globals().get::<Value>(name.as_str())? {
            Value::Table(module) => Ok(Value::Table(shallow_copy(lua, &module)?)),
            Value::Nil => Err(mlua::Error::RuntimeError(format!(
                "module '{name}' not found"
            ))),
            other => Ok(other),
        }
    })?;
    lua.globals().set("require", require_fn)
}

/// Copy a table's top-level entries into a new table.
pub(crate) fn shallow_copy(lua: &Lua, table: &Table) -> LuaResult<Table> {
    let copy = lua.create_table()?;
    for pair in table.pairs::<Value, Value>() {
        let (k, v) = pair?;
        copy.raw_set(k, v)?;
    }
    Ok(copy)
}

/// `fs` group, confined to `root`.
pub(crate) fn fs_table(lua: &Lua, root: PathBuf) -> LuaResult<Table> {
    let fs = lua.create_table()?;
    let root = Arc::new(root);

    let r = Arc::clone(&root);
    fs.set(
        "read",
        lua.create_function(move |lua, path: String| {
            let path = confine(&r, &path)?;
            let size = std::fs::metadata(&path)?.len();
            if size > MAX_READ_BYTES {
                return Err(mlua::Error::RuntimeError(format!(
                    "file too large: {size} bytes (max {MAX_READ_BYTES} bytes)"
                )));
            }
            lua.create_string(std::fs::read(&path)?)
        })?,
    )?;

    let r = Arc::clone(&root);
    fs.set(
        "write",
        lua.create_function(move |_, (path, content): (String, mlua::String)| {
            let path = confine(&r, &path)?;
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, &content.as_bytes()[..])?;
            Ok(())
        })?,
    )?;

    let r = Arc::clone(&root);
    fs.set(
        "exists",
        lua.create_function(move |_, path: String| Ok(confine(&r, &path)?.exists()))?,
    )?;

    let r = Arc::clone(&root);
    fs.set(
        "list",
        lua.create_function(move |_, path: Option<String>| {
            let dir = confine(&r, path.as_deref().unwrap_or("."))?;
            let mut names = Vec::new();
            for entry in std::fs::read_dir(&dir)? {
                names.push(entry?.file_name().to_string_lossy().into_owned());
            }
            names.sort();
            Ok(names)
        })?,
    )?;

    Ok(fs)
}

/// Resolve `relative` under `root`, refusing anything that escapes it.
fn confine(root: &Path, relative: &str) -> LuaResult<PathBuf> {
    let escapes = || {
        mlua::Error::external(WardenError::security(
            "filesystem",
            format!("path escapes filesystem root: {relative}"),
        ))
    };

    let rel = Path::new(relative);
    if rel
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(escapes());
    }

    let joined = root.join(rel);
    // Symlinks inside the root may still point outside it.
    if joined.exists() {
        let canonical_root = root.canonicalize()?;
        if !joined.canonicalize()?.starts_with(&canonical_root) {
            return Err(escapes());
        }
    }
    Ok(joined)
}

/// `path` group: pure path manipulation.
pub(crate) fn path_table(lua: &Lua) -> LuaResult<Table> {
    let path = lua.create_table()?;

    path.set(
        "join",
        lua.create_function(|_, parts: mlua::Variadic<String>| {
            let joined: PathBuf = parts.iter().collect();
            Ok(joined.to_string_lossy().into_owned())
        })?,
    )?;
    path.set(
        "base",
        lua.create_function(|_, p: String| {
            Ok(Path::new(&p)
                .file_name()
                .map(|s| s.to_string_lossy().into_owned()))
        })?,
    )?;
    path.set(
        "ext",
        lua.create_function(|_, p: String| {
            Ok(Path::new(&p)
                .extension()
                .map(|s| format!(".{}", s.to_string_lossy()))
                .unwrap_or_default())
        })?,
    )?;
    path.set(
        "dir",
        lua.create_function(|_, p: String| {
            Ok(Path::new(&p)
                .parent()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default())
        })?,
    )?;

    Ok(path)
}

/// `sys` group: environment and process execution.
pub(crate) fn sys_table(lua: &Lua) -> LuaResult<Table> {
    let sys = lua.create_table()?;

    sys.set(
        "env",
        lua.create_function(|_, name: String| Ok(std::env::var(name).ok()))?,
    )?;
    sys.set(
        "exec",
        lua.create_function(|lua, (program, args): (String, Option<Vec<String>>)| {
            let output = Command::new(&program)
                .args(args.unwrap_or_default())
                .output()?;
            let result = lua.create_table()?;
            result.set("status", output.status.code())?;
            result.set("stdout", lua.create_string(&output.stdout)?)?;
            result.set("stderr", lua.create_string(&output.stderr)?)?;
            Ok(result)
        })?,
    )?;

    Ok(sys)
}

/// `crypto` group.
pub(crate) fn crypto_table(lua: &Lua) -> LuaResult<Table> {
    let crypto = lua.create_table()?;

    crypto.set(
        "sha256",
        lua.create_function(|_, data: mlua::String| Ok(sha256_hex(&data.as_bytes())))?,
    )?;
    crypto.set(
        "random_string",
        lua.create_function(|_, len: usize| {
            if len > 4096 {
                return Err(mlua::Error::RuntimeError(
                    "random_string: length must be at most 4096".to_string(),
                ));
            }
            Ok(rand::rng()
                .sample_iter(&Alphanumeric)
                .take(len)
                .map(char::from)
                .collect::<String>())
        })?,
    )?;
    crypto.set(
        "uuid",
        lua.create_function(|_, ()| Ok(uuid::Uuid::new_v4().to_string()))?,
    )?;

    Ok(crypto)
}

/// Drive a repository call to completion from the blocking worker a script
/// runs on.
fn block_on<T>(future: impl Future<Output = crate::Result<T>>) -> LuaResult<T> {
    let handle = Handle::try_current()
        .map_err(|_| mlua::Error::RuntimeError("db requires a tokio runtime".to_string()))?;
    handle.block_on(future).map_err(mlua::Error::external)
}

fn from_lua_json(lua: &Lua, value: Value) -> LuaResult<serde_json::Value> {
    lua.from_value_with(value, DeserializeOptions::new().deny_unsupported_types(false))
}

/// `db` group: collection records.
pub(crate) fn db_table(lua: &Lua, records: RecordRepository) -> LuaResult<Table> {
    let db = lua.create_table()?;

    let repo = records.clone();
    db.set(
        "find",
        lua.create_function(move |lua, (collection, id): (String, String)| {
            match block_on(repo.find(&collection, &id))? {
                Some(record) => lua.to_value_with(&record, serialize_options()),
                None => Ok(Value::Nil),
            }
        })?,
    )?;

    let repo = records.clone();
    db.set(
        "list",
        lua.create_function(move |lua, (collection, limit): (String, Option<i64>)| {
            let found = block_on(repo.list(&collection, limit.unwrap_or(DEFAULT_LIST_LIMIT)))?;
            lua.to_value_with(&found, serialize_options())
        })?,
    )?;

    let repo = records.clone();
    db.set(
        "insert",
        lua.create_function(move |lua, (collection, data): (String, Value)| {
            let data = from_lua_json(lua, data)?;
            let record = block_on(repo.insert(&collection, data))?;
            lua.to_value_with(&record, serialize_options())
        })?,
    )?;

    let repo = records.clone();
    db.set(
        "update",
        lua.create_function(move |lua, (collection, id, data): (String, String, Value)| {
            let data = from_lua_json(lua, data)?;
            match block_on(repo.update(&collection, &id, data))? {
                Some(record) => lua.to_value_with(&record, serialize_options()),
                None => Ok(Value::Nil),
            }
        })?,
    )?;

    let repo = records.clone();
    db.set(
        "delete",
        lua.create_function(move |_, (collection, id): (String, String)| {
            block_on(repo.delete(&collection, &id))
        })?,
    )?;

    db.set(
        "count",
        lua.create_function(move |_, collection: String| block_on(records.count(&collection)))?,
    )?;

    Ok(db)
}

/// `validate` group: form field checks. Every function returns a boolean.
pub(crate) fn validate_table(lua: &Lua) -> LuaResult<Table> {
    let validate = lua.create_table()?;

    validate.set(
        "required",
        lua.create_function(|_, value: Value| {
            Ok(match value {
                Value::Nil => false,
                Value::String(s) => !s.as_bytes().is_empty(),
                _ => true,
            })
        })?,
    )?;
    validate.set(
        "is_email",
        lua.create_function(|_, text: String| Ok(EMAIL.is_match(&text)))?,
    )?;
    validate.set(
        "is_url",
        lua.create_function(|_, text: String| {
            Ok(url::Url::parse(&text)
                .is_ok_and(|u| matches!(u.scheme(), "http" | "https") && u.host().is_some()))
        })?,
    )?;
    validate.set(
        "is_uuid",
        lua.create_function(|_, text: String| Ok(uuid::Uuid::parse_str(&text).is_ok()))?,
    )?;
    validate.set(
        "is_numeric",
        lua.create_function(|_, value: Value| {
            Ok(match value {
                Value::Integer(_) => true,
                Value::Number(n) => n.is_finite(),
                Value::String(s) => s
                    .to_str()
                    .ok()
                    .and_then(|s| s.trim().parse::<f64>().ok())
                    .is_some_and(f64::is_finite),
                _ => false,
            })
        })?,
    )?;
    validate.set(
        "is_alpha",
        lua.create_function(|_, text: String| {
            Ok(!text.is_empty() && text.chars().all(char::is_alphabetic))
        })?,
    )?;
    validate.set(
        "min_length",
        lua.create_function(|_, (text, min): (String, usize)| Ok(text.chars().count() >= min))?,
    )?;
    validate.set(
        "max_length",
        lua.create_function(|_, (text, max): (String, usize)| Ok(text.chars().count() <= max))?,
    )?;

    Ok(validate)
}

fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Convert a Lua Value to a string for console output.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.to_string_lossy().to_string(),
        Value::Table(_) => "[table]".to_string(),
        Value::Function(_) => "[function]".to_string(),
        Value::Thread(_) => "[thread]".to_string(),
        Value::UserData(_) => "[userdata]".to_string(),
        Value::LightUserData(_) => "[lightuserdata]".to_string(),
        Value::Error(e) => format!("[error: {}]", e),
        _ => "[unknown]".to_string(),
    }
}
