//! Sandbox policy: static validation of script content and runtime
//! hardening of a freshly created Lua state.

use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use mlua::{Lua, StdLib, Table, Value};
use regex::Regex;

use super::api;
use super::interpreter::lua_cause;
use crate::config::{default_blocked_globals, SandboxConfig};
use crate::{Result, WardenError};

/// Resource limits and capabilities applied to every interpreter.
///
/// Shared as `Arc<SandboxProfile>` once bound to a pool; changing policy
/// means building a new pool.
#[derive(Debug, Clone)]
pub struct SandboxProfile {
    pub max_execution_time: Duration,
    pub max_call_depth: usize,
    /// Maximum memory per interpreter in bytes (0 = unlimited).
    pub max_memory_bytes: usize,
    pub max_script_bytes: usize,
    pub max_brace_count: usize,
    pub allowed_modules: Vec<String>,
    pub blocked_globals: Vec<String>,
    pub allow_network: bool,
    pub allow_filesystem: bool,
    pub allow_process: bool,
    /// Directory the `fs` binding group is confined to.
    pub fs_root: Option<PathBuf>,
}

impl Default for SandboxProfile {
    fn default() -> Self {
        Self::from(&SandboxConfig::default())
    }
}

impl From<&SandboxConfig> for SandboxProfile {
    fn from(config: &SandboxConfig) -> Self {
        Self {
            max_execution_time: Duration::from_secs(config.max_execution_secs),
            max_call_depth: config.max_call_depth,
            max_memory_bytes: config.max_memory_mb * 1024 * 1024,
            max_script_bytes: config.max_script_bytes,
            max_brace_count: config.max_brace_count,
            allowed_modules: config.allowed_modules.clone(),
            blocked_globals: config.blocked_globals.clone(),
            allow_network: config.allow_network,
            allow_filesystem: config.allow_filesystem,
            allow_process: config.allow_process,
            fs_root: config.fs_root.as_ref().map(PathBuf::from),
        }
    }
}

impl SandboxProfile {
    /// Profile for the load-time syntax check: same limits, no I/O.
    pub(crate) fn without_capabilities(&self) -> Self {
        Self {
            allow_network: false,
            allow_filesystem: false,
            allow_process: false,
            fs_root: None,
            ..self.clone()
        }
    }

    /// Whether `require(name)` is permitted.
    pub fn allows_module(&self, name: &str) -> bool {
        self.allowed_modules.iter().any(|m| m == name)
    }
}

/// Source patterns rejected before a script is accepted.
///
/// Textual matching is incomplete by nature; the hardened namespace is the
/// second line.
static DANGEROUS_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        ("eval(", r"\beval\s*\("),
        ("load(", r"\bload\s*\("),
        ("loadstring(", r"\bloadstring\s*\("),
        ("Function(", r"\bFunction\s*\("),
        ("setTimeout(", r"\bsetTimeout\s*\("),
        ("setInterval(", r"\bsetInterval\s*\("),
        ("require(", r"\brequire\s*\("),
        ("import(", r"\bimport\s*\("),
        ("dofile(", r"\bdofile\s*\("),
        ("loadfile(", r"\bloadfile\s*\("),
        ("process.", r"\bprocess\s*\."),
        ("global.", r"\bglobal\s*\."),
        ("globalThis", r"\bglobalThis\b"),
        ("_G", r"\b_G\b"),
        ("__proto__", r"__proto__"),
        ("constructor.", r"\bconstructor\s*\."),
        ("prototype.", r"\bprototype\s*\."),
        ("getmetatable(", r"\bgetmetatable\s*\("),
        ("setmetatable(", r"\bsetmetatable\s*\("),
        ("rawset(", r"\brawset\s*\("),
        ("rawget(", r"\brawget\s*\("),
        ("debug.", r"\bdebug\s*\."),
        ("string.dump", r"\bstring\s*\.\s*dump\b"),
        ("collectgarbage", r"\bcollectgarbage\b"),
    ]
    .into_iter()
    .map(|(name, pattern)| (name, Regex::new(pattern).expect("valid regex")))
    .collect()
});

/// `os` functions that are always available.
const OS_BASE: &[&str] = &["time", "clock", "date", "difftime"];
/// `os` functions gated by the filesystem capability.
const OS_FILESYSTEM: &[&str] = &["remove", "rename", "tmpname"];
/// `os` functions gated by the process capability.
const OS_PROCESS: &[&str] = &["execute", "exit", "getenv"];

/// Enforces a [`SandboxProfile`].
#[derive(Debug, Clone)]
pub struct Sandbox {
    profile: Arc<SandboxProfile>,
}

impl Sandbox {
    pub fn new(profile: Arc<SandboxProfile>) -> Self {
        Self { profile }
    }

    pub fn profile(&self) -> &Arc<SandboxProfile> {
        &self.profile
    }

    /// Reject content that is oversized, too deeply braced, or matches a
    /// dangerous pattern.
    pub fn validate(&self, content: &str) -> Result<()> {
        if content.len() > self.profile.max_script_bytes {
            return Err(WardenError::security(
                "size",
                format!(
                    "script too large: {} bytes (max {})",
                    content.len(),
                    self.profile.max_script_bytes
                ),
            ));
        }

        let braces = content.matches('{').count();
        if braces > self.profile.max_brace_count {
            return Err(WardenError::security(
                "complexity",
                format!(
                    "script too complex: {} braces (max {})",
                    braces, self.profile.max_brace_count
                ),
            ));
        }

        for (name, pattern) in DANGEROUS_PATTERNS.iter() {
            if pattern.is_match(content) {
                return Err(WardenError::security(
                    "pattern",
                    format!("dangerous pattern detected: {name}"),
                ));
            }
        }

        Ok(())
    }

    /// Standard libraries to open for this profile.
    ///
    /// `coroutine` is never opened: the instruction hook only watches the
    /// main thread, so a loop inside a coroutine could outrun the deadline.
    pub(crate) fn std_libs(&self) -> StdLib {
        let mut libs = StdLib::STRING | StdLib::TABLE | StdLib::MATH | StdLib::UTF8 | StdLib::OS;
        if self.profile.allow_filesystem {
            libs |= StdLib::IO;
        }
        libs
    }

    /// Harden a freshly created interpreter.
    ///
    /// Removes blocked globals, narrows `os` to the enabled capabilities,
    /// routes `console`/`print` into tracing, installs the allow-listed
    /// `require` and the base bindings, and applies the memory ceiling.
    pub fn harden(&self, lua: &Lua) -> Result<()> {
        let harden_err = |e: mlua::Error| WardenError::Resource(format!("failed to harden: {e}"));
        let globals = lua.globals();

        self.restrict_os(lua, &globals).map_err(harden_err)?;
        if !self.profile.allow_filesystem {
            globals.set("io", Value::Nil).map_err(harden_err)?;
        }

        for name in &self.profile.blocked_globals {
            globals.set(name.as_str(), Value::Nil).map_err(harden_err)?;
        }
        // Always removed, whatever the configured list says.
        for name in ["load", "loadstring", "dofile", "loadfile", "debug", "package"] {
            globals.set(name, Value::Nil).map_err(harden_err)?;
        }

        api::install_console(lua).map_err(harden_err)?;
        api::install_base(lua).map_err(harden_err)?;
        api::install_require(lua, Arc::clone(&self.profile)).map_err(harden_err)?;

        self.apply_memory_limit(lua)?;

        Ok(())
    }

    /// Reduced hardening for the fallback interpreter: string, table and
    /// math only, with the routed console.
    pub(crate) fn harden_minimal(&self, lua: &Lua) -> Result<()> {
        let harden_err = |e: mlua::Error| WardenError::Resource(format!("failed to harden: {e}"));
        let globals = lua.globals();

        for name in default_blocked_globals()
            .iter()
            .chain(self.profile.blocked_globals.iter())
        {
            globals.set(name.as_str(), Value::Nil).map_err(harden_err)?;
        }
        globals.set("require", Value::Nil).map_err(harden_err)?;
        api::install_console(lua).map_err(harden_err)?;

        self.apply_memory_limit(lua)
    }

    fn restrict_os(&self, lua: &Lua, globals: &Table) -> mlua::Result<()> {
        let full: Option<Table> = globals.get("os")?;
        let Some(full) = full else {
            return Ok(());
        };

        let os = lua.create_table()?;
        let mut names: Vec<&str> = OS_BASE.to_vec();
        if self.profile.allow_filesystem {
            names.extend_from_slice(OS_FILESYSTEM);
        }
        if self.profile.allow_process {
            names.extend_from_slice(OS_PROCESS);
        }
        for name in names {
            let f: Value = full.get(name)?;
            os.set(name, f)?;
        }
        globals.set("os", os)
    }

    fn apply_memory_limit(&self, lua: &Lua) -> Result<()> {
        if self.profile.max_memory_bytes > 0 {
            lua.set_memory_limit(self.profile.max_memory_bytes)
                .map_err(|e| WardenError::Resource(format!("failed to set memory limit: {e}")))?;
        }
        Ok(())
    }
}

/// Find a [`WardenError::SecurityViolation`] anywhere in an mlua error chain.
pub(crate) fn security_violation(err: &mlua::Error) -> Option<WardenError> {
    match lua_cause(err) {
        Some(WardenError::SecurityViolation { kind, description }) => {
            Some(WardenError::security(kind.clone(), description.clone()))
        }
        _ => None,
    }
}
