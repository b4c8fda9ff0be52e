//! In-memory script registry.
//!
//! The registry is the authoritative view of which scripts can run. It never
//! persists; the engine rebuilds it from the store on start.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, TryLockError};
use std::time::Duration;

use tracing::{debug, info};

use super::interpreter::Interpreter;
use super::sandbox::Sandbox;
use super::scheduler::TriggerManager;
use super::types::{Category, Script, ScriptRecord};
use crate::{Result, WardenError};

/// How long a script may run during the load-time dry run.
pub const DRY_RUN_BUDGET: Duration = Duration::from_millis(100);

/// Validated scripts keyed by id.
pub struct ScriptRegistry {
    scripts: RwLock<HashMap<String, Arc<Script>>>,
    sandbox: Sandbox,
    /// Capability-less profile for syntax checks and dry runs.
    stub: Sandbox,
    /// Reused checker; concurrent loads build their own from `stub`.
    checker: Mutex<Interpreter>,
    triggers: Arc<TriggerManager>,
}

impl ScriptRegistry {
    pub fn new(sandbox: Sandbox, triggers: Arc<TriggerManager>) -> Result<Self> {
        let stub = Sandbox::new(Arc::new(sandbox.profile().without_capabilities()));
        let checker = Interpreter::hardened_or_minimal(&stub)?;

        Ok(Self {
            scripts: RwLock::new(HashMap::new()),
            sandbox,
            stub,
            checker: Mutex::new(checker),
            triggers,
        })
    }

    /// Validate a record and add or replace it.
    ///
    /// Nothing is replaced unless every check passes. May block for up to
    /// [`DRY_RUN_BUDGET`].
    pub fn load(&self, record: ScriptRecord) -> Result<Arc<Script>> {
        let script = Script::try_from(record)?;
        self.sandbox.validate(&script.content)?;

        match self.checker.try_lock() {
            Ok(checker) => Self::check(&checker, &script)?,
            Err(TryLockError::Poisoned(poisoned)) => Self::check(&poisoned.into_inner(), &script)?,
            Err(TryLockError::WouldBlock) => {
                debug!("Checker busy; building a one-off for '{}'", script.id);
                Self::check(&Interpreter::hardened_or_minimal(&self.stub)?, &script)?;
            }
        }

        // The schedule only changes under the map's write lock.
        let script = Arc::new(script);
        let mut scripts = self.scripts.write().unwrap_or_else(PoisonError::into_inner);
        if script.category == Category::Cron && script.enabled {
            self.triggers.register(&script)?;
        } else {
            self.triggers.deregister(&script.id);
        }
        let previous = scripts.insert(script.id.clone(), Arc::clone(&script));
        drop(scripts);

        if previous.is_some() {
            debug!("Replaced script '{}' ({})", script.id, script.name);
        } else {
            info!("Loaded script '{}' ({}, {})", script.id, script.name, script.category);
        }
        Ok(script)
    }

    fn check(checker: &Interpreter, script: &Script) -> Result<()> {
        checker.check_syntax(script)?;
        checker.dry_run(script, DRY_RUN_BUDGET)
    }

    /// Remove a script and its schedule.
    pub fn unload(&self, id: &str) -> Result<Arc<Script>> {
        let removed = {
            let mut scripts = self.scripts.write().unwrap_or_else(PoisonError::into_inner);
            self.triggers.deregister(id);
            scripts.remove(id)
        };

        match removed {
            Some(script) => {
                info!("Unloaded script '{}'", id);
                Ok(script)
            }
            None => Err(WardenError::NotFound(format!("script '{id}'"))),
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Script>> {
        self.scripts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// All scripts, highest priority first, then by name.
    pub fn list(&self) -> Vec<Arc<Script>> {
        let mut scripts: Vec<Arc<Script>> = self
            .scripts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        scripts.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
        scripts
    }

    pub fn len(&self) -> usize {
        self.scripts.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every script and schedule.
    pub fn clear(&self) {
        let mut scripts = self.scripts.write().unwrap_or_else(PoisonError::into_inner);
        for id in scripts.keys() {
            self.triggers.deregister(id);
        }
        scripts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::sandbox::SandboxProfile;
    use crate::script::scheduler::CronScheduler;

    fn registry() -> ScriptRegistry {
        let sandbox = Sandbox::new(Arc::new(SandboxProfile::default()));
        let triggers = Arc::new(TriggerManager::new(Arc::new(CronScheduler::new())));
        ScriptRegistry::new(sandbox, triggers).unwrap()
    }

    fn record(id: &str, category: &str, content: &str) -> ScriptRecord {
        ScriptRecord::new(id, format!("Script {id}"), category, content)
    }

    #[test]
    fn test_load_and_get() {
        let registry = registry();
        let script = registry.load(record("s1", "manual", "return 2 + 2")).unwrap();
        assert_eq!(script.category, Category::Manual);
        assert_eq!(registry.get("s1").unwrap().content, "return 2 + 2");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unknown_category_never_registers() {
        let registry = registry();
        let err = registry.load(record("s1", "plugin", "return 1")).unwrap_err();
        assert!(matches!(err, WardenError::Validation(_)));
        assert!(registry.get("s1").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_dangerous_pattern_rejected() {
        let registry = registry();
        let err = registry.load(record("s1", "manual", "return eval('1')")).unwrap_err();
        assert!(matches!(err, WardenError::SecurityViolation { .. }));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_syntax_error_rejected() {
        let registry = registry();
        let err = registry.load(record("s1", "manual", "return (")).unwrap_err();
        assert!(matches!(err, WardenError::Validation(_)));
    }

    #[test]
    fn test_blocked_require_found_by_dry_run() {
        let registry = registry();
        let err = registry
            .load(record("s1", "manual", "local x = require 'socket' return x"))
            .unwrap_err();
        assert!(matches!(err, WardenError::SecurityViolation { .. }));
    }

    #[test]
    fn test_dry_run_ignores_runtime_errors_and_loops() {
        let registry = registry();
        registry
            .load(record("s1", "hook", "return input.eventData.id"))
            .unwrap();
        registry
            .load(record("s2", "manual", "while true do end"))
            .unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_failed_reload_keeps_previous() {
        let registry = registry();
        registry.load(record("s1", "manual", "return 1")).unwrap();
        assert!(registry.load(record("s1", "manual", "return (")).is_err());
        assert_eq!(registry.get("s1").unwrap().content, "return 1");
    }

    #[test]
    fn test_unload_twice() {
        let registry = registry();
        registry.load(record("s1", "manual", "return 1")).unwrap();
        assert_eq!(registry.unload("s1").unwrap().id, "s1");
        assert!(matches!(
            registry.unload("s1"),
            Err(WardenError::NotFound(_))
        ));
    }

    #[test]
    fn test_cron_schedule_follows_registry() {
        let registry = registry();
        let err = registry.load(record("c1", "cron", "return 1")).unwrap_err();
        assert!(matches!(err, WardenError::Validation(_)));

        let bad = record("c1", "cron", "return 1").with_meta("cron_expression", "every day");
        assert!(matches!(registry.load(bad), Err(WardenError::Validation(_))));
        assert!(registry.is_empty());

        let good = record("c1", "cron", "return 1").with_meta("cron_expression", "*/5 * * * *");
        registry.load(good).unwrap();
        assert_eq!(registry.triggers.scheduler().jobs().len(), 1);

        registry.unload("c1").unwrap();
        assert!(registry.triggers.scheduler().jobs().is_empty());
    }

    #[test]
    fn test_coroutine_loop_does_not_stall_loading() {
        use std::time::Instant;

        let registry = registry();
        let started = Instant::now();
        registry
            .load(record(
                "spin",
                "manual",
                "local f = coroutine.wrap(function() while true do end end) f() return 1",
            ))
            .unwrap();
        registry.load(record("next", "manual", "return 1")).unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_concurrent_loads_use_separate_checkers() {
        let registry = Arc::new(registry());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    registry
                        .load(record(&format!("s{i}"), "manual", "while true do end"))
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn test_concurrent_cron_reloads_stay_consistent() {
        let registry = Arc::new(registry());
        let handles: Vec<_> = ["*/5 * * * *", "@daily"]
            .into_iter()
            .map(|expression| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for _ in 0..20 {
                        registry
                            .load(
                                record("c1", "cron", "return 1")
                                    .with_meta("cron_expression", expression),
                            )
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let script = registry.get("c1").unwrap();
        let jobs = registry.triggers.scheduler().jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(Some(jobs[0].expression.as_str()), script.cron_expression());
    }

    #[test]
    fn test_list_order_and_clear() {
        let registry = registry();
        registry.load(record("a", "manual", "return 1")).unwrap();
        registry
            .load(record("b", "manual", "return 1").with_priority(10))
            .unwrap();

        let ids: Vec<String> = registry.list().iter().map(|s| s.id.clone()).collect();
        assert_eq!(ids, vec!["b", "a"]);

        registry.clear();
        assert!(registry.is_empty());
    }
}
