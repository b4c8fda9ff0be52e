//! Scheduled triggers.
//!
//! [`CronScheduler`] runs each job as a tokio task that sleeps until the
//! next occurrence of its schedule. [`TriggerManager`] maps `cron` scripts
//! onto scheduler jobs.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::service::ScriptService;
use super::types::{Script, Trigger};
use crate::{Result, WardenError};

/// What a job does when it fires.
pub type JobAction = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// A registered job.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduledJob {
    pub id: String,
    pub expression: String,
    pub next_run: Option<DateTime<Utc>>,
}

/// Time-based job runner.
pub trait Scheduler: Send + Sync {
    /// Add or replace a job. Fails with a validation error for a bad
    /// expression.
    fn add(&self, job_id: &str, expression: &str, action: JobAction) -> Result<()>;

    /// Remove a job. Returns false if it was not registered.
    fn remove(&self, job_id: &str) -> bool;

    /// Arm every registered job.
    fn start(&self);

    /// Disarm every job, keeping the job table.
    fn stop(&self);

    fn jobs(&self) -> Vec<ScheduledJob>;
}

/// Parse a cron expression.
///
/// Five-field expressions get a leading seconds field; `@daily` style
/// macros are passed through.
pub fn parse_schedule(expression: &str) -> Result<Schedule> {
    let trimmed = expression.trim();
    let normalized = if !trimmed.starts_with('@') && trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };
    Schedule::from_str(&normalized).map_err(|e| {
        WardenError::Validation(format!("invalid cron expression '{expression}': {e}"))
    })
}

struct Job {
    expression: String,
    schedule: Schedule,
    action: JobAction,
    handle: Option<JoinHandle<()>>,
}

/// [`Scheduler`] backed by the `cron` crate and tokio tasks.
#[derive(Default)]
pub struct CronScheduler {
    jobs: Mutex<HashMap<String, Job>>,
    running: AtomicBool,
}

impl CronScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn lock_jobs(&self) -> std::sync::MutexGuard<'_, HashMap<String, Job>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn arm(job_id: &str, schedule: &Schedule, action: &JobAction) -> Option<JoinHandle<()>> {
    let handle = match Handle::try_current() {
        Ok(handle) => handle,
        Err(_) => {
            warn!("No tokio runtime; job '{}' not armed", job_id);
            return None;
        }
    };

    let job_id = job_id.to_string();
    let schedule = schedule.clone();
    let action = Arc::clone(action);
    Some(handle.spawn(async move {
        loop {
            let Some(next) = schedule.upcoming(Utc).next() else {
                debug!("Job '{}' has no further occurrences", job_id);
                break;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::time::sleep(wait).await;

            debug!("Firing scheduled job '{}'", job_id);
            tokio::spawn(action());
        }
    }))
}

impl Scheduler for CronScheduler {
    fn add(&self, job_id: &str, expression: &str, action: JobAction) -> Result<()> {
        let schedule = parse_schedule(expression)?;
        let handle = if self.is_running() {
            arm(job_id, &schedule, &action)
        } else {
            None
        };

        let previous = self.lock_jobs().insert(
            job_id.to_string(),
            Job {
                expression: expression.to_string(),
                schedule,
                action,
                handle,
            },
        );
        if let Some(handle) = previous.and_then(|job| job.handle) {
            handle.abort();
        }

        debug!("Scheduled job '{}' ({})", job_id, expression);
        Ok(())
    }

    fn remove(&self, job_id: &str) -> bool {
        match self.lock_jobs().remove(job_id) {
            Some(job) => {
                if let Some(handle) = job.handle {
                    handle.abort();
                }
                debug!("Removed scheduled job '{}'", job_id);
                true
            }
            None => false,
        }
    }

    fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut jobs = self.lock_jobs();
        for (job_id, job) in jobs.iter_mut() {
            if job.handle.is_none() {
                job.handle = arm(job_id, &job.schedule, &job.action);
            }
        }
        info!("Scheduler started with {} jobs", jobs.len());
    }

    fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        for job in self.lock_jobs().values_mut() {
            if let Some(handle) = job.handle.take() {
                handle.abort();
            }
        }
        info!("Scheduler stopped");
    }

    fn jobs(&self) -> Vec<ScheduledJob> {
        let mut jobs: Vec<ScheduledJob> = self
            .lock_jobs()
            .iter()
            .map(|(id, job)| ScheduledJob {
                id: id.clone(),
                expression: job.expression.clone(),
                next_run: job.schedule.upcoming(Utc).next(),
            })
            .collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        jobs
    }
}

/// Keeps `cron` scripts registered with a [`Scheduler`].
pub struct TriggerManager {
    scheduler: Arc<dyn Scheduler>,
    service: Arc<OnceLock<Weak<ScriptService>>>,
}

impl TriggerManager {
    pub fn new(scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            scheduler,
            service: Arc::new(OnceLock::new()),
        }
    }

    /// Point fired jobs at the service that runs them.
    pub(crate) fn bind(&self, service: Weak<ScriptService>) {
        if self.service.set(service).is_err() {
            warn!("Trigger manager already bound to a service");
        }
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    /// Add or replace the job for a cron script.
    pub fn register(&self, script: &Script) -> Result<()> {
        let expression = script.cron_expression().ok_or_else(|| {
            WardenError::Validation(format!(
                "cron script '{}' has no cron_expression",
                script.id
            ))
        })?;

        let service = Arc::clone(&self.service);
        let script_id = script.id.clone();
        let action: JobAction = Arc::new(move || {
            let service = service.get().and_then(Weak::upgrade);
            let script_id = script_id.clone();
            async move {
                let Some(service) = service else {
                    warn!("Cron job '{}' fired with no service bound", script_id);
                    return;
                };
                match service.run(&script_id, serde_json::Value::Null, Trigger::Cron).await {
                    Ok(result) => debug!(
                        "Cron script '{}' finished with status {}",
                        script_id, result.status
                    ),
                    Err(e) => warn!("Cron script '{}' did not run: {}", script_id, e),
                }
            }
            .boxed()
        });

        self.scheduler.add(&script.id, expression, action)
    }

    /// Remove the job for a script. Returns false if none was registered.
    pub fn deregister(&self, script_id: &str) -> bool {
        self.scheduler.remove(script_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_action(counter: Arc<AtomicUsize>) -> JobAction {
        Arc::new(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        })
    }

    #[test]
    fn test_parse_schedule() {
        assert!(parse_schedule("*/5 * * * *").is_ok());
        assert!(parse_schedule("0 */5 * * * *").is_ok());
        assert!(parse_schedule("@daily").is_ok());
        assert!(parse_schedule("@hourly").is_ok());

        let err = parse_schedule("not a cron").unwrap_err();
        assert!(matches!(err, WardenError::Validation(_)));
        assert!(parse_schedule("").is_err());
    }

    #[test]
    fn test_add_rejects_bad_expression() {
        let scheduler = CronScheduler::new();
        let action = counting_action(Arc::new(AtomicUsize::new(0)));
        assert!(scheduler.add("j", "bogus", action).is_err());
        assert!(scheduler.jobs().is_empty());
    }

    #[test]
    fn test_add_remove_jobs() {
        let scheduler = CronScheduler::new();
        let action = counting_action(Arc::new(AtomicUsize::new(0)));
        scheduler.add("b", "@daily", Arc::clone(&action)).unwrap();
        scheduler.add("a", "*/5 * * * *", action).unwrap();

        let jobs = scheduler.jobs();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].id, "a");
        assert!(jobs[0].next_run.is_some());

        assert!(scheduler.remove("a"));
        assert!(!scheduler.remove("a"));
        assert_eq!(scheduler.jobs().len(), 1);
    }

    #[tokio::test]
    async fn test_job_fires_every_second() {
        let scheduler = CronScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler
            .add("tick", "* * * * * *", counting_action(Arc::clone(&counter)))
            .unwrap();

        // Not armed before start
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        scheduler.start();
        assert!(scheduler.is_running());
        tokio::time::sleep(Duration::from_millis(2500)).await;
        let fired = counter.load(Ordering::SeqCst);
        assert!(fired >= 1, "fired {fired} times");

        scheduler.stop();
        assert!(!scheduler.is_running());
        // Job table survives stop
        assert_eq!(scheduler.jobs().len(), 1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let after_stop = counter.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(counter.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn test_add_while_running_arms_immediately() {
        let scheduler = CronScheduler::new();
        scheduler.start();

        let counter = Arc::new(AtomicUsize::new(0));
        scheduler
            .add("tick", "* * * * * *", counting_action(Arc::clone(&counter)))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(counter.load(Ordering::SeqCst) >= 1);
        scheduler.stop();
    }

    #[test]
    fn test_register_requires_expression() {
        use crate::script::types::ScriptRecord;

        let manager = TriggerManager::new(Arc::new(CronScheduler::new()));
        let script = Script::try_from(ScriptRecord::new("c1", "Nightly", "cron", "return 1")).unwrap();
        assert!(matches!(
            manager.register(&script),
            Err(WardenError::Validation(_))
        ));

        let script = Script::try_from(
            ScriptRecord::new("c1", "Nightly", "cron", "return 1").with_meta("cron_expression", "@daily"),
        )
        .unwrap();
        manager.register(&script).unwrap();
        assert_eq!(manager.scheduler().jobs().len(), 1);
        assert!(manager.deregister("c1"));
        assert!(!manager.deregister("c1"));
    }
}
