//! Lifecycle hook dispatch.
//!
//! Host events arrive either through [`HookDispatcher::dispatch`] or the
//! broadcast event bus. Each matching `hook` script runs on its own task.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::service::ScriptService;
use super::types::{Category, Script, Trigger};

/// A host lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookEvent {
    pub name: String,
    #[serde(default)]
    pub payload: Value,
}

impl HookEvent {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

/// Routes events to hook scripts.
pub struct HookDispatcher {
    service: Arc<ScriptService>,
    name_fallback: bool,
}

impl HookDispatcher {
    pub fn new(service: Arc<ScriptService>, name_fallback: bool) -> Self {
        Self {
            service,
            name_fallback,
        }
    }

    /// Enabled hook scripts for an event, highest priority first.
    ///
    /// Scripts declaring the event in their `hooks` metadata win. Only when
    /// none do, and the fallback is on, are scripts whose name contains the
    /// event name (case-insensitive) used.
    pub fn matching(&self, event: &str) -> Vec<Arc<Script>> {
        let hooks: Vec<Arc<Script>> = self
            .service
            .registry()
            .list()
            .into_iter()
            .filter(|s| s.enabled && s.category == Category::Hook)
            .collect();

        let mut matched: Vec<Arc<Script>> = hooks
            .iter()
            .filter(|s| s.hook_names().contains(&event))
            .cloned()
            .collect();

        if matched.is_empty() && self.name_fallback {
            let needle = event.to_lowercase();
            matched = hooks
                .into_iter()
                .filter(|s| s.name.to_lowercase().contains(&needle))
                .collect();
            if !matched.is_empty() {
                debug!("Hook '{}' matched {} scripts by name", event, matched.len());
            }
        }

        matched.sort_by(|a, b| b.priority.cmp(&a.priority));
        matched
    }

    /// Start every matching script in the background.
    ///
    /// Returns at once. Failures are logged and never affect other scripts.
    pub fn dispatch(&self, event: &str, payload: Value) -> Vec<JoinHandle<()>> {
        let scripts = self.matching(event);
        if scripts.is_empty() {
            return Vec::new();
        }
        debug!("Dispatching hook '{}' to {} scripts", event, scripts.len());

        let input = json!({
            "hookName": event,
            "eventData": payload,
            "timestamp": Utc::now().timestamp_millis(),
        });

        scripts
            .into_iter()
            .map(|script| {
                let service = Arc::clone(&self.service);
                let input = input.clone();
                let event = event.to_string();
                tokio::spawn(async move {
                    match service.run(&script.id, input, Trigger::Hook).await {
                        Ok(result) if !result.is_success() => warn!(
                            "Hook script '{}' for '{}' ended with {}: {}",
                            script.id,
                            event,
                            result.status,
                            result.error.as_deref().unwrap_or("")
                        ),
                        Ok(_) => {}
                        Err(e) => warn!("Hook script '{}' for '{}' did not run: {}", script.id, event, e),
                    }
                })
            })
            .collect()
    }

    /// Dispatch every event from the bus until it closes.
    pub fn subscribe(self: &Arc<Self>, mut rx: broadcast::Receiver<HookEvent>) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        dispatcher.dispatch(&event.name, event.payload);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Hook subscriber lagged, {} events skipped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Event bus closed, hook subscriber stopping");
                        break;
                    }
                }
            }
        })
    }
}
