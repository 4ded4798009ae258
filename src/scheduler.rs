//! Cleanup scheduler.
//!
//! Runs plugin-supplied cleanup routines on fixed intervals. Each task
//! gets its own timer loop, so one task never overlaps itself while
//! distinct tasks may run concurrently. Failures are recorded and the
//! task simply waits for its next tick.

use crate::error::AuthResult;
use crate::orm::Orm;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// What a cleanup run accomplished.
#[derive(Debug, Clone, Default)]
pub struct CleanupOutcome {
    /// Rows removed
    pub cleaned: u64,
    /// Errors the runner swallowed
    pub errors: Vec<String>,
}

impl CleanupOutcome {
    /// An outcome with a row count and no errors.
    #[must_use]
    pub fn cleaned(count: u64) -> Self {
        Self {
            cleaned: count,
            errors: Vec::new(),
        }
    }
}

/// A cleanup routine. Runners must be idempotent.
#[async_trait]
pub trait CleanupRunner: Send + Sync {
    /// Perform one cleanup pass.
    async fn run(&self, orm: &dyn Orm, plugin_config: &Value) -> AuthResult<CleanupOutcome>;
}

/// A registered cleanup task.
#[derive(Clone)]
pub struct CleanupTask {
    /// Task name, unique across plugins
    pub name: String,
    /// Owning plugin, used to look up per-plugin config
    pub plugin_name: String,
    /// How often the task fires
    pub interval: Duration,
    /// Disabled tasks are registered but never scheduled
    pub enabled: bool,
    /// The routine to run
    pub runner: Arc<dyn CleanupRunner>,
}

impl CleanupTask {
    /// An enabled task.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        plugin_name: impl Into<String>,
        interval: Duration,
        runner: Arc<dyn CleanupRunner>,
    ) -> Self {
        Self {
            name: name.into(),
            plugin_name: plugin_name.into(),
            interval,
            enabled: true,
            runner,
        }
    }

    /// Register the task without scheduling it.
    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Per-task bookkeeping, in memory only.
#[derive(Debug, Clone)]
pub struct TaskState {
    /// Owning plugin
    pub plugin_name: String,
    /// Configured interval
    pub interval: Duration,
    /// Whether the task is scheduled
    pub enabled: bool,
    /// Start instant of the most recent run
    pub last_run_at: Option<DateTime<Utc>>,
}

/// Periodic task runner owned by the engine.
///
/// Single-process by design; clustered deployments run it on one
/// replica.
pub struct CleanupScheduler {
    orm: Arc<dyn Orm>,
    tasks: Vec<CleanupTask>,
    plugin_configs: HashMap<String, Value>,
    states: Arc<Mutex<HashMap<String, TaskState>>>,
    running: AtomicBool,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl CleanupScheduler {
    /// Create the scheduler with its task list and per-plugin configs.
    #[must_use]
    pub fn new(
        orm: Arc<dyn Orm>,
        tasks: Vec<CleanupTask>,
        plugin_configs: HashMap<String, Value>,
    ) -> Self {
        let states = tasks
            .iter()
            .map(|task| {
                (
                    task.name.clone(),
                    TaskState {
                        plugin_name: task.plugin_name.clone(),
                        interval: task.interval,
                        enabled: task.enabled,
                        last_run_at: None,
                    },
                )
            })
            .collect();
        Self {
            orm,
            tasks,
            plugin_configs,
            states: Arc::new(Mutex::new(states)),
            running: AtomicBool::new(false),
            shutdown: Mutex::new(None),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn a timer loop per enabled task. Idempotent.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let (tx, rx) = watch::channel(false);

        let mut handles = Vec::new();
        for task in self.tasks.iter().filter(|t| t.enabled) {
            let orm = self.orm.clone();
            let config = self
                .plugin_configs
                .get(&task.plugin_name)
                .cloned()
                .unwrap_or(Value::Null);
            let states = self.states.clone();
            let task = task.clone();
            let mut shutdown = rx.clone();

            handles.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(task.interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                // Consume the immediate first tick; the first run happens
                // one full interval after start.
                interval.tick().await;

                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = interval.tick() => {
                            let started = Utc::now();
                            match task.runner.run(orm.as_ref(), &config).await {
                                Ok(outcome) => {
                                    if outcome.errors.is_empty() {
                                        debug!(
                                            task = %task.name,
                                            cleaned = outcome.cleaned,
                                            "Cleanup task finished"
                                        );
                                    } else {
                                        warn!(
                                            task = %task.name,
                                            cleaned = outcome.cleaned,
                                            errors = ?outcome.errors,
                                            "Cleanup task finished with errors"
                                        );
                                    }
                                }
                                Err(err) => {
                                    warn!(task = %task.name, error = %err, "Cleanup task failed");
                                }
                            }
                            if let Some(state) = states.lock().await.get_mut(&task.name) {
                                state.last_run_at = Some(started);
                            }
                        }
                    }
                }
            }));
        }

        *self.shutdown.lock().await = Some(tx);
        *self.handles.lock().await = handles;
        debug!("Cleanup scheduler started");
    }

    /// Stop the scheduler, letting in-flight runs finish. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = self.shutdown.lock().await.take() {
            let _ = tx.send(true);
        }
        for handle in self.handles.lock().await.drain(..) {
            let _ = handle.await;
        }
        debug!("Cleanup scheduler stopped");
    }

    /// Whether the scheduler is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Snapshot of per-task state.
    pub async fn task_states(&self) -> HashMap<String, TaskState> {
        self.states.lock().await.clone()
    }
}
