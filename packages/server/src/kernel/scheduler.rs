//! Distributed cron scheduler.
//!
//! Tasks fire locally via tokio-cron-scheduler; a per-task KV lease makes
//! sure at most one instance fleet-wide runs a named task per tick. Losing
//! instances skip silently. Execution history is kept per task as a bounded
//! KV list.
//!
//! Tasks should enqueue jobs rather than doing heavy work inline - the
//! scheduled-tasks queue gives them retries, progress and dead-lettering
//! for free.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_cron_scheduler::{Job as CronJob, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::deps::ServerDeps;
use super::kv::KvClient;

/// A task whose handler outlives the lock TTL is assumed dead; another
/// instance may acquire the lease on the next tick.
const LOCK_TTL: Duration = Duration::from_secs(60 * 60);
/// Bounded history entries per task.
const HISTORY_LIMIT: isize = 100;
/// History lists expire after a week of inactivity.
const HISTORY_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

pub type TaskHandler = Arc<
    dyn Fn(Arc<ServerDeps>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync,
>;

/// Outcome of one firing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskRunOutcome {
    Completed { duration_ms: u64 },
    Failed { error: String },
    /// Another instance holds the lock for this tick.
    Skipped,
    /// The task is disabled (locally or via the fleet-wide marker).
    Disabled,
}

/// History entry persisted per execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecution {
    pub task: String,
    pub instance: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Status row for operators.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatusReport {
    pub name: String,
    pub cron: String,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub last_status: Option<String>,
    pub last_error: Option<String>,
}

struct RegisteredTask {
    name: String,
    cron: String,
    enabled: AtomicBool,
    handler: TaskHandler,
    last_run: Mutex<Option<DateTime<Utc>>>,
    last_status: Mutex<Option<String>>,
    last_error: Mutex<Option<String>>,
}

/// Cron scheduler with single-leader execution per task.
pub struct CronScheduler {
    kv: Arc<dyn KvClient>,
    deps: Arc<ServerDeps>,
    /// Process-unique value held in acquired locks; only the holder releases.
    instance_id: String,
    tasks: RwLock<HashMap<String, Arc<RegisteredTask>>>,
    runner: tokio::sync::Mutex<Option<JobScheduler>>,
}

impl CronScheduler {
    pub fn new(kv: Arc<dyn KvClient>, deps: Arc<ServerDeps>) -> Self {
        Self {
            kv,
            deps,
            instance_id: format!("scheduler-{}", Uuid::new_v4()),
            tasks: RwLock::new(HashMap::new()),
            runner: tokio::sync::Mutex::new(None),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Register a task. `cron` is a six-field expression (with seconds), UTC.
    pub fn register<F, Fut>(&self, name: &str, cron: &str, handler: F)
    where
        F: Fn(Arc<ServerDeps>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler: TaskHandler = Arc::new(move |deps| Box::pin(handler(deps)));
        let task = Arc::new(RegisteredTask {
            name: name.to_string(),
            cron: cron.to_string(),
            enabled: AtomicBool::new(true),
            handler,
            last_run: Mutex::new(None),
            last_status: Mutex::new(None),
            last_error: Mutex::new(None),
        });
        self.tasks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), task);
    }

    fn task(&self, name: &str) -> Option<Arc<RegisteredTask>> {
        self.tasks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    fn task_names(&self) -> Vec<String> {
        self.tasks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Start firing registered tasks on their cron expressions.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let scheduler = JobScheduler::new().await?;

        for name in self.task_names() {
            let Some(task) = self.task(&name) else {
                continue;
            };
            let this = self.clone();
            let task_name = name.clone();
            let cron_job = CronJob::new_async(task.cron.as_str(), move |_uuid, _lock| {
                let this = this.clone();
                let task_name = task_name.clone();
                Box::pin(async move {
                    if let Err(e) = this.run_task(&task_name).await {
                        error!(task = %task_name, error = %e, "scheduled task errored");
                    }
                })
            })?;
            scheduler.add(cron_job).await?;
        }

        scheduler.start().await?;
        *self.runner.lock().await = Some(scheduler);

        info!(
            instance = %self.instance_id,
            tasks = self.task_names().len(),
            "cron scheduler started"
        );
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        if let Some(mut scheduler) = self.runner.lock().await.take() {
            scheduler.shutdown().await?;
        }
        Ok(())
    }

    /// Execute one task now, under the same fleet-wide lock as a cron tick.
    pub async fn run_task(&self, name: &str) -> Result<TaskRunOutcome> {
        let task = self
            .task(name)
            .ok_or_else(|| anyhow!("unknown scheduled task: {name}"))?;

        if !self.is_enabled_fleet_wide(&task).await? {
            return Ok(TaskRunOutcome::Disabled);
        }

        let lock_key = lock_key(name);
        let acquired = self
            .kv
            .set_nx_ex(&lock_key, &self.instance_id, LOCK_TTL)
            .await?;
        if !acquired {
            info!(task = %name, "skipping - another instance has lock");
            return Ok(TaskRunOutcome::Skipped);
        }

        let started_at = Utc::now();
        let running = TaskExecution {
            task: name.to_string(),
            instance: self.instance_id.clone(),
            started_at,
            duration_ms: 0,
            status: "running".to_string(),
            error: None,
        };
        if let Err(e) = self
            .kv
            .set_ex(&running_key(name), &serde_json::to_string(&running)?, LOCK_TTL)
            .await
        {
            warn!(task = %name, error = %e, "failed to record running execution");
        }

        info!(task = %name, instance = %self.instance_id, "scheduled task starting");
        let start = tokio::time::Instant::now();
        let result = (task.handler)(self.deps.clone()).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let (status, error) = match &result {
            Ok(()) => ("completed".to_string(), None),
            Err(e) => ("failed".to_string(), Some(e.to_string())),
        };

        *task.last_run.lock().unwrap_or_else(|e| e.into_inner()) = Some(started_at);
        *task.last_status.lock().unwrap_or_else(|e| e.into_inner()) = Some(status.clone());
        *task.last_error.lock().unwrap_or_else(|e| e.into_inner()) = error.clone();

        let record = TaskExecution {
            task: name.to_string(),
            instance: self.instance_id.clone(),
            started_at,
            duration_ms,
            status: status.clone(),
            error: error.clone(),
        };
        if let Err(e) = self.push_history(name, &record).await {
            warn!(task = %name, error = %e, "failed to record execution history");
        }

        if let Err(e) = self.kv.del(&running_key(name)).await {
            warn!(task = %name, error = %e, "failed to clear running marker");
        }
        // Only the holder may release
        if let Err(e) = self.kv.del_if_equals(&lock_key, &self.instance_id).await {
            warn!(task = %name, error = %e, "failed to release cron lock");
        }

        match result {
            Ok(()) => {
                info!(task = %name, duration_ms, "scheduled task completed");
                Ok(TaskRunOutcome::Completed { duration_ms })
            }
            Err(e) => {
                error!(task = %name, error = %e, "scheduled task failed");
                Ok(TaskRunOutcome::Failed {
                    error: e.to_string(),
                })
            }
        }
    }

    async fn push_history(&self, name: &str, record: &TaskExecution) -> Result<()> {
        let key = history_key(name);
        self.kv.lpush(&key, &serde_json::to_string(record)?).await?;
        self.kv.ltrim(&key, 0, HISTORY_LIMIT - 1).await?;
        self.kv.expire(&key, HISTORY_TTL).await?;
        Ok(())
    }

    /// Execution history for one task, newest first.
    pub async fn history(&self, name: &str, limit: usize) -> Result<Vec<TaskExecution>> {
        let raw = self
            .kv
            .lrange(&history_key(name), 0, limit.saturating_sub(1) as isize)
            .await?;
        let mut entries = Vec::with_capacity(raw.len());
        for item in raw {
            match serde_json::from_str(&item) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(task = %name, error = %e, "skipping malformed history entry"),
            }
        }
        Ok(entries)
    }

    /// Enable a task locally and clear the fleet-wide disabled marker.
    pub async fn enable(&self, name: &str) -> Result<()> {
        let task = self
            .task(name)
            .ok_or_else(|| anyhow!("unknown scheduled task: {name}"))?;
        task.enabled.store(true, Ordering::SeqCst);
        self.kv.del(&disabled_key(name)).await?;
        Ok(())
    }

    /// Disable a task everywhere via the fleet-wide marker.
    pub async fn disable(&self, name: &str) -> Result<()> {
        let task = self
            .task(name)
            .ok_or_else(|| anyhow!("unknown scheduled task: {name}"))?;
        task.enabled.store(false, Ordering::SeqCst);
        // Marker outlives process restarts; enable() clears it
        self.kv
            .set_ex(&disabled_key(name), "1", HISTORY_TTL)
            .await?;
        Ok(())
    }

    async fn is_enabled_fleet_wide(&self, task: &RegisteredTask) -> Result<bool> {
        if !task.enabled.load(Ordering::SeqCst) {
            return Ok(false);
        }
        Ok(self.kv.get(&disabled_key(&task.name)).await?.is_none())
    }

    /// Status rows for every registered task, name-sorted.
    pub async fn status(&self) -> Result<Vec<TaskStatusReport>> {
        let tasks: Vec<Arc<RegisteredTask>> = {
            let guard = self.tasks.read().unwrap_or_else(|e| e.into_inner());
            guard.values().cloned().collect()
        };

        let mut reports = Vec::with_capacity(tasks.len());
        for task in tasks {
            reports.push(TaskStatusReport {
                name: task.name.clone(),
                cron: task.cron.clone(),
                enabled: self.is_enabled_fleet_wide(&task).await?,
                last_run: *task.last_run.lock().unwrap_or_else(|e| e.into_inner()),
                last_status: task
                    .last_status
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone(),
                last_error: task
                    .last_error
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone(),
            });
        }
        reports.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(reports)
    }
}

fn lock_key(name: &str) -> String {
    format!("cron:lock:{name}")
}

fn running_key(name: &str) -> String {
    format!("cron:running:{name}")
}

fn history_key(name: &str) -> String {
    format!("cron:executions:{name}")
}

fn disabled_key(name: &str) -> String {
    format!("cron:disabled:{name}")
}
