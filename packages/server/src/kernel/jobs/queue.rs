//! Queue façade: the typed enqueue/dequeue surface over the broker.
//!
//! Each queue in the topology is fixed at design time with its own payload
//! schema, default retry policy, concurrency cap and lock duration. The
//! façade - not the worker - owns every job state transition, including the
//! move to the dead-letter store when attempts are exhausted.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::events::JobEvent;
use super::job::{Job, JobOptions, JobStatus};

// ============================================================================
// Topology
// ============================================================================

/// The fixed queue topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueName {
    /// Ingress: chat events validated and fanned out to orchestration.
    ChatEvents,
    /// Calls the orchestration collaborator; enqueues notifications.
    Orchestration,
    /// Sends one chat message; dedups by event id.
    Notifications,
    /// Routes an inbound provider event to its handler.
    Webhooks,
    /// Executes a cron-fired unit of work.
    ScheduledTasks,
    /// Generates and stores embeddings.
    Indexing,
    /// Long-running marketplace installs.
    Installations,
    /// Drains the dead-letter store. Never retries itself.
    DlqRecovery,
}

impl QueueName {
    pub const ALL: [QueueName; 8] = [
        QueueName::ChatEvents,
        QueueName::Orchestration,
        QueueName::Notifications,
        QueueName::Webhooks,
        QueueName::ScheduledTasks,
        QueueName::Indexing,
        QueueName::Installations,
        QueueName::DlqRecovery,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::ChatEvents => "chat-events",
            QueueName::Orchestration => "orchestration",
            QueueName::Notifications => "notifications",
            QueueName::Webhooks => "webhooks",
            QueueName::ScheduledTasks => "scheduled-tasks",
            QueueName::Indexing => "indexing",
            QueueName::Installations => "installations",
            QueueName::DlqRecovery => "dlq-recovery",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|q| q.as_str() == name)
    }

    /// Default configuration for this queue per the fixed topology.
    pub fn default_config(&self) -> QueueConfig {
        match self {
            QueueName::ChatEvents => QueueConfig::new(*self, 5, 3, Duration::from_secs(60)),
            QueueName::Orchestration => {
                // Long lock: the orchestration collaborator can run minutes.
                QueueConfig::new(*self, 3, 2, Duration::from_secs(5 * 60))
            }
            QueueName::Notifications => QueueConfig::new(*self, 10, 3, Duration::from_secs(60)),
            QueueName::Webhooks => QueueConfig::new(*self, 10, 3, Duration::from_secs(60)),
            QueueName::ScheduledTasks => QueueConfig::new(*self, 5, 3, Duration::from_secs(60)),
            QueueName::Indexing => {
                QueueConfig::new(*self, 5, 3, Duration::from_secs(10 * 60))
            }
            QueueName::Installations => {
                QueueConfig::new(*self, 2, 3, Duration::from_secs(5 * 60))
            }
            // The recovery worker is the retry mechanism; it never retries.
            QueueName::DlqRecovery => QueueConfig::new(*self, 1, 1, Duration::from_secs(5 * 60)),
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-queue defaults: worker concurrency, attempt cap, lease policy.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub name: QueueName,
    pub concurrency: usize,
    pub default_attempts: u32,
    pub lock_duration: Duration,
    /// How often the worker reclaims jobs whose lease expired.
    pub stalled_interval: Duration,
    /// Reclaims tolerated before a stalled job is failed.
    pub max_stalled_count: u32,
    /// Completed/failed jobs retained for inspection.
    pub keep_completed: usize,
    pub keep_failed: usize,
}

impl QueueConfig {
    fn new(name: QueueName, concurrency: usize, attempts: u32, lock: Duration) -> Self {
        Self {
            name,
            concurrency,
            default_attempts: attempts,
            lock_duration: lock,
            stalled_interval: Duration::from_secs(30),
            max_stalled_count: 2,
            keep_completed: 100,
            keep_failed: 100,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }
}

// ============================================================================
// Façade results
// ============================================================================

/// Result of an enqueue that may have hit the dedup index.
#[derive(Debug, Clone)]
pub enum EnqueueResult {
    /// A new broker job was created.
    Created(Job),
    /// An equivalent job already existed within the dedup window.
    Duplicate(Job),
}

impl EnqueueResult {
    pub fn job(&self) -> &Job {
        match self {
            EnqueueResult::Created(job) | EnqueueResult::Duplicate(job) => job,
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job().id
    }

    pub fn is_created(&self) -> bool {
        matches!(self, EnqueueResult::Created(_))
    }
}

/// What the façade decided after a handler failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Attempts remain; the job re-enters the delayed set.
    Retrying { delay: Duration, attempts_made: u32 },
    /// Attempts exhausted; a dead-letter entry was written.
    DeadLettered { attempts_made: u32 },
}

/// A stalled job observed during reclamation.
#[derive(Debug, Clone)]
pub struct StalledJob {
    pub job_id: Uuid,
    pub times_stalled: u32,
    /// True when the job exceeded the max stalled count and was failed.
    pub failed: bool,
}

/// Counts per state, for operators and the autoscaler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

// ============================================================================
// Trait
// ============================================================================

/// Storage-agnostic queue operations.
///
/// Implementations: a Redis-backed queue for production and an in-memory
/// queue for tests and single-process runs. Workers drive the lease
/// operations; everything else is the enqueue/inspection surface.
#[async_trait]
pub trait JobQueue: Send + Sync {
    fn name(&self) -> QueueName;

    fn config(&self) -> &QueueConfig;

    /// Enqueue a job. Priority is clamped; a delay parks the job in the
    /// delayed set until due.
    async fn enqueue(
        &self,
        name: &str,
        payload: serde_json::Value,
        opts: JobOptions,
    ) -> Result<Job>;

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>>;

    /// Claim the next due job for `worker_id`, moving it to active and
    /// opening a lease. Promotes due delayed jobs first. Returns None when
    /// nothing is waiting.
    async fn claim(&self, worker_id: &str) -> Result<Option<Job>>;

    /// Extend the lease of an active job (called while the handler runs).
    async fn renew_lease(&self, job_id: Uuid) -> Result<()>;

    /// Mark an active job completed.
    async fn complete(&self, job_id: Uuid) -> Result<()>;

    /// Record a handler failure. Consumes one attempt, then either schedules
    /// a backed-off retry or moves the job to the dead-letter store.
    async fn fail(&self, job_id: Uuid, reason: &str) -> Result<FailOutcome>;

    /// Requeue jobs whose lease expired; fail jobs reclaimed too often.
    async fn reclaim_stalled(&self) -> Result<Vec<StalledJob>>;

    /// Remove a waiting or delayed job. Active jobs are never removed.
    async fn remove(&self, job_id: Uuid) -> Result<bool>;

    async fn job_counts(&self) -> Result<JobCounts>;

    /// Remove terminal jobs older than `age` in the given state.
    async fn clean(&self, age: Duration, status: JobStatus) -> Result<usize>;

    /// Subscribe to job lifecycle events (completed, failed, stalled, ...).
    fn subscribe(&self) -> broadcast::Receiver<JobEvent>;

    /// Number of jobs currently waiting (autoscaler input).
    async fn waiting_count(&self) -> Result<usize> {
        Ok(self.job_counts().await?.waiting)
    }

    /// Number of jobs currently active (health monitor input).
    async fn active_count(&self) -> Result<usize> {
        Ok(self.job_counts().await?.active)
    }
}
