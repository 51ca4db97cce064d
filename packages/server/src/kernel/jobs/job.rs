//! Job model for queued background work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use super::queue::QueueName;

/// Highest priority a caller may request (1 = most urgent).
pub const PRIORITY_HIGHEST: u8 = 1;
/// Lowest priority a caller may request.
pub const PRIORITY_LOWEST: u8 = 10;
/// Priority assigned when the caller does not ask for one.
pub const PRIORITY_DEFAULT: u8 = 5;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
    DeadLettered,
    Unknown,
}

impl JobStatus {
    /// Whether a job in this state can still be removed by a caller.
    ///
    /// Active jobs are never forcibly cancelled; cancellation flows through
    /// the per-job cancellation token carried by the worker.
    pub fn is_removable(&self) -> bool {
        matches!(self, JobStatus::Waiting | JobStatus::Delayed)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::DeadLettered
        )
    }
}

// ============================================================================
// Options
// ============================================================================

/// Extended per-job options accepted at enqueue time.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct JobOptions {
    /// 1-10, 1 = highest. Clamped into range on enqueue.
    #[builder(default = PRIORITY_DEFAULT)]
    pub priority: u8,

    /// Suppresses duplicate enqueues carrying the same key for one hour.
    #[builder(default, setter(strip_option))]
    pub dedup_key: Option<String>,

    /// Deadline imposed on the job's cancellation token while it runs.
    #[builder(default, setter(strip_option))]
    pub timeout: Option<Duration>,

    /// Keeps the job in the delayed set until the delay elapses.
    #[builder(default, setter(strip_option))]
    pub delay: Option<Duration>,

    /// Explicit attempt cap. None uses the queue's default.
    #[builder(default, setter(strip_option))]
    pub attempts: Option<u32>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl JobOptions {
    /// Clamp the requested priority into the supported range.
    pub fn clamped_priority(&self) -> u8 {
        self.priority.clamp(PRIORITY_HIGHEST, PRIORITY_LOWEST)
    }

    /// Explicit retry count: attempts = retries + 1.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.attempts = Some(retries + 1);
        self
    }
}

// ============================================================================
// Job
// ============================================================================

/// A unit of work owned by a queue until a worker acquires its lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub queue: QueueName,
    /// Job name; selects the registered handler.
    pub name: String,
    pub payload: serde_json::Value,
    pub opts: JobOptions,
    pub status: JobStatus,
    /// Attempts consumed so far (0 until the first handler invocation fails).
    pub attempts_made: u32,
    /// Effective attempt cap for this job (options override or queue default).
    pub attempt_cap: u32,
    pub failed_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(
        queue: QueueName,
        name: impl Into<String>,
        payload: serde_json::Value,
        opts: JobOptions,
        default_attempts: u32,
    ) -> Self {
        let attempt_cap = opts.attempts.unwrap_or(default_attempts).max(1);
        let status = if opts.delay.is_some() {
            JobStatus::Delayed
        } else {
            JobStatus::Waiting
        };

        Self {
            id: Uuid::new_v4(),
            queue,
            name: name.into(),
            payload,
            opts,
            status,
            attempts_made: 0,
            attempt_cap,
            failed_reason: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Whether another failure would exhaust this job's attempts.
    pub fn attempts_exhausted(&self) -> bool {
        self.attempts_made >= self.attempt_cap
    }

    /// Retry delay after `attempts_made` failures: exponential from 1 second.
    pub fn retry_backoff(&self) -> Duration {
        let exp = self.attempts_made.saturating_sub(1).min(16);
        Duration::from_secs(1u64 << exp)
    }
}

// ============================================================================
// Dead-letter entry
// ============================================================================

/// A job captured at terminal failure, held for recovery or inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub original_queue: QueueName,
    pub job_id: Uuid,
    pub name: String,
    pub payload: serde_json::Value,
    pub failed_reason: String,
    pub attempts_made: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn from_job(job: &Job, failed_reason: impl Into<String>) -> Self {
        Self {
            original_queue: job.queue,
            job_id: job.id,
            name: job.name.clone(),
            payload: job.payload.clone(),
            failed_reason: failed_reason.into(),
            attempts_made: job.attempts_made,
            enqueued_at: Utc::now(),
        }
    }

    /// Age of this entry relative to `now`.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.enqueued_at
    }
}
