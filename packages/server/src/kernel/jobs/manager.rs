//! Job manager: the extended enqueue surface over the queue topology.
//!
//! Adds what the raw queues do not know about: the enqueue-side
//! deduplication index, priority clamping, explicit retry overrides,
//! progress publication and job status reads.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use super::job::{JobOptions, JobStatus};
use super::queue::{EnqueueResult, JobQueue, QueueName};
use crate::kernel::kv::KvClient;
use crate::kernel::progress::{ProgressBus, ProgressEvent, ProgressStage};

/// Duplicate enqueues carrying the same key are suppressed for one hour.
const DEDUP_TTL: Duration = Duration::from_secs(60 * 60);

/// Status read for one job, including last-known progress.
#[derive(Debug, Clone)]
pub struct JobStatusReport {
    pub status: JobStatus,
    pub attempts_made: u32,
    pub progress: Option<ProgressEvent>,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Extended enqueue/inspection layer over all queues.
pub struct JobManager {
    queues: HashMap<QueueName, Arc<dyn JobQueue>>,
    kv: Arc<dyn KvClient>,
    progress: ProgressBus,
}

impl JobManager {
    pub fn new(
        queues: HashMap<QueueName, Arc<dyn JobQueue>>,
        kv: Arc<dyn KvClient>,
        progress: ProgressBus,
    ) -> Self {
        Self {
            queues,
            kv,
            progress,
        }
    }

    pub fn queue(&self, name: QueueName) -> Result<&Arc<dyn JobQueue>> {
        match self.queues.get(&name) {
            Some(queue) => Ok(queue),
            None => bail!("queue {name} is not registered"),
        }
    }

    pub fn queues(&self) -> impl Iterator<Item = &Arc<dyn JobQueue>> {
        self.queues.values()
    }

    pub fn progress_bus(&self) -> &ProgressBus {
        &self.progress
    }

    /// Enqueue with the extended options.
    ///
    /// When a dedup key is supplied and a live pointer exists, the existing
    /// job is returned and nothing is enqueued. A pointer whose job no
    /// longer resolves is cleared as stale. Store errors on the dedup path
    /// degrade to "enqueue without dedup protection" with a warning; the
    /// notification sink's sent-marker remains the last barrier.
    pub async fn enqueue(
        &self,
        queue_name: QueueName,
        job_name: &str,
        payload: serde_json::Value,
        opts: JobOptions,
    ) -> Result<EnqueueResult> {
        let queue = self.queue(queue_name)?;

        let dedup_key = opts.dedup_key.clone();
        if let Some(key) = &dedup_key {
            match self.find_deduplicated(queue.as_ref(), key).await {
                Ok(Some(existing)) => {
                    debug!(queue = %queue_name, dedup_key = %key, job_id = %existing.id, "dedup hit");
                    return Ok(EnqueueResult::Duplicate(existing));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(queue = %queue_name, dedup_key = %key, error = %e,
                          "dedup lookup failed; enqueueing without dedup protection");
                }
            }
        }

        let opts = JobOptions {
            priority: opts.clamped_priority(),
            ..opts
        };
        let job = queue.enqueue(job_name, payload, opts).await?;

        if let Some(key) = &dedup_key {
            if let Err(e) = self
                .kv
                .set_ex(&dedup_pointer(key), &job.id.to_string(), DEDUP_TTL)
                .await
            {
                warn!(dedup_key = %key, error = %e, "failed to record dedup pointer");
            }
        }

        Ok(EnqueueResult::Created(job))
    }

    async fn find_deduplicated(
        &self,
        queue: &dyn JobQueue,
        key: &str,
    ) -> Result<Option<super::job::Job>> {
        let pointer = dedup_pointer(key);
        let Some(raw) = self.kv.get(&pointer).await? else {
            return Ok(None);
        };

        let Ok(job_id) = raw.parse::<Uuid>() else {
            self.kv.del(&pointer).await?;
            return Ok(None);
        };

        match queue.get(job_id).await? {
            Some(job) => Ok(Some(job)),
            None => {
                // Pointer outlived its job; clear it so callers can enqueue
                self.kv.del(&pointer).await?;
                Ok(None)
            }
        }
    }

    /// Publish a progress update for a running job.
    ///
    /// Percent is clamped to [0, 100] and the KV snapshot is overwritten so
    /// late subscribers can reconstruct state.
    pub async fn update_progress(
        &self,
        organization_id: Uuid,
        job_id: Uuid,
        stage: ProgressStage,
        percent: u8,
        message: impl Into<String>,
    ) -> Result<()> {
        self.progress
            .publish(
                self.kv.as_ref(),
                organization_id,
                ProgressEvent {
                    job_id,
                    stage,
                    percent: percent.min(100),
                    message: message.into(),
                    timestamp: Utc::now(),
                    metadata: None,
                },
            )
            .await
    }

    /// Status plus last-known progress, attempts and timestamps.
    pub async fn status(&self, queue_name: QueueName, job_id: Uuid) -> Result<JobStatusReport> {
        let queue = self.queue(queue_name)?;
        let progress = self.progress.last_known(self.kv.as_ref(), job_id).await?;

        match queue.get(job_id).await? {
            Some(job) => Ok(JobStatusReport {
                status: job.status,
                attempts_made: job.attempts_made,
                progress,
                created_at: Some(job.created_at),
                started_at: job.started_at,
                finished_at: job.finished_at,
            }),
            None => Ok(JobStatusReport {
                status: JobStatus::Unknown,
                attempts_made: 0,
                progress,
                created_at: None,
                started_at: None,
                finished_at: None,
            }),
        }
    }

    /// Remove a job that has not started. Active jobs are never forcibly
    /// cancelled; cancellation reaches them through the worker's per-job
    /// token.
    pub async fn cancel(&self, queue_name: QueueName, job_id: Uuid) -> Result<bool> {
        let queue = self.queue(queue_name)?;
        queue.remove(job_id).await
    }
}

fn dedup_pointer(key: &str) -> String {
    format!("dedup:{key}")
}
