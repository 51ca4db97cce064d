//! In-memory queue implementation.
//!
//! Backs tests and single-process development. Semantics mirror the Redis
//! queue: priority-ordered FIFO dispatch, a delayed set promoted on claim,
//! leases with expiry-driven reclamation, bounded completed/failed
//! retention, and terminal moves into the shared dead-letter store.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::dead_letter::DeadLetterStore;
use super::events::JobEvent;
use super::job::{DeadLetterEntry, Job, JobOptions, JobStatus};
use super::queue::{FailOutcome, JobCounts, JobQueue, QueueConfig, QueueName, StalledJob};

struct Lease {
    #[allow(dead_code)]
    worker_id: String,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    jobs: HashMap<Uuid, Job>,
    /// (priority, enqueue sequence, job id); scanned for the minimum.
    waiting: Vec<(u8, u64, Uuid)>,
    delayed: Vec<(DateTime<Utc>, Uuid)>,
    active: HashMap<Uuid, Lease>,
    stalled_counts: HashMap<Uuid, u32>,
    completed: VecDeque<Uuid>,
    failed: VecDeque<Uuid>,
    next_seq: u64,
}

/// In-memory [`JobQueue`].
pub struct InMemoryJobQueue {
    config: QueueConfig,
    dead_letter: Arc<DeadLetterStore>,
    state: Mutex<State>,
    events: broadcast::Sender<JobEvent>,
}

impl InMemoryJobQueue {
    pub fn new(config: QueueConfig, dead_letter: Arc<DeadLetterStore>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            dead_letter,
            state: Mutex::new(State::default()),
            events,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: JobEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    fn promote_due_delayed(state: &mut State, now: DateTime<Utc>) {
        let mut due = Vec::new();
        state.delayed.retain(|(run_at, id)| {
            if *run_at <= now {
                due.push(*id);
                false
            } else {
                true
            }
        });

        for id in due {
            if let Some(job) = state.jobs.get_mut(&id) {
                job.status = JobStatus::Waiting;
                let seq = state.next_seq;
                state.next_seq += 1;
                state.waiting.push((job.opts.clamped_priority(), seq, id));
            }
        }
    }

    /// Terminal path: record the failure, write the dead-letter entry.
    async fn dead_letter_job(&self, job: Job, reason: &str) -> Result<FailOutcome> {
        let entry = DeadLetterEntry::from_job(&job, reason);
        self.dead_letter.push(&entry).await?;

        self.emit(JobEvent::DeadLettered {
            queue: self.config.name,
            job_id: job.id,
            name: job.name.clone(),
            total_attempts: job.attempts_made,
            final_error: reason.to_string(),
        });

        Ok(FailOutcome::DeadLettered {
            attempts_made: job.attempts_made,
        })
    }

    /// Record a failure. `force_terminal` skips remaining attempts (used for
    /// jobs stalled past the reclaim limit).
    async fn fail_inner(
        &self,
        job_id: Uuid,
        reason: &str,
        force_terminal: bool,
    ) -> Result<FailOutcome> {
        let (job, outcome_retry) = {
            let mut state = self.lock();
            state.active.remove(&job_id);

            let keep_failed = self.config.keep_failed;
            let Some(job) = state.jobs.get_mut(&job_id) else {
                bail!("unknown job {job_id}")
            };

            job.attempts_made += 1;
            job.failed_reason = Some(reason.to_string());

            if force_terminal || job.attempts_exhausted() {
                job.status = JobStatus::DeadLettered;
                job.finished_at = Some(Utc::now());
                let snapshot = job.clone();

                state.failed.push_back(job_id);
                while state.failed.len() > keep_failed {
                    if let Some(evicted) = state.failed.pop_front() {
                        state.jobs.remove(&evicted);
                    }
                }
                state.stalled_counts.remove(&job_id);

                (snapshot, None)
            } else {
                let delay = job.retry_backoff();
                job.status = JobStatus::Delayed;
                let snapshot = job.clone();
                let run_at = Utc::now() + chrono::Duration::from_std(delay)?;
                state.delayed.push((run_at, job_id));
                (snapshot, Some(delay))
            }
        };

        match outcome_retry {
            Some(delay) => {
                self.emit(JobEvent::Failed {
                    queue: self.config.name,
                    job_id,
                    name: job.name.clone(),
                    error: reason.to_string(),
                    attempt: job.attempts_made,
                    will_retry: true,
                });
                Ok(FailOutcome::Retrying {
                    delay,
                    attempts_made: job.attempts_made,
                })
            }
            None => {
                self.emit(JobEvent::Failed {
                    queue: self.config.name,
                    job_id,
                    name: job.name.clone(),
                    error: reason.to_string(),
                    attempt: job.attempts_made,
                    will_retry: false,
                });
                self.dead_letter_job(job, reason).await
            }
        }
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    fn name(&self) -> QueueName {
        self.config.name
    }

    fn config(&self) -> &QueueConfig {
        &self.config
    }

    async fn enqueue(
        &self,
        name: &str,
        payload: serde_json::Value,
        opts: JobOptions,
    ) -> Result<Job> {
        let job = Job::new(
            self.config.name,
            name,
            payload,
            opts,
            self.config.default_attempts,
        );

        let mut state = self.lock();
        match job.status {
            JobStatus::Delayed => {
                let delay = job.opts.delay.unwrap_or(Duration::ZERO);
                let run_at = Utc::now() + chrono::Duration::from_std(delay)?;
                state.delayed.push((run_at, job.id));
            }
            _ => {
                let seq = state.next_seq;
                state.next_seq += 1;
                state.waiting.push((job.opts.clamped_priority(), seq, job.id));
            }
        }
        state.jobs.insert(job.id, job.clone());

        Ok(job)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        Ok(self.lock().jobs.get(&job_id).cloned())
    }

    async fn claim(&self, worker_id: &str) -> Result<Option<Job>> {
        let now = Utc::now();
        let claimed = {
            let mut state = self.lock();
            Self::promote_due_delayed(&mut state, now);

            let Some(best_idx) = state
                .waiting
                .iter()
                .enumerate()
                .min_by_key(|(_, (prio, seq, _))| (*prio, *seq))
                .map(|(idx, _)| idx)
            else {
                return Ok(None);
            };

            let (_, _, id) = state.waiting.swap_remove(best_idx);
            let lock_duration = chrono::Duration::from_std(self.config.lock_duration)?;
            state.active.insert(
                id,
                Lease {
                    worker_id: worker_id.to_string(),
                    expires_at: now + lock_duration,
                },
            );

            let Some(job) = state.jobs.get_mut(&id) else {
                bail!("waiting entry without job record: {id}")
            };
            job.status = JobStatus::Active;
            job.started_at.get_or_insert(now);
            job.clone()
        };

        self.emit(JobEvent::Started {
            queue: self.config.name,
            job_id: claimed.id,
            name: claimed.name.clone(),
            worker_id: worker_id.to_string(),
            attempt: claimed.attempts_made + 1,
        });

        Ok(Some(claimed))
    }

    async fn renew_lease(&self, job_id: Uuid) -> Result<()> {
        let mut state = self.lock();
        let lock_duration = chrono::Duration::from_std(self.config.lock_duration)?;
        match state.active.get_mut(&job_id) {
            Some(lease) => {
                lease.expires_at = Utc::now() + lock_duration;
                Ok(())
            }
            None => bail!("job {job_id} holds no active lease"),
        }
    }

    async fn complete(&self, job_id: Uuid) -> Result<()> {
        let (name, duration_ms) = {
            let mut state = self.lock();
            state.active.remove(&job_id);
            state.stalled_counts.remove(&job_id);

            let keep = self.config.keep_completed;
            let Some(job) = state.jobs.get_mut(&job_id) else {
                bail!("unknown job {job_id}")
            };
            let now = Utc::now();
            job.status = JobStatus::Completed;
            job.finished_at = Some(now);
            let duration_ms = job
                .started_at
                .map(|s| (now - s).num_milliseconds().max(0) as u64)
                .unwrap_or(0);
            let name = job.name.clone();

            state.completed.push_back(job_id);
            while state.completed.len() > keep {
                if let Some(evicted) = state.completed.pop_front() {
                    state.jobs.remove(&evicted);
                }
            }

            (name, duration_ms)
        };

        self.emit(JobEvent::Completed {
            queue: self.config.name,
            job_id,
            name,
            duration_ms,
        });
        Ok(())
    }

    async fn fail(&self, job_id: Uuid, reason: &str) -> Result<FailOutcome> {
        self.fail_inner(job_id, reason, false).await
    }

    async fn reclaim_stalled(&self) -> Result<Vec<StalledJob>> {
        let now = Utc::now();
        let (requeued, overruns) = {
            let mut state = self.lock();

            let expired: Vec<Uuid> = state
                .active
                .iter()
                .filter(|(_, lease)| lease.expires_at <= now)
                .map(|(id, _)| *id)
                .collect();

            let mut requeued = Vec::new();
            let mut overruns = Vec::new();
            for id in expired {
                state.active.remove(&id);
                let count = {
                    let slot = state.stalled_counts.entry(id).or_insert(0);
                    *slot += 1;
                    *slot
                };

                if count > self.config.max_stalled_count {
                    overruns.push((id, count));
                } else {
                    let priority = match state.jobs.get_mut(&id) {
                        Some(job) => {
                            job.status = JobStatus::Waiting;
                            Some(job.opts.clamped_priority())
                        }
                        None => None,
                    };
                    if let Some(priority) = priority {
                        let seq = state.next_seq;
                        state.next_seq += 1;
                        state.waiting.push((priority, seq, id));
                    }
                    requeued.push((id, count));
                }
            }
            (requeued, overruns)
        };

        let mut stalled = Vec::new();
        for (job_id, times_stalled) in requeued {
            self.emit(JobEvent::Stalled {
                queue: self.config.name,
                job_id,
                times_stalled,
            });
            stalled.push(StalledJob {
                job_id,
                times_stalled,
                failed: false,
            });
        }

        for (job_id, times_stalled) in overruns {
            self.fail_inner(job_id, "job stalled more than allowable limit", true)
                .await?;
            stalled.push(StalledJob {
                job_id,
                times_stalled,
                failed: true,
            });
        }

        Ok(stalled)
    }

    async fn remove(&self, job_id: Uuid) -> Result<bool> {
        let removed = {
            let mut state = self.lock();
            let removable = state
                .jobs
                .get(&job_id)
                .map(|j| j.status.is_removable())
                .unwrap_or(false);
            if !removable {
                return Ok(false);
            }

            state.waiting.retain(|(_, _, id)| *id != job_id);
            state.delayed.retain(|(_, id)| *id != job_id);
            state.jobs.remove(&job_id);
            true
        };

        if removed {
            self.emit(JobEvent::Removed {
                queue: self.config.name,
                job_id,
            });
        }
        Ok(removed)
    }

    async fn job_counts(&self) -> Result<JobCounts> {
        let state = self.lock();
        let mut counts = JobCounts::default();
        for job in state.jobs.values() {
            match job.status {
                JobStatus::Waiting => counts.waiting += 1,
                JobStatus::Delayed => counts.delayed += 1,
                JobStatus::Active => counts.active += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed | JobStatus::DeadLettered => counts.failed += 1,
                JobStatus::Unknown => {}
            }
        }
        Ok(counts)
    }

    async fn clean(&self, age: Duration, status: JobStatus) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::from_std(age)?;
        let mut state = self.lock();

        let stale: Vec<Uuid> = state
            .jobs
            .values()
            .filter(|job| {
                job.status == status
                    && job
                        .finished_at
                        .map(|finished| finished < cutoff)
                        .unwrap_or(false)
            })
            .map(|job| job.id)
            .collect();

        for id in &stale {
            state.jobs.remove(id);
            state.completed.retain(|c| c != id);
            state.failed.retain(|f| f != id);
        }

        Ok(stale.len())
    }

    fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::kv::InMemoryKvClient;
    use serde_json::json;

    fn queue_with(config: QueueConfig) -> InMemoryJobQueue {
        let kv = Arc::new(InMemoryKvClient::new());
        InMemoryJobQueue::new(config, Arc::new(DeadLetterStore::new(kv)))
    }

    fn queue() -> InMemoryJobQueue {
        queue_with(QueueName::Orchestration.default_config())
    }

    #[tokio::test]
    async fn enqueue_then_claim_returns_the_job() {
        let q = queue();
        let job = q
            .enqueue("orchestrate", json!({"request": "x"}), JobOptions::default())
            .await
            .unwrap();

        let claimed = q.claim("worker-1").await.unwrap().unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.status, JobStatus::Active);

        assert!(q.claim("worker-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_respects_priority_then_fifo() {
        let q = queue();
        let low = q
            .enqueue("a", json!({}), JobOptions::builder().priority(9u8).build())
            .await
            .unwrap();
        let high = q
            .enqueue("b", json!({}), JobOptions::builder().priority(1u8).build())
            .await
            .unwrap();
        let mid_first = q
            .enqueue("c", json!({}), JobOptions::builder().priority(5u8).build())
            .await
            .unwrap();
        let mid_second = q
            .enqueue("d", json!({}), JobOptions::builder().priority(5u8).build())
            .await
            .unwrap();

        let order: Vec<Uuid> = [
            q.claim("w").await.unwrap().unwrap().id,
            q.claim("w").await.unwrap().unwrap().id,
            q.claim("w").await.unwrap().unwrap().id,
            q.claim("w").await.unwrap().unwrap().id,
        ]
        .to_vec();

        assert_eq!(order, vec![high.id, mid_first.id, mid_second.id, low.id]);
    }

    #[tokio::test]
    async fn delayed_jobs_are_not_claimable_until_due() {
        let q = queue();
        q.enqueue(
            "later",
            json!({}),
            JobOptions::builder().delay(Duration::from_secs(3600)).build(),
        )
        .await
        .unwrap();

        assert!(q.claim("w").await.unwrap().is_none());
        assert_eq!(q.job_counts().await.unwrap().delayed, 1);
    }

    #[tokio::test]
    async fn fail_retries_until_attempts_exhausted_then_dead_letters() {
        let kv = Arc::new(InMemoryKvClient::new());
        let dead_letter = Arc::new(DeadLetterStore::new(kv));
        let q = InMemoryJobQueue::new(
            QueueName::Orchestration.default_config(),
            dead_letter.clone(),
        );

        let job = q
            .enqueue("orchestrate", json!({}), JobOptions::default())
            .await
            .unwrap();
        assert_eq!(job.attempt_cap, 2);

        q.claim("w").await.unwrap().unwrap();
        let first = q.fail(job.id, "ECONNREFUSED peer").await.unwrap();
        assert!(matches!(first, FailOutcome::Retrying { attempts_made: 1, .. }));

        // Wait out the 1s backoff, then the final attempt
        tokio::time::sleep(Duration::from_millis(1100)).await;
        q.claim("w").await.unwrap().unwrap();
        let second = q.fail(job.id, "ECONNREFUSED peer").await.unwrap();
        assert!(matches!(second, FailOutcome::DeadLettered { attempts_made: 2 }));

        let entries = dead_letter.peek(10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].job_id, job.id);
        assert_eq!(entries[0].original_queue, QueueName::Orchestration);
        assert_eq!(entries[0].failed_reason, "ECONNREFUSED peer");
    }

    #[tokio::test]
    async fn reclaim_requeues_expired_leases() {
        let mut config = QueueName::ChatEvents.default_config();
        config.lock_duration = Duration::ZERO;
        let q = queue_with(config);

        let job = q
            .enqueue("ingest", json!({}), JobOptions::default())
            .await
            .unwrap();
        q.claim("w").await.unwrap().unwrap();

        let stalled = q.reclaim_stalled().await.unwrap();
        assert_eq!(stalled.len(), 1);
        assert_eq!(stalled[0].job_id, job.id);
        assert!(!stalled[0].failed);

        // Back to waiting, claimable again
        let reclaimed = q.claim("w2").await.unwrap().unwrap();
        assert_eq!(reclaimed.id, job.id);
    }

    #[tokio::test]
    async fn repeatedly_stalled_job_is_failed() {
        let mut config = QueueName::ChatEvents.default_config();
        config.lock_duration = Duration::ZERO;
        config.max_stalled_count = 1;
        let q = queue_with(config);

        let job = q
            .enqueue("ingest", json!({}), JobOptions::default())
            .await
            .unwrap();

        // Stall once (requeued), twice (over the limit)
        q.claim("w").await.unwrap().unwrap();
        q.reclaim_stalled().await.unwrap();
        q.claim("w").await.unwrap().unwrap();
        let second = q.reclaim_stalled().await.unwrap();

        assert_eq!(second.len(), 1);
        assert!(second[0].failed);
        let stored = q.get(job.id).await.unwrap().unwrap();
        assert!(stored.status.is_terminal());
    }

    #[tokio::test]
    async fn remove_only_touches_waiting_or_delayed() {
        let q = queue();
        let waiting = q.enqueue("a", json!({}), JobOptions::default()).await.unwrap();
        assert!(q.remove(waiting.id).await.unwrap());

        let active = q.enqueue("b", json!({}), JobOptions::default()).await.unwrap();
        q.claim("w").await.unwrap().unwrap();
        assert!(!q.remove(active.id).await.unwrap());
    }

    #[tokio::test]
    async fn completed_retention_is_bounded() {
        let mut config = QueueName::Notifications.default_config();
        config.keep_completed = 2;
        let q = queue_with(config);

        let mut ids = Vec::new();
        for i in 0..3 {
            let job = q
                .enqueue("send", json!({"n": i}), JobOptions::default())
                .await
                .unwrap();
            ids.push(job.id);
            q.claim("w").await.unwrap().unwrap();
            q.complete(job.id).await.unwrap();
        }

        // Oldest completed job evicted
        assert!(q.get(ids[0]).await.unwrap().is_none());
        assert!(q.get(ids[2]).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn lifecycle_events_are_published() {
        let q = queue();
        let mut rx = q.subscribe();

        let job = q.enqueue("x", json!({}), JobOptions::default()).await.unwrap();
        q.claim("w").await.unwrap().unwrap();
        q.complete(job.id).await.unwrap();

        assert!(matches!(rx.recv().await.unwrap(), JobEvent::Started { .. }));
        assert!(matches!(rx.recv().await.unwrap(), JobEvent::Completed { .. }));
    }
}
