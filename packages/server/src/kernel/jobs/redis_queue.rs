//! Redis-backed queue implementation.
//!
//! Queue state lives entirely in the coordination store so any process can
//! enqueue and any worker can claim:
//!
//! ```text
//! queue:{q}:job:{id}    JSON job record
//! queue:{q}:wait:{p}    wait list per priority (1..=10), FIFO within a list
//! queue:{q}:delayed     zset of "{p}:{id}" scored by due time (epoch ms)
//! queue:{q}:active      set of claimed job ids
//! queue:{q}:lease:{id}  worker id, expires with the lock duration
//! queue:{q}:stalled     hash id -> reclaim count
//! queue:{q}:completed   bounded id list (newest first)
//! queue:{q}:failed      bounded id list (newest first)
//! ```
//!
//! Claims run through a Lua script so promote-and-pop is atomic across
//! competing worker processes. Per-job record updates are plain overwrites:
//! exactly one worker owns a job between claim and finish, so they are safe
//! by design.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::dead_letter::DeadLetterStore;
use super::events::JobEvent;
use super::job::{DeadLetterEntry, Job, JobOptions, JobStatus};
use super::queue::{FailOutcome, JobCounts, JobQueue, QueueConfig, QueueName, StalledJob};
use crate::kernel::jobs::job::{PRIORITY_HIGHEST, PRIORITY_LOWEST};

/// Move due entries from the delayed zset onto their wait lists.
const PROMOTE_DUE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 100)
for _, member in ipairs(due) do
  local sep = string.find(member, ':', 1, true)
  local prio = string.sub(member, 1, sep - 1)
  local id = string.sub(member, sep + 1)
  redis.call('RPUSH', ARGV[2] .. prio, id)
  redis.call('ZREM', KEYS[1], member)
end
return #due
"#;

/// Pop the highest-priority waiting job, mark it active, open its lease.
const CLAIM_SCRIPT: &str = r#"
for prio = 1, 10 do
  local id = redis.call('LPOP', ARGV[1] .. prio)
  if id then
    redis.call('SADD', KEYS[1], id)
    redis.call('SET', ARGV[2] .. id, ARGV[3], 'PX', ARGV[4])
    return id
  end
end
return false
"#;

/// Redis-backed [`JobQueue`].
pub struct RedisJobQueue {
    config: QueueConfig,
    manager: ConnectionManager,
    dead_letter: Arc<DeadLetterStore>,
    promote_due: redis::Script,
    claim_next: redis::Script,
    events: broadcast::Sender<JobEvent>,
}

impl RedisJobQueue {
    pub fn new(
        config: QueueConfig,
        manager: ConnectionManager,
        dead_letter: Arc<DeadLetterStore>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            manager,
            dead_letter,
            promote_due: redis::Script::new(PROMOTE_DUE_SCRIPT),
            claim_next: redis::Script::new(CLAIM_SCRIPT),
            events,
        }
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }

    fn key(&self, suffix: &str) -> String {
        format!("queue:{}:{}", self.config.name, suffix)
    }

    fn job_key(&self, job_id: Uuid) -> String {
        self.key(&format!("job:{job_id}"))
    }

    fn wait_prefix(&self) -> String {
        self.key("wait:")
    }

    fn lease_prefix(&self) -> String {
        self.key("lease:")
    }

    fn emit(&self, event: JobEvent) {
        let _ = self.events.send(event);
    }

    async fn load_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        let raw: Option<String> = self.conn().get(self.job_key(job_id)).await?;
        match raw {
            Some(json) => Ok(Some(
                serde_json::from_str(&json).context("malformed job record")?,
            )),
            None => Ok(None),
        }
    }

    async fn store_job(&self, job: &Job) -> Result<()> {
        let raw = serde_json::to_string(job)?;
        let () = self.conn().set(self.job_key(job.id), raw).await?;
        Ok(())
    }

    async fn promote_due_delayed(&self) -> Result<()> {
        let mut conn = self.conn();
        let _promoted: i64 = self
            .promote_due
            .key(self.key("delayed"))
            .arg(Utc::now().timestamp_millis())
            .arg(self.wait_prefix())
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Park a job on the delayed zset until `delay` elapses.
    async fn push_delayed(&self, job: &Job, delay: Duration) -> Result<()> {
        let due = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        let member = format!("{}:{}", job.opts.clamped_priority(), job.id);
        let _: i64 = self.conn().zadd(self.key("delayed"), member, due).await?;
        Ok(())
    }

    /// Append to a bounded terminal list, evicting overflowed job records.
    async fn push_terminal(&self, list: &str, job_id: Uuid, keep: usize) -> Result<()> {
        let key = self.key(list);
        let mut conn = self.conn();
        let _: i64 = conn.lpush(&key, job_id.to_string()).await?;

        let evicted: Vec<String> = conn.lrange(&key, keep as isize, -1).await?;
        for id in evicted {
            if let Ok(id) = id.parse::<Uuid>() {
                let _: i64 = conn.del(self.job_key(id)).await?;
            }
        }
        let () = conn.ltrim(&key, 0, keep as isize - 1).await?;
        Ok(())
    }

    async fn clear_lease(&self, job_id: Uuid) -> Result<()> {
        let mut conn = self.conn();
        let _: i64 = conn.srem(self.key("active"), job_id.to_string()).await?;
        let _: i64 = conn.del(format!("{}{}", self.lease_prefix(), job_id)).await?;
        Ok(())
    }

    /// Record a failure. `force_terminal` skips remaining attempts (used for
    /// jobs stalled past the reclaim limit).
    async fn fail_inner(
        &self,
        job_id: Uuid,
        reason: &str,
        force_terminal: bool,
    ) -> Result<FailOutcome> {
        let Some(mut job) = self.load_job(job_id).await? else {
            bail!("unknown job {job_id}")
        };

        self.clear_lease(job_id).await?;
        job.attempts_made += 1;
        job.failed_reason = Some(reason.to_string());

        if force_terminal || job.attempts_exhausted() {
            job.status = JobStatus::DeadLettered;
            job.finished_at = Some(Utc::now());
            self.store_job(&job).await?;
            let _: i64 = self
                .conn()
                .hdel(self.key("stalled"), job_id.to_string())
                .await?;
            self.push_terminal("failed", job_id, self.config.keep_failed)
                .await?;

            self.emit(JobEvent::Failed {
                queue: self.config.name,
                job_id,
                name: job.name.clone(),
                error: reason.to_string(),
                attempt: job.attempts_made,
                will_retry: false,
            });

            let entry = DeadLetterEntry::from_job(&job, reason);
            self.dead_letter.push(&entry).await?;
            self.emit(JobEvent::DeadLettered {
                queue: self.config.name,
                job_id,
                name: job.name,
                total_attempts: job.attempts_made,
                final_error: reason.to_string(),
            });

            Ok(FailOutcome::DeadLettered {
                attempts_made: job.attempts_made,
            })
        } else {
            let delay = job.retry_backoff();
            job.status = JobStatus::Delayed;
            self.store_job(&job).await?;
            self.push_delayed(&job, delay).await?;

            self.emit(JobEvent::Failed {
                queue: self.config.name,
                job_id,
                name: job.name,
                error: reason.to_string(),
                attempt: job.attempts_made,
                will_retry: true,
            });

            Ok(FailOutcome::Retrying {
                delay,
                attempts_made: job.attempts_made,
            })
        }
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
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
        self.store_job(&job).await?;

        match job.opts.delay {
            Some(delay) => self.push_delayed(&job, delay).await?,
            None => {
                let wait_key = format!("{}{}", self.wait_prefix(), job.opts.clamped_priority());
                let _: i64 = self.conn().rpush(wait_key, job.id.to_string()).await?;
            }
        }

        Ok(job)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        self.load_job(job_id).await
    }

    async fn claim(&self, worker_id: &str) -> Result<Option<Job>> {
        self.promote_due_delayed().await?;

        let mut conn = self.conn();
        let claimed: Option<String> = self
            .claim_next
            .key(self.key("active"))
            .arg(self.wait_prefix())
            .arg(self.lease_prefix())
            .arg(worker_id)
            .arg(self.config.lock_duration.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;

        let Some(id) = claimed else {
            return Ok(None);
        };
        let job_id: Uuid = id.parse().context("non-uuid id on wait list")?;

        let Some(mut job) = self.load_job(job_id).await? else {
            bail!("claimed job {job_id} has no record")
        };
        job.status = JobStatus::Active;
        job.started_at.get_or_insert(Utc::now());
        self.store_job(&job).await?;

        self.emit(JobEvent::Started {
            queue: self.config.name,
            job_id,
            name: job.name.clone(),
            worker_id: worker_id.to_string(),
            attempt: job.attempts_made + 1,
        });

        Ok(Some(job))
    }

    async fn renew_lease(&self, job_id: Uuid) -> Result<()> {
        let lease_key = format!("{}{}", self.lease_prefix(), job_id);
        let renewed: bool = self
            .conn()
            .pexpire(lease_key, self.config.lock_duration.as_millis() as i64)
            .await?;
        if !renewed {
            bail!("job {job_id} holds no active lease");
        }
        Ok(())
    }

    async fn complete(&self, job_id: Uuid) -> Result<()> {
        let Some(mut job) = self.load_job(job_id).await? else {
            bail!("unknown job {job_id}")
        };

        let now = Utc::now();
        job.status = JobStatus::Completed;
        job.finished_at = Some(now);
        self.store_job(&job).await?;

        self.clear_lease(job_id).await?;
        let mut conn = self.conn();
        let _: i64 = conn.hdel(self.key("stalled"), job_id.to_string()).await?;
        self.push_terminal("completed", job_id, self.config.keep_completed)
            .await?;

        self.emit(JobEvent::Completed {
            queue: self.config.name,
            job_id,
            name: job.name,
            duration_ms: job
                .started_at
                .map(|s| (now - s).num_milliseconds().max(0) as u64)
                .unwrap_or(0),
        });
        Ok(())
    }

    async fn fail(&self, job_id: Uuid, reason: &str) -> Result<FailOutcome> {
        self.fail_inner(job_id, reason, false).await
    }

    async fn reclaim_stalled(&self) -> Result<Vec<StalledJob>> {
        let mut conn = self.conn();
        let active: Vec<String> = conn.smembers(self.key("active")).await?;

        let mut stalled = Vec::new();
        for id in active {
            let lease_alive: bool = conn
                .exists(format!("{}{}", self.lease_prefix(), id))
                .await?;
            if lease_alive {
                continue;
            }

            let Ok(job_id) = id.parse::<Uuid>() else {
                continue;
            };
            let times_stalled: i64 = conn
                .hincr(self.key("stalled"), id.clone(), 1)
                .await?;
            let times_stalled = times_stalled.max(0) as u32;
            let _: i64 = conn.srem(self.key("active"), id.clone()).await?;

            if times_stalled > self.config.max_stalled_count {
                self.fail_inner(job_id, "job stalled more than allowable limit", true)
                    .await?;
                stalled.push(StalledJob {
                    job_id,
                    times_stalled,
                    failed: true,
                });
            } else {
                if let Some(mut job) = self.load_job(job_id).await? {
                    job.status = JobStatus::Waiting;
                    self.store_job(&job).await?;
                    let wait_key =
                        format!("{}{}", self.wait_prefix(), job.opts.clamped_priority());
                    let _: i64 = conn.rpush(wait_key, id.clone()).await?;
                }
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
        }

        Ok(stalled)
    }

    async fn remove(&self, job_id: Uuid) -> Result<bool> {
        let Some(job) = self.load_job(job_id).await? else {
            return Ok(false);
        };
        if !job.status.is_removable() {
            return Ok(false);
        }

        let mut conn = self.conn();
        let prio = job.opts.clamped_priority();
        let _: i64 = conn
            .lrem(
                format!("{}{}", self.wait_prefix(), prio),
                0,
                job_id.to_string(),
            )
            .await?;
        let _: i64 = conn
            .zrem(self.key("delayed"), format!("{prio}:{job_id}"))
            .await?;
        let _: i64 = conn.del(self.job_key(job_id)).await?;

        self.emit(JobEvent::Removed {
            queue: self.config.name,
            job_id,
        });
        Ok(true)
    }

    async fn job_counts(&self) -> Result<JobCounts> {
        let mut conn = self.conn();

        let mut waiting = 0usize;
        for prio in PRIORITY_HIGHEST..=PRIORITY_LOWEST {
            let len: i64 = conn
                .llen(format!("{}{}", self.wait_prefix(), prio))
                .await?;
            waiting += len.max(0) as usize;
        }

        let delayed: i64 = conn.zcard(self.key("delayed")).await?;
        let active: i64 = conn.scard(self.key("active")).await?;
        let completed: i64 = conn.llen(self.key("completed")).await?;
        let failed: i64 = conn.llen(self.key("failed")).await?;

        Ok(JobCounts {
            waiting,
            delayed: delayed.max(0) as usize,
            active: active.max(0) as usize,
            completed: completed.max(0) as usize,
            failed: failed.max(0) as usize,
        })
    }

    async fn clean(&self, age: Duration, status: JobStatus) -> Result<usize> {
        let list = match status {
            JobStatus::Completed => "completed",
            JobStatus::Failed | JobStatus::DeadLettered => "failed",
            _ => bail!("clean only applies to terminal states"),
        };

        let cutoff = Utc::now() - chrono::Duration::from_std(age)?;
        let mut conn = self.conn();
        let ids: Vec<String> = conn.lrange(self.key(list), 0, -1).await?;

        let mut removed = 0usize;
        for id in ids {
            let Ok(job_id) = id.parse::<Uuid>() else {
                continue;
            };
            let Some(job) = self.load_job(job_id).await? else {
                let _: i64 = conn.lrem(self.key(list), 0, id).await?;
                continue;
            };
            let stale = job
                .finished_at
                .map(|finished| finished < cutoff)
                .unwrap_or(false);
            if stale {
                let _: i64 = conn.lrem(self.key(list), 0, id).await?;
                let _: i64 = conn.del(self.job_key(job_id)).await?;
                removed += 1;
            }
        }

        Ok(removed)
    }

    fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }
}
