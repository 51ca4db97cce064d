//! Worker-health monitor.
//!
//! Workers heartbeat into the KV under a short TTL; health is derived from
//! the heartbeat's presence and age plus the worker's running flag.
//! Registration and lifecycle counters (processed, failed, processing time)
//! also live in the KV, so any process - other hosts, the operator CLI -
//! sees every worker instance, including ones the autoscaler added.
//! The active-job count is read from the queue on demand.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tracing::warn;

use super::jobs::queue::{JobQueue, QueueName};
use super::kv::KvClient;

/// Heartbeats are written every 15 s...
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
/// ...expire after 60 s...
pub const HEARTBEAT_TTL: Duration = Duration::from_secs(60);
/// ...and count as stale after 45 s.
pub const STALE_AFTER: Duration = Duration::from_secs(45);

/// Fleet-visible list of "name|queue" registration entries.
const REGISTRY_KEY: &str = "worker:registry";
/// Registration and metrics age out after a day without renewal.
const REGISTRY_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const METRICS_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// Hard cap on registry entries.
const REGISTRY_LIMIT: isize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Healthy,
    Stalled,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerHealthReport {
    pub name: String,
    pub status: WorkerStatus,
    pub jobs_processed: u64,
    pub jobs_failed: u64,
    pub mean_processing_ms: u64,
    pub active_jobs: usize,
}

struct LocalWorker {
    queue: Arc<dyn JobQueue>,
    is_running: Arc<AtomicBool>,
}

/// Derives worker status from KV heartbeats and keeps per-worker counters
/// in the KV.
pub struct WorkerHealthMonitor {
    kv: Arc<dyn KvClient>,
    /// Queues for on-demand active counts, including remote workers' queues.
    queues: RwLock<HashMap<QueueName, Arc<dyn JobQueue>>>,
    /// Workers running in this process; carries the live running flag.
    local: RwLock<HashMap<String, LocalWorker>>,
}

impl WorkerHealthMonitor {
    pub fn new(kv: Arc<dyn KvClient>) -> Self {
        Self::with_queues(kv, HashMap::new())
    }

    /// Monitor with the full queue topology, so reports can resolve active
    /// counts for workers registered by other processes.
    pub fn with_queues(
        kv: Arc<dyn KvClient>,
        queues: HashMap<QueueName, Arc<dyn JobQueue>>,
    ) -> Self {
        Self {
            kv,
            queues: RwLock::new(queues),
            local: RwLock::new(HashMap::new()),
        }
    }

    /// Register a worker. `is_running` is shared with the worker's lifecycle.
    ///
    /// The registration is also written to the fleet registry in the KV
    /// (best-effort, in the background) so other processes list this
    /// instance.
    pub fn register(
        &self,
        name: impl Into<String>,
        queue: Arc<dyn JobQueue>,
        is_running: Arc<AtomicBool>,
    ) {
        let name = name.into();
        let queue_name = queue.name();

        {
            let mut queues = self.queues.write().unwrap_or_else(|e| e.into_inner());
            queues.entry(queue_name).or_insert_with(|| queue.clone());
        }
        self.local
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.clone(), LocalWorker { queue, is_running });

        let kv = self.kv.clone();
        tokio::spawn(async move {
            if let Err(e) = register_fleet_wide(kv.as_ref(), &name, queue_name).await {
                warn!(worker = %name, error = %e, "failed to record fleet registration");
            }
        });
    }

    fn local_worker_names(&self) -> Vec<String> {
        self.local
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    fn local_running(&self, name: &str) -> Option<bool> {
        self.local
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .map(|w| w.is_running.load(Ordering::SeqCst))
    }

    fn local_queue_name(&self, name: &str) -> Option<QueueName> {
        self.local
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .map(|w| w.queue.name())
    }

    fn queue_for(&self, queue_name: QueueName) -> Option<Arc<dyn JobQueue>> {
        self.queues
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&queue_name)
            .cloned()
    }

    /// Write the worker's heartbeat (epoch millis, short TTL).
    pub async fn heartbeat(&self, name: &str) -> Result<()> {
        let now_ms = Utc::now().timestamp_millis();
        self.kv
            .set_ex(&heartbeat_key(name), &now_ms.to_string(), HEARTBEAT_TTL)
            .await
    }

    /// Raw heartbeat value, None once the TTL expired.
    pub async fn get_heartbeat(&self, name: &str) -> Result<Option<i64>> {
        let raw = self.kv.get(&heartbeat_key(name)).await?;
        Ok(raw.and_then(|v| v.parse().ok()))
    }

    /// Count one processed job. Best-effort: a flaky store must not fail
    /// the job that just succeeded.
    pub async fn record_success(&self, name: &str, duration_ms: u64) {
        let key = metrics_key(name);
        let result = async {
            self.kv.hincrby(&key, "processed", 1).await?;
            self.kv.hincrby(&key, "total_ms", duration_ms as i64).await?;
            self.kv.expire(&key, METRICS_TTL).await
        }
        .await;
        if let Err(e) = result {
            warn!(worker = %name, error = %e, "failed to record success metrics");
        }
    }

    /// Count one failed job. Best-effort like [`Self::record_success`].
    pub async fn record_failure(&self, name: &str) {
        let key = metrics_key(name);
        let result = async {
            self.kv.hincrby(&key, "failed", 1).await?;
            self.kv.expire(&key, METRICS_TTL).await
        }
        .await;
        if let Err(e) = result {
            warn!(worker = %name, error = %e, "failed to record failure metrics");
        }
    }

    /// Derive one worker's status from its running flag and heartbeat age.
    ///
    /// The running flag is only known for workers in this process; for
    /// remote instances the heartbeat alone decides, per the derivation
    /// table (missing or old heartbeat means stalled).
    pub async fn status(&self, name: &str) -> Result<WorkerStatus> {
        if self.local_running(name) == Some(false) {
            return Ok(WorkerStatus::Stopped);
        }

        match self.get_heartbeat(name).await? {
            None => Ok(WorkerStatus::Stalled),
            Some(beat_ms) => {
                let age_ms = Utc::now().timestamp_millis().saturating_sub(beat_ms);
                if age_ms > STALE_AFTER.as_millis() as i64 {
                    Ok(WorkerStatus::Stalled)
                } else {
                    Ok(WorkerStatus::Healthy)
                }
            }
        }
    }

    /// Full health report for one worker, local or fleet-registered.
    pub async fn worker_health(&self, name: &str) -> Result<Option<WorkerHealthReport>> {
        let queue_name = match self.local_queue_name(name) {
            Some(queue_name) => Some(queue_name),
            None => self
                .fleet_registrations()
                .await?
                .into_iter()
                .find(|(n, _)| n == name)
                .map(|(_, queue_name)| queue_name),
        };
        let Some(queue_name) = queue_name else {
            return Ok(None);
        };

        Ok(Some(self.build_report(name, queue_name).await?))
    }

    /// Reports for every worker in the fleet (local and remote instances),
    /// name-sorted for stable output.
    pub async fn report(&self) -> Result<Vec<WorkerHealthReport>> {
        let mut workers: BTreeMap<String, QueueName> = BTreeMap::new();
        for name in self.local_worker_names() {
            if let Some(queue_name) = self.local_queue_name(&name) {
                workers.insert(name, queue_name);
            }
        }
        for (name, queue_name) in self.fleet_registrations().await? {
            workers.entry(name).or_insert(queue_name);
        }

        let mut reports = Vec::with_capacity(workers.len());
        for (name, queue_name) in workers {
            reports.push(self.build_report(&name, queue_name).await?);
        }
        Ok(reports)
    }

    async fn build_report(&self, name: &str, queue_name: QueueName) -> Result<WorkerHealthReport> {
        let status = self.status(name).await?;

        let metrics = self.kv.hgetall(&metrics_key(name)).await?;
        let field = |key: &str| -> u64 {
            metrics
                .get(key)
                .and_then(|v| v.parse::<i64>().ok())
                .map(|v| v.max(0) as u64)
                .unwrap_or(0)
        };
        let processed = field("processed");
        let failed = field("failed");
        let total_ms = field("total_ms");

        let active_jobs = match self.queue_for(queue_name) {
            Some(queue) => queue.active_count().await.unwrap_or(0),
            None => 0,
        };

        Ok(WorkerHealthReport {
            name: name.to_string(),
            status,
            jobs_processed: processed,
            jobs_failed: failed,
            mean_processing_ms: if processed > 0 { total_ms / processed } else { 0 },
            active_jobs,
        })
    }

    async fn fleet_registrations(&self) -> Result<Vec<(String, QueueName)>> {
        let raw = self.kv.lrange(REGISTRY_KEY, 0, -1).await?;
        let mut registrations = Vec::with_capacity(raw.len());
        for entry in raw {
            let Some((name, queue)) = entry.split_once('|') else {
                continue;
            };
            let Some(queue_name) = QueueName::parse(queue) else {
                continue;
            };
            registrations.push((name.to_string(), queue_name));
        }
        Ok(registrations)
    }
}

async fn register_fleet_wide(kv: &dyn KvClient, name: &str, queue_name: QueueName) -> Result<()> {
    let member = format!("{name}|{queue_name}");
    let existing = kv.lrange(REGISTRY_KEY, 0, -1).await?;
    if !existing.contains(&member) {
        kv.lpush(REGISTRY_KEY, &member).await?;
        kv.ltrim(REGISTRY_KEY, 0, REGISTRY_LIMIT - 1).await?;
    }
    kv.expire(REGISTRY_KEY, REGISTRY_TTL).await?;
    Ok(())
}

fn heartbeat_key(name: &str) -> String {
    format!("worker:health:{name}")
}

fn metrics_key(name: &str) -> String {
    format!("worker:metrics:{name}")
}
