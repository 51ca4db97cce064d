//! Worker base: the long-lived consumer loop for one queue.
//!
//! A worker claims jobs up to its concurrency cap, runs the registered
//! handler inside the job's tenant context, renews the job's lease while
//! the handler runs, reclaims stalled jobs on an interval, and heartbeats
//! the health monitor. Handler panics are caught and treated as failures;
//! they never take the worker down.
//!
//! # Architecture
//!
//! ```text
//! Worker (per queue, N instances)
//!     │
//!     ├─► dispatch loop: semaphore permit → claim → spawn handler task
//!     │       ├─► lease renewal every lock_duration / 2
//!     │       ├─► progress bookends (started / completed / failed)
//!     │       └─► on failure: queue.fail() → retry or dead-letter
//!     ├─► stalled reclaimer every stalled_interval
//!     └─► health heartbeat every 15 s
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::job::Job;
use super::queue::{FailOutcome, JobQueue, QueueName};
use super::registry::{JobContext, SharedHandlerRegistry};
use crate::kernel::alerter::FailureAlerter;
use crate::kernel::deps::ServerDeps;
use crate::kernel::health::{WorkerHealthMonitor, HEARTBEAT_INTERVAL};
use crate::kernel::progress::ProgressStage;

/// A consumer of exactly one queue.
pub struct Worker {
    name: String,
    queue: Arc<dyn JobQueue>,
    handlers: SharedHandlerRegistry,
    deps: Arc<ServerDeps>,
    health: Arc<WorkerHealthMonitor>,
    alerter: Arc<FailureAlerter>,
    poll_interval: Duration,
    shutdown: CancellationToken,
    is_running: Arc<AtomicBool>,
    in_flight: Arc<AtomicUsize>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Worker {
    pub fn new(
        name: impl Into<String>,
        queue: Arc<dyn JobQueue>,
        handlers: SharedHandlerRegistry,
        deps: Arc<ServerDeps>,
        health: Arc<WorkerHealthMonitor>,
        alerter: Arc<FailureAlerter>,
    ) -> Self {
        Self {
            name: name.into(),
            queue,
            handlers,
            deps,
            health,
            alerter,
            poll_interval: Duration::from_millis(500),
            shutdown: CancellationToken::new(),
            is_running: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// How long the dispatch loop sleeps when the queue is empty.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue_name(&self) -> QueueName {
        self.queue.name()
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Register with the health monitor and start consuming.
    pub fn spawn(self) -> Arc<Self> {
        let worker = Arc::new(self);
        worker.is_running.store(true, Ordering::SeqCst);
        worker.health.register(
            worker.name.clone(),
            worker.queue.clone(),
            worker.is_running.clone(),
        );

        let mut tasks = worker.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.push(tokio::spawn(worker.clone().dispatch_loop()));
        tasks.push(tokio::spawn(worker.clone().reclaim_loop()));
        tasks.push(tokio::spawn(worker.clone().heartbeat_loop()));
        drop(tasks);

        info!(
            worker = %worker.name,
            queue = %worker.queue.name(),
            concurrency = worker.queue.config().concurrency,
            "worker started"
        );
        worker
    }

    /// Stop intake, drain in-flight jobs within `deadline`, then shut down.
    pub async fn close(&self, deadline: Duration) {
        info!(worker = %self.name, "worker closing");
        self.shutdown.cancel();

        let start = tokio::time::Instant::now();
        while self.in_flight.load(Ordering::SeqCst) > 0 && start.elapsed() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let remaining = self.in_flight.load(Ordering::SeqCst);
        if remaining > 0 {
            warn!(worker = %self.name, remaining, "deadline elapsed; forcing shutdown");
        }

        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for task in tasks {
            task.abort();
        }

        self.is_running.store(false, Ordering::SeqCst);
        info!(worker = %self.name, "worker stopped");
    }

    async fn dispatch_loop(self: Arc<Self>) {
        let semaphore = Arc::new(Semaphore::new(self.queue.config().concurrency));

        loop {
            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.queue.claim(&self.name).await {
                Ok(Some(job)) => {
                    self.in_flight.fetch_add(1, Ordering::SeqCst);
                    let worker = self.clone();
                    tokio::spawn(async move {
                        worker.process_job(job).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!(worker = %self.name, error = %e, "failed to claim job");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }
    }

    async fn process_job(&self, job: Job) {
        let ctx = JobContext::for_job(&job, self.shutdown.child_token());
        let org = ctx.tenant.organization_id;

        // Timeout imposes a deadline on the job's token; the lease still
        // expires if the handler ignores it.
        if let Some(timeout) = job.opts.timeout {
            let cancel = ctx.cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(timeout) => {
                        debug!("job timeout elapsed; cancelling");
                        cancel.cancel();
                    }
                }
            });
        }

        if let Err(e) = self
            .deps
            .job_manager
            .update_progress(org, job.id, ProgressStage::Started, 5, "started")
            .await
        {
            warn!(job_id = %job.id, error = %e, "failed to publish started progress");
        }

        let started = tokio::time::Instant::now();
        let result = self.run_handler(&job, ctx.clone()).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        // Releases the timeout watchdog, if any
        ctx.cancel.cancel();

        match result {
            Ok(()) => {
                debug!(worker = %self.name, job_id = %job.id, job_name = %job.name, "job succeeded");
                if let Err(e) = self.queue.complete(job.id).await {
                    error!(job_id = %job.id, error = %e, "failed to mark job completed");
                }
                self.health.record_success(&self.name, duration_ms).await;
                if let Err(e) = self
                    .deps
                    .job_manager
                    .update_progress(org, job.id, ProgressStage::Completed, 100, "completed")
                    .await
                {
                    warn!(job_id = %job.id, error = %e, "failed to publish completed progress");
                }
            }
            Err(e) => {
                let reason = e.to_string();
                warn!(worker = %self.name, job_id = %job.id, job_name = %job.name, error = %reason, "job failed");

                self.health.record_failure(&self.name).await;
                if let Err(alert_err) = self.alerter.record_failure(self.queue.name(), &reason).await
                {
                    warn!(error = %alert_err, "failed to record failure for alerting");
                }

                match self.queue.fail(job.id, &reason).await {
                    Ok(FailOutcome::Retrying { delay, attempts_made }) => {
                        debug!(
                            job_id = %job.id,
                            attempts_made,
                            retry_in_ms = delay.as_millis() as u64,
                            "job scheduled for retry"
                        );
                    }
                    Ok(FailOutcome::DeadLettered { attempts_made }) => {
                        error!(
                            job_id = %job.id,
                            attempts_made,
                            "job exhausted attempts and was dead-lettered"
                        );
                    }
                    Err(mark_err) => {
                        error!(job_id = %job.id, error = %mark_err, "failed to mark job failed");
                    }
                }

                if let Err(progress_err) = self
                    .deps
                    .job_manager
                    .update_progress(org, job.id, ProgressStage::Failed, 0, reason)
                    .await
                {
                    warn!(job_id = %job.id, error = %progress_err, "failed to publish failed progress");
                }
            }
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    /// Run the handler on its own task with periodic lease renewal.
    ///
    /// Spawning isolates panics: a crashed handler surfaces as an error and
    /// consumes an attempt like any other failure.
    async fn run_handler(&self, job: &Job, ctx: JobContext) -> Result<()> {
        let renewal_stop = CancellationToken::new();
        let renewal = {
            let queue = self.queue.clone();
            let job_id = job.id;
            let stop = renewal_stop.clone();
            let every = self.queue.config().lock_duration / 2;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(every);
                interval.tick().await; // skip the immediate tick
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = interval.tick() => {
                            if let Err(e) = queue.renew_lease(job_id).await {
                                warn!(job_id = %job_id, error = %e, "lease renewal failed");
                            }
                        }
                    }
                }
            })
        };

        let result = match self.handlers.prepare(job, ctx, self.deps.clone()) {
            Ok(fut) => match tokio::spawn(fut).await {
                Ok(result) => result,
                Err(join_err) if join_err.is_panic() => Err(anyhow!("handler crashed")),
                Err(_) => Err(anyhow!("handler task was aborted")),
            },
            Err(e) => Err(e),
        };

        renewal_stop.cancel();
        let _ = renewal.await;

        result
    }

    async fn reclaim_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.queue.config().stalled_interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    match self.queue.reclaim_stalled().await {
                        Ok(stalled) if !stalled.is_empty() => {
                            warn!(
                                worker = %self.name,
                                count = stalled.len(),
                                "reclaimed stalled jobs"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!(worker = %self.name, error = %e, "stalled reclamation failed"),
                    }
                }
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        // First heartbeat immediately so health reads see the worker at boot
        if let Err(e) = self.health.heartbeat(&self.name).await {
            warn!(worker = %self.name, error = %e, "heartbeat failed");
        }

        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.health.heartbeat(&self.name).await {
                        warn!(worker = %self.name, error = %e, "heartbeat failed");
                    }
                }
            }
        }
    }
}

// ============================================================================
// Worker registry
// ============================================================================

/// Owns every worker instance in the process.
///
/// Starts one worker per queue at boot, applies autoscaler targets by
/// spawning or closing instances, and enforces the fleet shutdown deadline
/// in reverse start order.
pub struct WorkerRegistry {
    queues: std::collections::HashMap<QueueName, Arc<dyn JobQueue>>,
    handlers: SharedHandlerRegistry,
    deps: Arc<ServerDeps>,
    health: Arc<WorkerHealthMonitor>,
    alerter: Arc<FailureAlerter>,
    workers: tokio::sync::Mutex<std::collections::HashMap<QueueName, Vec<Arc<Worker>>>>,
    shutdown_deadline: Duration,
}

impl WorkerRegistry {
    pub fn new(
        queues: std::collections::HashMap<QueueName, Arc<dyn JobQueue>>,
        handlers: SharedHandlerRegistry,
        deps: Arc<ServerDeps>,
        health: Arc<WorkerHealthMonitor>,
        alerter: Arc<FailureAlerter>,
        shutdown_deadline: Duration,
    ) -> Self {
        Self {
            queues,
            handlers,
            deps,
            health,
            alerter,
            workers: tokio::sync::Mutex::new(std::collections::HashMap::new()),
            shutdown_deadline,
        }
    }

    fn build_worker(&self, queue: &Arc<dyn JobQueue>, instance: usize) -> Arc<Worker> {
        let name = if instance == 0 {
            queue.name().to_string()
        } else {
            format!("{}-{}", queue.name(), instance + 1)
        };
        Worker::new(
            name,
            queue.clone(),
            self.handlers.clone(),
            self.deps.clone(),
            self.health.clone(),
            self.alerter.clone(),
        )
        .spawn()
    }

    /// Start one worker per registered queue.
    pub async fn start_all(&self) {
        let mut workers = self.workers.lock().await;
        for name in QueueName::ALL {
            let Some(queue) = self.queues.get(&name) else {
                continue;
            };
            workers
                .entry(name)
                .or_default()
                .push(self.build_worker(queue, 0));
        }
        info!(count = workers.len(), "all workers started");
    }

    /// Apply an autoscaler target for one queue.
    pub async fn scale_to(&self, queue_name: QueueName, target: usize) -> Result<()> {
        let Some(queue) = self.queues.get(&queue_name) else {
            anyhow::bail!("queue {queue_name} is not registered")
        };

        let mut workers = self.workers.lock().await;
        let instances = workers.entry(queue_name).or_default();

        while instances.len() < target {
            let instance = instances.len();
            instances.push(self.build_worker(queue, instance));
        }
        while instances.len() > target.max(1) {
            if let Some(worker) = instances.pop() {
                worker.close(self.shutdown_deadline).await;
            }
        }

        Ok(())
    }

    pub async fn worker_count(&self, queue_name: QueueName) -> usize {
        self.workers
            .lock()
            .await
            .get(&queue_name)
            .map(|w| w.len())
            .unwrap_or(0)
    }

    /// Stop every worker in reverse start order within the fleet deadline.
    pub async fn stop_all(&self) {
        let mut workers = self.workers.lock().await;
        for name in QueueName::ALL.iter().rev() {
            let Some(instances) = workers.remove(name) else {
                continue;
            };
            for worker in instances.iter().rev() {
                worker.close(self.shutdown_deadline).await;
            }
        }
        info!("all workers stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::jobs::job::{JobOptions, JobStatus};
    use crate::kernel::jobs::registry::HandlerRegistry;
    use crate::kernel::kv::KvClient;
    use crate::kernel::testing::test_deps;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Deserialize)]
    struct TickJob {
        #[serde(default)]
        panic: bool,
    }

    fn worker_for(
        queue: QueueName,
        handlers: HandlerRegistry,
    ) -> (Arc<Worker>, crate::kernel::testing::TestMocks) {
        let (deps, mocks) = test_deps();
        let alerter = Arc::new(FailureAlerter::new(
            mocks.kv.clone(),
            mocks.failure_sink.clone(),
            "#ops-alerts",
        ));
        let health = Arc::new(WorkerHealthMonitor::new(mocks.kv.clone()));
        let worker = Worker::new(
            queue.as_str(),
            mocks.queue(queue),
            Arc::new(handlers),
            deps,
            health,
            alerter,
        )
        .with_poll_interval(Duration::from_millis(20))
        .spawn();
        (worker, mocks)
    }

    async fn wait_until(mut check: impl FnMut() -> bool, timeout: Duration) -> bool {
        let start = tokio::time::Instant::now();
        while start.elapsed() < timeout {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    #[tokio::test]
    async fn worker_processes_an_enqueued_job() {
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = counter.clone();

        let mut handlers = HandlerRegistry::new();
        handlers.register::<TickJob, _, _>("tick", move |_job, _ctx, _deps| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let (worker, mocks) = worker_for(QueueName::ChatEvents, handlers);
        let queue = mocks.queue(QueueName::ChatEvents);

        let job = queue
            .enqueue("tick", json!({}), JobOptions::default())
            .await
            .unwrap();

        assert!(
            wait_until(
                || counter.load(Ordering::SeqCst) == 1,
                Duration::from_secs(2)
            )
            .await
        );

        let mut completed = false;
        for _ in 0..100 {
            if let Some(stored) = queue.get(job.id).await.unwrap() {
                if stored.status == JobStatus::Completed {
                    completed = true;
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(completed);

        worker.close(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn concurrency_cap_bounds_active_jobs() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        let mut handlers = HandlerRegistry::new();
        {
            let active = active.clone();
            let peak = peak.clone();
            let done = done.clone();
            handlers.register::<TickJob, _, _>("tick", move |_job, _ctx, _deps| {
                let active = active.clone();
                let peak = peak.clone();
                let done = done.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(80)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });
        }

        // Orchestration has concurrency 3
        let (worker, mocks) = worker_for(QueueName::Orchestration, handlers);
        let queue = mocks.queue(QueueName::Orchestration);

        for _ in 0..10 {
            queue
                .enqueue("tick", json!({}), JobOptions::default())
                .await
                .unwrap();
        }

        assert!(
            wait_until(
                || done.load(Ordering::SeqCst) == 10,
                Duration::from_secs(5)
            )
            .await
        );
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 2, "jobs should overlap");

        worker.close(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn handler_panic_is_caught_and_consumes_an_attempt() {
        let mut handlers = HandlerRegistry::new();
        handlers.register::<TickJob, _, _>("tick", |job, _ctx, _deps| async move {
            if job.panic {
                panic!("boom");
            }
            Ok(())
        });

        let (worker, mocks) = worker_for(QueueName::DlqRecovery, handlers);
        let queue = mocks.queue(QueueName::DlqRecovery);

        // dlq-recovery has a single attempt: one panic dead-letters it
        let job = queue
            .enqueue("tick", json!({"panic": true}), JobOptions::default())
            .await
            .unwrap();

        let mut found = None;
        for _ in 0..100 {
            found = mocks.dead_letter.find(job.id).await.unwrap();
            if found.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(found.is_some());

        let entry = found.unwrap();
        assert_eq!(entry.failed_reason, "handler crashed");
        assert!(worker.is_running(), "panic must not kill the worker");

        worker.close(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn close_drains_in_flight_jobs() {
        let done = Arc::new(AtomicUsize::new(0));
        let seen = done.clone();

        let mut handlers = HandlerRegistry::new();
        handlers.register::<TickJob, _, _>("tick", move |_job, _ctx, _deps| {
            let seen = seen.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(150)).await;
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let (worker, mocks) = worker_for(QueueName::Webhooks, handlers);
        let queue = mocks.queue(QueueName::Webhooks);

        queue
            .enqueue("tick", json!({}), JobOptions::default())
            .await
            .unwrap();

        assert!(
            wait_until(|| worker.in_flight() == 1, Duration::from_secs(2)).await,
            "job should be picked up"
        );

        worker.close(Duration::from_secs(2)).await;

        assert_eq!(done.load(Ordering::SeqCst), 1, "in-flight job drained");
        assert!(!worker.is_running());
    }

    #[tokio::test]
    async fn failure_increments_queue_failure_counter() {
        let mut handlers = HandlerRegistry::new();
        handlers.register::<TickJob, _, _>("tick", |_job, _ctx, _deps| async move {
            anyhow::bail!("ECONNREFUSED peer")
        });

        let (worker, mocks) = worker_for(QueueName::Indexing, handlers);
        let queue = mocks.queue(QueueName::Indexing);

        queue
            .enqueue("tick", json!({}), JobOptions::default())
            .await
            .unwrap();

        let mut counted = false;
        for _ in 0..100 {
            if mocks.kv.get("errors:indexing:count").await.unwrap().is_some() {
                counted = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(counted);

        worker.close(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn registry_starts_scales_and_stops_workers() {
        let (deps, mocks) = test_deps();
        let alerter = Arc::new(FailureAlerter::new(
            mocks.kv.clone(),
            mocks.failure_sink.clone(),
            "#ops-alerts",
        ));
        let health = Arc::new(WorkerHealthMonitor::new(mocks.kv.clone()));
        let mut handlers = HandlerRegistry::new();
        handlers.register::<TickJob, _, _>("tick", |_job, _ctx, _deps| async move { Ok(()) });

        let registry = WorkerRegistry::new(
            mocks.queues.clone(),
            Arc::new(handlers),
            deps,
            health,
            alerter,
            Duration::from_secs(1),
        );

        registry.start_all().await;
        assert_eq!(registry.worker_count(QueueName::Orchestration).await, 1);

        registry.scale_to(QueueName::Orchestration, 3).await.unwrap();
        assert_eq!(registry.worker_count(QueueName::Orchestration).await, 3);

        registry.scale_to(QueueName::Orchestration, 1).await.unwrap();
        assert_eq!(registry.worker_count(QueueName::Orchestration).await, 1);

        registry.stop_all().await;
        assert_eq!(registry.worker_count(QueueName::Orchestration).await, 0);
    }
}
