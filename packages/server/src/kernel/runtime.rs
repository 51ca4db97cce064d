//! Process runtime: explicit construction and teardown of the core.
//!
//! Everything the original kept as module-level singletons lives here as
//! explicit references. `start()` brings up workers, the cron scheduler and
//! the autoscaler loop; `shutdown()` stops them in reverse within the
//! configured deadline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::domains;
use crate::kernel::alerter::FailureAlerter;
use crate::kernel::autoscaler::{ScaleAction, ScalePolicy, WorkerAutoscaler};
use crate::kernel::deps::ServerDeps;
use crate::kernel::health::WorkerHealthMonitor;
use crate::kernel::jobs::dead_letter::DeadLetterStore;
use crate::kernel::jobs::manager::JobManager;
use crate::kernel::jobs::memory::InMemoryJobQueue;
use crate::kernel::jobs::queue::{JobQueue, QueueName};
use crate::kernel::jobs::recovery::{RecoveryAction, DEFAULT_RETENTION_HOURS};
use crate::kernel::jobs::redis_queue::RedisJobQueue;
use crate::kernel::jobs::registry::HandlerRegistry;
use crate::kernel::jobs::worker::WorkerRegistry;
use crate::kernel::jobs::JobOptions;
use crate::kernel::kv::{InMemoryKvClient, KvClient, RedisKvClient};
use crate::kernel::progress::ProgressBus;
use crate::kernel::scheduler::CronScheduler;
use crate::kernel::traits::{
    BaseChatClient, BaseEmbeddingService, BaseExecutionStore, BaseFailureSink, BaseOrchestrator,
};

/// External collaborator implementations injected at boot.
pub struct Collaborators {
    pub orchestrator: Arc<dyn BaseOrchestrator>,
    pub chat: Arc<dyn BaseChatClient>,
    pub execution_store: Arc<dyn BaseExecutionStore>,
    pub failure_sink: Arc<dyn BaseFailureSink>,
    pub embedding_service: Arc<dyn BaseEmbeddingService>,
}

/// The assembled core: queues, workers, scheduler, autoscaler, monitors.
pub struct Runtime {
    config: Config,
    deps: Arc<ServerDeps>,
    workers: Arc<WorkerRegistry>,
    scheduler: Arc<CronScheduler>,
    autoscaler: Arc<WorkerAutoscaler>,
    health: Arc<WorkerHealthMonitor>,
    shutdown: CancellationToken,
    background: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    /// Connect to the coordination store and assemble a Redis-backed core.
    pub async fn connect(config: Config, collaborators: Collaborators) -> Result<Self> {
        let kv: Arc<dyn KvClient> = Arc::new(RedisKvClient::connect(&config.redis_url).await?);
        let manager = redis::Client::open(config.redis_url.as_str())?
            .get_connection_manager()
            .await?;

        let dead_letter = Arc::new(DeadLetterStore::new(kv.clone()));
        let mut queues: HashMap<QueueName, Arc<dyn JobQueue>> = HashMap::new();
        for name in QueueName::ALL {
            let mut queue_config = name.default_config();
            if let Some(concurrency) = config.queue_concurrency(name.as_str()) {
                queue_config = queue_config.with_concurrency(concurrency);
            }
            queues.insert(
                name,
                Arc::new(RedisJobQueue::new(
                    queue_config,
                    manager.clone(),
                    dead_letter.clone(),
                )),
            );
        }

        Ok(Self::assemble(config, kv, dead_letter, queues, collaborators))
    }

    /// Assemble an in-memory core (development and tests).
    pub fn in_memory(config: Config, collaborators: Collaborators) -> Self {
        let kv: Arc<dyn KvClient> = Arc::new(InMemoryKvClient::new());
        let dead_letter = Arc::new(DeadLetterStore::new(kv.clone()));

        let mut queues: HashMap<QueueName, Arc<dyn JobQueue>> = HashMap::new();
        for name in QueueName::ALL {
            let mut queue_config = name.default_config();
            if let Some(concurrency) = config.queue_concurrency(name.as_str()) {
                queue_config = queue_config.with_concurrency(concurrency);
            }
            queues.insert(
                name,
                Arc::new(InMemoryJobQueue::new(queue_config, dead_letter.clone())),
            );
        }

        Self::assemble(config, kv, dead_letter, queues, collaborators)
    }

    fn assemble(
        config: Config,
        kv: Arc<dyn KvClient>,
        dead_letter: Arc<DeadLetterStore>,
        queues: HashMap<QueueName, Arc<dyn JobQueue>>,
        collaborators: Collaborators,
    ) -> Self {
        let progress = ProgressBus::new();
        let job_manager = Arc::new(JobManager::new(
            queues.clone(),
            kv.clone(),
            progress.clone(),
        ));

        let deps = Arc::new(ServerDeps::new(
            kv.clone(),
            job_manager,
            dead_letter,
            progress,
            collaborators.orchestrator,
            collaborators.chat,
            collaborators.execution_store,
            collaborators.failure_sink.clone(),
            collaborators.embedding_service,
            config.admin_notification_channel.clone(),
            config.admin_organization_id,
        ));

        let alerter = Arc::new(FailureAlerter::new(
            kv.clone(),
            collaborators.failure_sink,
            config.admin_notification_channel.clone(),
        ));
        let health = Arc::new(WorkerHealthMonitor::with_queues(
            kv.clone(),
            queues.clone(),
        ));

        let mut handlers = HandlerRegistry::new();
        domains::register_all(&mut handlers);

        let workers = Arc::new(WorkerRegistry::new(
            queues.clone(),
            Arc::new(handlers),
            deps.clone(),
            health.clone(),
            alerter,
            Duration::from_secs(config.shutdown_deadline_secs),
        ));

        let mut autoscaler = WorkerAutoscaler::new(kv);
        for name in QueueName::ALL {
            // The recovery queue stays single-flight; everything else scales.
            if name == QueueName::DlqRecovery {
                continue;
            }
            if let Some(queue) = queues.get(&name) {
                autoscaler = autoscaler.add_queue(queue.clone(), ScalePolicy::default());
            }
        }
        let autoscaler = Arc::new(autoscaler);

        let scheduler = Arc::new(CronScheduler::new(deps.kv.clone(), deps.clone()));
        register_default_tasks(&scheduler, &config);

        Self {
            config,
            deps,
            workers,
            scheduler,
            autoscaler,
            health,
            shutdown: CancellationToken::new(),
            background: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn deps(&self) -> Arc<ServerDeps> {
        self.deps.clone()
    }

    pub fn scheduler(&self) -> Arc<CronScheduler> {
        self.scheduler.clone()
    }

    pub fn autoscaler(&self) -> Arc<WorkerAutoscaler> {
        self.autoscaler.clone()
    }

    pub fn health(&self) -> Arc<WorkerHealthMonitor> {
        self.health.clone()
    }

    pub fn workers(&self) -> Arc<WorkerRegistry> {
        self.workers.clone()
    }

    /// Bring up workers, then the scheduler, then the autoscaler loop.
    pub async fn start(&self) -> Result<()> {
        self.workers.start_all().await;
        self.scheduler.start().await?;

        let autoscaler = self.autoscaler.clone();
        let workers = self.workers.clone();
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(autoscaler.eval_interval());
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        match autoscaler.evaluate_all().await {
                            Ok(decisions) => {
                                for decision in decisions {
                                    if decision.action == ScaleAction::None {
                                        continue;
                                    }
                                    if let Err(e) =
                                        workers.scale_to(decision.queue, decision.target).await
                                    {
                                        error!(
                                            queue = %decision.queue,
                                            error = %e,
                                            "failed to apply scaling decision"
                                        );
                                    }
                                }
                            }
                            Err(e) => warn!(error = %e, "autoscaler evaluation failed"),
                        }
                    }
                }
            }
        });
        self.background
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);

        info!("runtime started");
        Ok(())
    }

    /// Stop in reverse order: autoscaler loop, scheduler, workers.
    pub async fn shutdown(&self) -> Result<()> {
        info!("runtime shutting down");
        self.shutdown.cancel();

        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.background.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for handle in handles {
            handle.abort();
        }

        self.scheduler.shutdown().await?;
        self.workers.stop_all().await;

        info!("runtime stopped");
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

/// Register the default scheduled tasks.
///
/// Tasks enqueue jobs instead of doing work inline, so the queue gives them
/// retries and dead-lettering.
fn register_default_tasks(scheduler: &Arc<CronScheduler>, config: &Config) {
    // Hourly analytics refresh
    scheduler.register(
        domains::scheduled::TASK_REFRESH_ANALYTICS,
        "0 0 * * * *",
        |deps| enqueue_scheduled(deps, domains::scheduled::TASK_REFRESH_ANALYTICS),
    );

    // Daily session cleanup at 03:00 UTC
    scheduler.register(
        domains::scheduled::TASK_CLEANUP_SESSIONS,
        "0 0 3 * * *",
        |deps| enqueue_scheduled(deps, domains::scheduled::TASK_CLEANUP_SESSIONS),
    );

    // KV memory check every 15 minutes
    scheduler.register(
        domains::scheduled::TASK_CHECK_KV_MEMORY,
        "0 */15 * * * *",
        |deps| enqueue_scheduled(deps, domains::scheduled::TASK_CHECK_KV_MEMORY),
    );

    // Dead-letter sweep every 30 minutes
    scheduler.register("dlq-recovery-sweep", "0 */30 * * * *", |deps| async move {
        deps.job_manager
            .enqueue(
                QueueName::DlqRecovery,
                domains::recovery::JOB_NAME,
                serde_json::to_value(RecoveryAction::ProcessBatch { limit: 25 })?,
                JobOptions::default(),
            )
            .await?;
        Ok(())
    });

    // Daily retention cleanup
    let retention_hours = (config.backup_retention_days.max(0) as u64) * 24;
    scheduler.register("dlq-cleanup", "0 30 4 * * *", move |deps| async move {
        let age_hours = if retention_hours > 0 {
            retention_hours
        } else {
            DEFAULT_RETENTION_HOURS
        };
        deps.job_manager
            .enqueue(
                QueueName::DlqRecovery,
                domains::recovery::JOB_NAME,
                serde_json::to_value(RecoveryAction::Cleanup { age_hours })?,
                JobOptions::default(),
            )
            .await?;
        Ok(())
    });
}

async fn enqueue_scheduled(deps: Arc<ServerDeps>, task_name: &'static str) -> Result<()> {
    deps.job_manager
        .enqueue(
            QueueName::ScheduledTasks,
            domains::scheduled::JOB_NAME,
            serde_json::to_value(domains::scheduled::ScheduledTaskJob {
                task_name: task_name.to_string(),
            })?,
            // One unit of scheduled work per task per tick
            JobOptions::builder()
                .dedup_key(format!("scheduled:{task_name}"))
                .build(),
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::test_dependencies::{
        MockChatClient, MockEmbeddingService, MockExecutionStore, MockFailureSink,
        MockOrchestrator,
    };

    fn test_config() -> Config {
        Config {
            redis_url: "redis://localhost:6379".to_string(),
            admin_notification_channel: "#ops-alerts".to_string(),
            admin_organization_id: None,
            queue_concurrency_overrides: HashMap::new(),
            backup_retention_days: 7,
            shutdown_deadline_secs: 2,
        }
    }

    fn mock_collaborators() -> Collaborators {
        Collaborators {
            orchestrator: Arc::new(MockOrchestrator::new()),
            chat: Arc::new(MockChatClient::new()),
            execution_store: Arc::new(MockExecutionStore::new()),
            failure_sink: Arc::new(MockFailureSink::new()),
            embedding_service: Arc::new(MockEmbeddingService::new()),
        }
    }

    #[tokio::test]
    async fn runtime_starts_and_stops_cleanly() {
        let runtime = Runtime::in_memory(test_config(), mock_collaborators());

        runtime.start().await.unwrap();
        assert_eq!(
            runtime.workers().worker_count(QueueName::Orchestration).await,
            1
        );

        runtime.shutdown().await.unwrap();
        assert_eq!(
            runtime.workers().worker_count(QueueName::Orchestration).await,
            0
        );
    }

    #[tokio::test]
    async fn default_tasks_are_registered() {
        let runtime = Runtime::in_memory(test_config(), mock_collaborators());

        let status = runtime.scheduler().status().await.unwrap();
        let names: Vec<&str> = status.iter().map(|t| t.name.as_str()).collect();

        assert!(names.contains(&"refresh-analytics-views"));
        assert!(names.contains(&"cleanup-expired-sessions"));
        assert!(names.contains(&"check-kv-memory"));
        assert!(names.contains(&"dlq-recovery-sweep"));
        assert!(names.contains(&"dlq-cleanup"));
    }

    #[tokio::test]
    async fn concurrency_overrides_apply_to_queues() {
        let mut config = test_config();
        config
            .queue_concurrency_overrides
            .insert("orchestration".to_string(), 7);

        let runtime = Runtime::in_memory(config, mock_collaborators());
        let deps = runtime.deps();
        let queue = deps.job_manager.queue(QueueName::Orchestration).unwrap();

        assert_eq!(queue.config().concurrency, 7);
    }
}
