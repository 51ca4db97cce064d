// Kernel - core infrastructure with dependency injection
//
// The kernel hosts the job-execution backbone: KV coordination, queues,
// workers, the cron scheduler, autoscaler, health monitor, alerter and
// progress bus. External collaborators are injected through traits.
//
// IMPORTANT: Kernel is for INFRASTRUCTURE only, not business logic.
// Business logic belongs in domain layers.

pub mod alerter;
pub mod autoscaler;
pub mod collaborators;
pub mod deps;
pub mod health;
pub mod jobs;
pub mod kv;
pub mod progress;
pub mod runtime;
pub mod scheduler;
pub mod test_dependencies;
pub mod testing;
pub mod traits;

pub use alerter::{AlertPolicy, FailureAlerter};
pub use autoscaler::{ScaleAction, ScalePolicy, ScalingDecision, WorkerAutoscaler};
pub use deps::ServerDeps;
pub use health::{WorkerHealthMonitor, WorkerHealthReport, WorkerStatus};
pub use kv::{InMemoryKvClient, KvClient, RedisKvClient};
pub use progress::{ProgressBus, ProgressEvent, ProgressStage};
pub use runtime::Runtime;
pub use scheduler::{CronScheduler, TaskRunOutcome, TaskStatusReport};
pub use test_dependencies::{
    MockChatClient, MockEmbeddingService, MockExecutionStore, MockFailureSink, MockOrchestrator,
};
pub use traits::*;
