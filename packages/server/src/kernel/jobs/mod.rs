//! Job infrastructure: queues, workers, recovery.
//!
//! # Architecture
//!
//! ```text
//! Ingress (chat event, webhook, cron tick, HTTP)
//!     │
//!     └─► JobManager.enqueue()  (dedup, priority, delay)
//!             └─► JobQueue (Redis or in-memory)
//!
//! Worker (per queue)
//!     │
//!     ├─► claim → HandlerRegistry → domain handler
//!     ├─► lease renewal / stalled reclamation
//!     └─► fail → retry with backoff, or DeadLetterStore
//!
//! RecoveryWorker (dlq-recovery queue)
//!     └─► classify → re-enqueue transient / notify permanent / cleanup
//! ```
//!
//! Business logic stays in domains; this module is infrastructure only.

pub mod dead_letter;
pub mod events;
pub mod job;
pub mod manager;
pub mod memory;
pub mod queue;
pub mod recovery;
pub mod redis_queue;
pub mod registry;
pub mod worker;

pub use dead_letter::DeadLetterStore;
pub use events::JobEvent;
pub use job::{DeadLetterEntry, Job, JobOptions, JobStatus};
pub use manager::{JobManager, JobStatusReport};
pub use memory::InMemoryJobQueue;
pub use queue::{
    EnqueueResult, FailOutcome, JobCounts, JobQueue, QueueConfig, QueueName, StalledJob,
};
pub use recovery::{
    classify_failure, FailureClass, PermanentReason, RecoveryAction, RecoveryReport,
    RecoveryWorker,
};
pub use redis_queue::RedisJobQueue;
pub use registry::{HandlerRegistry, JobContext, SharedHandlerRegistry};
pub use worker::{Worker, WorkerRegistry};
