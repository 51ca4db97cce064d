//! Handler registry for dispatching claimed jobs.
//!
//! Maps job names (e.g. "notifications.send") to deserializing async
//! handlers. Each domain registers its handlers at startup; the worker base
//! claims jobs and dispatches through the registry without knowing concrete
//! payload types.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::job::Job;
use super::queue::QueueName;
use crate::common::TenantContext;
use crate::kernel::deps::ServerDeps;

/// Per-invocation context handed to a handler alongside its payload.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: Uuid,
    pub queue: QueueName,
    /// 1-based attempt number for this invocation.
    pub attempt: u32,
    /// Effective attempt cap; `attempt == attempt_cap` is the final try.
    pub attempt_cap: u32,
    pub tenant: TenantContext,
    /// Cancelled on shutdown or when the job's timeout elapses. Handlers
    /// must stop cleanly; the worker never kills handler tasks.
    pub cancel: CancellationToken,
}

impl JobContext {
    pub fn for_job(job: &Job, cancel: CancellationToken) -> Self {
        Self {
            job_id: job.id,
            queue: job.queue,
            attempt: job.attempts_made + 1,
            attempt_cap: job.attempt_cap,
            tenant: TenantContext::from_payload(&job.payload),
            cancel,
        }
    }
}

type BoxedHandler = Box<
    dyn Fn(
            serde_json::Value,
            JobContext,
            Arc<ServerDeps>,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send>>
        + Send
        + Sync,
>;

/// Registry mapping job names to handlers.
///
/// # Example
///
/// ```ignore
/// let mut registry = HandlerRegistry::new();
/// registry.register::<SendNotificationJob, _, _>(
///     "notifications.send",
///     |job, ctx, deps| async move { send_notification(job, ctx, &deps).await },
/// );
/// ```
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, BoxedHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for `job_name`.
    ///
    /// The payload is deserialized to `P` before the handler runs; payloads
    /// that do not parse fail the job without invoking the handler.
    pub fn register<P, F, Fut>(&mut self, job_name: &'static str, handler: F)
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(P, JobContext, Arc<ServerDeps>) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let boxed: BoxedHandler = Box::new(move |value, ctx, deps| {
            let handler = handler.clone();
            Box::pin(async move {
                let payload: P = serde_json::from_value(value)
                    .map_err(|e| anyhow!("invalid payload for {job_name}: {e}"))?;
                handler(payload, ctx, deps).await
            })
        });

        self.handlers.insert(job_name, boxed);
    }

    /// Build the (already pinned) handler future for a claimed job.
    ///
    /// The future is returned rather than awaited so the worker can spawn
    /// it and treat a panic as a handler crash instead of dying with it.
    pub fn prepare(
        &self,
        job: &Job,
        ctx: JobContext,
        deps: Arc<ServerDeps>,
    ) -> Result<Pin<Box<dyn Future<Output = Result<()>> + Send>>> {
        let handler = self
            .handlers
            .get(job.name.as_str())
            .ok_or_else(|| anyhow!("no handler registered for job {}", job.name))?;

        Ok(handler(job.payload.clone(), ctx, deps))
    }

    pub fn is_registered(&self, job_name: &str) -> bool {
        self.handlers.contains_key(job_name)
    }

    pub fn registered_names(&self) -> Vec<&'static str> {
        self.handlers.keys().copied().collect()
    }
}

/// Thread-safe registry wrapped in Arc.
pub type SharedHandlerRegistry = Arc<HandlerRegistry>;
