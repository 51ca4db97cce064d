//! Chat-event ingress: validate and fan out to orchestration.

use std::sync::Arc;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::kernel::jobs::{HandlerRegistry, JobContext, JobOptions, QueueName};
use crate::kernel::progress::ProgressStage;
use crate::kernel::ServerDeps;

use super::orchestration::OrchestrationJob;

pub const JOB_NAME: &str = "chat_events.ingest";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatEventJob {
    pub event_id: String,
    pub organization_id: Uuid,
    pub user_id: Option<Uuid>,
    pub channel: String,
    pub text: String,
    pub thread_ts: Option<String>,
    pub event_type: String,
}

pub fn register(registry: &mut HandlerRegistry) {
    registry.register::<ChatEventJob, _, _>(JOB_NAME, |job, ctx, deps| async move {
        ingest_chat_event(job, ctx, &deps).await
    });
}

/// Validate the event and enqueue the orchestration step.
///
/// Deduplicates on the event id so provider re-deliveries within the dedup
/// window fan out exactly once.
async fn ingest_chat_event(
    job: ChatEventJob,
    ctx: JobContext,
    deps: &Arc<ServerDeps>,
) -> Result<()> {
    if job.text.trim().is_empty() {
        bail!("invalid chat event {}: empty text", job.event_id);
    }
    if job.event_type != "message" && job.event_type != "app_mention" {
        bail!(
            "invalid chat event {}: unsupported type {}",
            job.event_id,
            job.event_type
        );
    }

    deps.job_manager
        .update_progress(
            ctx.tenant.organization_id,
            ctx.job_id,
            ProgressStage::Validated,
            20,
            "event validated",
        )
        .await?;

    let orchestration = OrchestrationJob {
        event_id: job.event_id.clone(),
        organization_id: job.organization_id,
        user_id: job.user_id,
        channel: job.channel,
        request: job.text,
        session_id: format!("session-{}", job.event_id),
        thread_ts: job.thread_ts,
    };

    let result = deps
        .job_manager
        .enqueue(
            QueueName::Orchestration,
            super::orchestration::JOB_NAME,
            serde_json::to_value(&orchestration)?,
            JobOptions::builder().dedup_key(job.event_id.clone()).build(),
        )
        .await?;

    debug!(
        event_id = %job.event_id,
        orchestration_job = %result.job_id(),
        deduplicated = !result.is_created(),
        "chat event fanned out"
    );
    Ok(())
}
