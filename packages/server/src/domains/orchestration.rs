//! Orchestration: call the LLM-backed collaborator, record the execution,
//! and enqueue the user-facing notification.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::kernel::jobs::{HandlerRegistry, JobContext, JobOptions, QueueName};
use crate::kernel::progress::ProgressStage;
use crate::kernel::traits::{ExecutionRecord, OrchestrationRequest};
use crate::kernel::ServerDeps;

use super::notifications::NotificationJob;

pub const JOB_NAME: &str = "orchestration.run";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationJob {
    pub event_id: String,
    pub organization_id: Uuid,
    pub user_id: Option<Uuid>,
    pub channel: String,
    pub request: String,
    pub session_id: String,
    pub thread_ts: Option<String>,
}

pub fn register(registry: &mut HandlerRegistry) {
    registry.register::<OrchestrationJob, _, _>(JOB_NAME, |job, ctx, deps| async move {
        run_orchestration(job, ctx, &deps).await
    });
}

async fn run_orchestration(
    job: OrchestrationJob,
    ctx: JobContext,
    deps: &Arc<ServerDeps>,
) -> Result<()> {
    let org = ctx.tenant.organization_id;
    let execution_id = Uuid::new_v4();

    deps.execution_store
        .create_execution(ExecutionRecord {
            id: execution_id,
            organization_id: job.organization_id,
            user_id: job.user_id,
            task: JOB_NAME.to_string(),
            status: "running".to_string(),
            started_at: Utc::now(),
        })
        .await?;

    deps.job_manager
        .update_progress(org, ctx.job_id, ProgressStage::Processing, 50, "orchestrating")
        .await?;

    let outcome = match deps
        .orchestrator
        .orchestrate(OrchestrationRequest {
            request: job.request.clone(),
            session_id: job.session_id.clone(),
            organization_id: job.organization_id,
            user_id: job.user_id,
            thread_context: job.thread_ts.as_ref().map(|ts| serde_json::json!({"thread_ts": ts})),
        })
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            deps.execution_store
                .update_execution(execution_id, "failed", None, Some(e.to_string()))
                .await?;

            // The queue retries until the cap; only the final failure
            // produces the user-facing error message.
            if ctx.attempt >= ctx.attempt_cap {
                deps.job_manager
                    .enqueue(
                        QueueName::Notifications,
                        super::notifications::JOB_NAME,
                        serde_json::to_value(NotificationJob {
                            event_id: format!("{}-failed", job.event_id),
                            organization_id: job.organization_id,
                            user_id: job.user_id,
                            channel: job.channel.clone(),
                            text: format!(
                                ":warning: I couldn't finish that request: {e} (ref: {})",
                                job.event_id
                            ),
                            thread_ts: job.thread_ts.clone(),
                            update_ts: None,
                        })?,
                        JobOptions::builder()
                            .dedup_key(format!("{}-failed", job.event_id))
                            .build(),
                    )
                    .await?;
            }
            return Err(e);
        }
    };

    deps.job_manager
        .update_progress(org, ctx.job_id, ProgressStage::Finalizing, 80, "sending result")
        .await?;

    deps.execution_store
        .update_execution(execution_id, "completed", Some(outcome.output.clone()), None)
        .await?;

    // Dedup on the event id so orchestration retries cannot double-send
    deps.job_manager
        .enqueue(
            QueueName::Notifications,
            super::notifications::JOB_NAME,
            serde_json::to_value(NotificationJob {
                event_id: job.event_id.clone(),
                organization_id: job.organization_id,
                user_id: job.user_id,
                channel: job.channel,
                text: outcome.output,
                thread_ts: job.thread_ts,
                update_ts: None,
            })?,
            JobOptions::builder().dedup_key(job.event_id.clone()).build(),
        )
        .await?;

    info!(
        event_id = %job.event_id,
        session_id = %job.session_id,
        model = %outcome.metadata.model,
        category = %outcome.metadata.category,
        "orchestration finished"
    );
    Ok(())
}
