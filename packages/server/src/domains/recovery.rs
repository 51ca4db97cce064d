//! Dead-letter recovery jobs, running on the single-attempt dlq-recovery
//! queue.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::kernel::jobs::recovery::{RecoveryAction, RecoveryWorker};
use crate::kernel::jobs::{HandlerRegistry, JobContext};
use crate::kernel::ServerDeps;

pub const JOB_NAME: &str = "dlq.recover";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryJob {
    #[serde(flatten)]
    pub action: RecoveryAction,
}

pub fn register(registry: &mut HandlerRegistry) {
    registry.register::<RecoveryJob, _, _>(JOB_NAME, |job, _ctx, deps| async move {
        run_recovery(job, &deps).await
    });
}

async fn run_recovery(job: RecoveryJob, deps: &Arc<ServerDeps>) -> Result<()> {
    let worker = RecoveryWorker::new(
        deps.dead_letter.clone(),
        deps.job_manager.clone(),
        deps.failure_sink.clone(),
        deps.admin_notification_channel.clone(),
    );
    worker.run(job.action).await?;
    Ok(())
}
