//! Installations: long-running marketplace installs with a persisted
//! status record.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::kernel::jobs::{HandlerRegistry, JobContext};
use crate::kernel::progress::ProgressStage;
use crate::kernel::traits::ExecutionRecord;
use crate::kernel::ServerDeps;

pub const JOB_NAME: &str = "installations.run";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallationJob {
    pub installation_id: Uuid,
    pub organization_id: Uuid,
    pub user_id: Option<Uuid>,
    /// Marketplace item being installed.
    pub item: String,
}

pub fn register(registry: &mut HandlerRegistry) {
    registry.register::<InstallationJob, _, _>(JOB_NAME, |job, ctx, deps| async move {
        run_installation(job, ctx, &deps).await
    });
}

async fn run_installation(
    job: InstallationJob,
    ctx: JobContext,
    deps: &Arc<ServerDeps>,
) -> Result<()> {
    let org = ctx.tenant.organization_id;

    deps.execution_store
        .create_execution(ExecutionRecord {
            id: job.installation_id,
            organization_id: job.organization_id,
            user_id: job.user_id,
            task: format!("install:{}", job.item),
            status: "running".to_string(),
            started_at: Utc::now(),
        })
        .await?;

    deps.job_manager
        .update_progress(
            org,
            ctx.job_id,
            ProgressStage::Processing,
            50,
            format!("installing {}", job.item),
        )
        .await?;

    // The installer itself is a collaborator; core only tracks the run.
    // Cancellation (uninstall requested mid-run) lands here via the token.
    if ctx.cancel.is_cancelled() {
        deps.execution_store
            .update_execution(
                job.installation_id,
                "cancelled",
                None,
                Some("installation cancelled".to_string()),
            )
            .await?;
        return Ok(());
    }

    deps.job_manager
        .update_progress(org, ctx.job_id, ProgressStage::Finalizing, 80, "finalizing install")
        .await?;

    deps.execution_store
        .update_execution(job.installation_id, "completed", None, None)
        .await?;

    info!(
        installation_id = %job.installation_id,
        item = %job.item,
        "installation finished"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::jobs::QueueName;
    use crate::kernel::testing::test_deps;
    use tokio_util::sync::CancellationToken;

    fn sample_job() -> InstallationJob {
        InstallationJob {
            installation_id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            user_id: None,
            item: "crm-sync".to_string(),
        }
    }

    fn ctx(org: Uuid, cancel: CancellationToken) -> JobContext {
        JobContext {
            job_id: Uuid::new_v4(),
            queue: QueueName::Installations,
            attempt: 1,
            attempt_cap: 3,
            tenant: crate::common::TenantContext::new(org, None),
            cancel,
        }
    }

    #[tokio::test]
    async fn installation_updates_its_status_record() {
        let (deps, mocks) = test_deps();
        let job = sample_job();

        run_installation(
            job.clone(),
            ctx(job.organization_id, CancellationToken::new()),
            &deps,
        )
        .await
        .unwrap();

        assert_eq!(mocks.execution_store.execution_count(), 1);
        let updates = mocks.execution_store.updates.lock().unwrap();
        assert_eq!(updates[0], (job.installation_id, "completed".to_string()));
    }

    #[tokio::test]
    async fn cancelled_installation_is_marked_cancelled() {
        let (deps, mocks) = test_deps();
        let job = sample_job();
        let cancel = CancellationToken::new();
        cancel.cancel();

        run_installation(job.clone(), ctx(job.organization_id, cancel), &deps)
            .await
            .unwrap();

        let updates = mocks.execution_store.updates.lock().unwrap();
        assert_eq!(updates[0], (job.installation_id, "cancelled".to_string()));
    }
}
