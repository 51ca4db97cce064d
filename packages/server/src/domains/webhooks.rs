//! Webhooks: route an inbound provider event to its handler.

use std::sync::Arc;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::kernel::jobs::{HandlerRegistry, JobContext};
use crate::kernel::ServerDeps;

pub const JOB_NAME: &str = "webhooks.route";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookJob {
    pub provider: String,
    pub event_type: String,
    pub organization_id: Uuid,
    pub payload: serde_json::Value,
}

pub fn register(registry: &mut HandlerRegistry) {
    registry.register::<WebhookJob, _, _>(JOB_NAME, |job, ctx, deps| async move {
        route_webhook(job, ctx, &deps).await
    });
}

async fn route_webhook(job: WebhookJob, _ctx: JobContext, deps: &Arc<ServerDeps>) -> Result<()> {
    if job.provider.is_empty() || job.event_type.is_empty() {
        bail!("invalid webhook: provider and event_type are required");
    }

    // Providers are integrated out of core; the route is audited so the
    // integration layer can pick events up from the store.
    deps.execution_store
        .insert_audit_entry(
            job.organization_id,
            &format!("webhook.{}.{}", job.provider, job.event_type),
            job.payload.clone(),
        )
        .await?;

    debug!(
        provider = %job.provider,
        event_type = %job.event_type,
        "webhook routed"
    );
    Ok(())
}
