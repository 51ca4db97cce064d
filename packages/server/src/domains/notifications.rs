//! Notifications: send exactly one chat message per event.
//!
//! The enqueue-side dedup index is the first barrier against double-sends;
//! the send-side `notification:sent:{event}` marker is the last one, so
//! re-deliveries from retries become no-ops even when the dedup key was
//! not set by the caller.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::kernel::jobs::{HandlerRegistry, JobContext};
use crate::kernel::kv::KvClient;
use crate::kernel::ServerDeps;

pub const JOB_NAME: &str = "notifications.send";

/// One send is allowed per event id within this window.
const SENT_MARKER_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationJob {
    pub event_id: String,
    pub organization_id: Uuid,
    pub user_id: Option<Uuid>,
    pub channel: String,
    pub text: String,
    pub thread_ts: Option<String>,
    /// When set, update this message in place instead of posting a new one.
    pub update_ts: Option<String>,
}

pub fn register(registry: &mut HandlerRegistry) {
    registry.register::<NotificationJob, _, _>(JOB_NAME, |job, ctx, deps| async move {
        send_notification(job, ctx, &deps).await
    });
}

async fn send_notification(
    job: NotificationJob,
    _ctx: JobContext,
    deps: &Arc<ServerDeps>,
) -> Result<()> {
    let marker = format!("notification:sent:{}", job.event_id);

    let acquired = deps
        .kv
        .set_nx_ex(&marker, "1", SENT_MARKER_TTL)
        .await
        .context("failed to check sent marker")?;
    if !acquired {
        debug!(event_id = %job.event_id, "duplicate notification suppressed");
        return Ok(());
    }

    let send_result = match &job.update_ts {
        Some(ts) => deps
            .chat
            .update_message(&job.channel, ts, &job.text, None)
            .await
            .map(|()| ts.clone()),
        None => {
            deps.chat
                .post_message(&job.channel, &job.text, None, job.thread_ts.as_deref())
                .await
        }
    };

    match send_result {
        Ok(ts) => {
            info!(event_id = %job.event_id, channel = %job.channel, ts = %ts, "notification sent");
            Ok(())
        }
        Err(e) => {
            // Release the marker so a retry can actually send
            let _ = deps.kv.del(&marker).await;
            Err(e)
        }
    }
}
