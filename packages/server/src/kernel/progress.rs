//! Per-job progress bus.
//!
//! In-process pub/sub keyed by `{tenant}:{job}` topics, with a tenant-wide
//! fan-out topic for UI consumers. Every update is also persisted as a KV
//! snapshot under a short TTL so late subscribers can read the last-known
//! value.
//!
//! Producers (worker handlers):
//!   bus.update(&kv, org, job_id, ProgressStage::Processing, "crunching").await;
//!
//! Consumers (SSE endpoints, chat-status subscribers):
//!   let rx = bus.subscribe_job(org, job_id).await;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use super::kv::KvClient;

/// Snapshot TTL: late subscribers can reconstruct state for two hours.
const SNAPSHOT_TTL: Duration = Duration::from_secs(2 * 60 * 60);

/// Coarse progress label emitted once per worker checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    Started,
    Validated,
    Processing,
    Finalizing,
    Completed,
    Failed,
}

impl ProgressStage {
    /// Conventional percent for each stage.
    pub fn default_percent(&self) -> u8 {
        match self {
            ProgressStage::Started => 5,
            ProgressStage::Validated => 20,
            ProgressStage::Processing => 50,
            ProgressStage::Finalizing => 80,
            ProgressStage::Completed => 100,
            ProgressStage::Failed => 0,
        }
    }

    /// Whether this stage ends the job's progress sequence.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressStage::Completed | ProgressStage::Failed)
    }
}

/// Progress event published to subscribers and streamed to the tenant channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: Uuid,
    pub stage: ProgressStage,
    pub percent: u8,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// In-process progress pub/sub hub.
///
/// Thread-safe, cloneable. Topic channels are created on first subscribe
/// and publish is a no-op for topics nobody listens to.
#[derive(Clone)]
pub struct ProgressBus {
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<ProgressEvent>>>>,
    capacity: usize,
}

impl ProgressBus {
    /// Create a new bus with default capacity (256 events per channel).
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    fn job_topic(organization_id: Uuid, job_id: Uuid) -> String {
        format!("progress:{organization_id}:{job_id}")
    }

    fn tenant_topic(organization_id: Uuid) -> String {
        format!("progress:{organization_id}")
    }

    /// Publish a progress event and persist its KV snapshot.
    ///
    /// Percent is clamped to [0, 100]. Snapshot write failures are reported
    /// to the caller; the in-process publish always happens first so live
    /// subscribers are not starved by a flaky store.
    pub async fn publish(
        &self,
        kv: &dyn KvClient,
        organization_id: Uuid,
        event: ProgressEvent,
    ) -> anyhow::Result<()> {
        let event = ProgressEvent {
            percent: event.percent.min(100),
            ..event
        };

        {
            let channels = self.channels.read().await;
            if let Some(tx) = channels.get(&Self::job_topic(organization_id, event.job_id)) {
                let _ = tx.send(event.clone());
            }
            if let Some(tx) = channels.get(&Self::tenant_topic(organization_id)) {
                let _ = tx.send(event.clone());
            }
        }

        let snapshot = serde_json::to_string(&event)?;
        kv.set_ex(
            &format!("progress:{}", event.job_id),
            &snapshot,
            SNAPSHOT_TTL,
        )
        .await
    }

    /// Publish a stage update using the stage's conventional percent.
    pub async fn update(
        &self,
        kv: &dyn KvClient,
        organization_id: Uuid,
        job_id: Uuid,
        stage: ProgressStage,
        message: impl Into<String>,
    ) -> anyhow::Result<()> {
        self.publish(
            kv,
            organization_id,
            ProgressEvent {
                job_id,
                stage,
                percent: stage.default_percent(),
                message: message.into(),
                timestamp: Utc::now(),
                metadata: None,
            },
        )
        .await
    }

    /// Subscribe to one job's progress stream.
    pub async fn subscribe_job(
        &self,
        organization_id: Uuid,
        job_id: Uuid,
    ) -> broadcast::Receiver<ProgressEvent> {
        self.subscribe_topic(Self::job_topic(organization_id, job_id))
            .await
    }

    /// Subscribe to every job's progress within a tenant (UI fan-out).
    pub async fn subscribe_tenant(
        &self,
        organization_id: Uuid,
    ) -> broadcast::Receiver<ProgressEvent> {
        self.subscribe_topic(Self::tenant_topic(organization_id))
            .await
    }

    async fn subscribe_topic(&self, topic: String) -> broadcast::Receiver<ProgressEvent> {
        let mut channels = self.channels.write().await;
        let tx = channels
            .entry(topic)
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        tx.subscribe()
    }

    /// Last-known progress for a job, from the KV snapshot.
    pub async fn last_known(
        &self,
        kv: &dyn KvClient,
        job_id: Uuid,
    ) -> anyhow::Result<Option<ProgressEvent>> {
        let raw = kv.get(&format!("progress:{job_id}")).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Remove channels with zero subscribers (housekeeping).
    pub async fn cleanup(&self) {
        let mut channels = self.channels.write().await;
        channels.retain(|_, tx| tx.receiver_count() > 0);
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}
