//! Per-queue failure-rate alerter.
//!
//! Keeps a sliding-window failure counter per queue in the KV. The window
//! TTL starts on the first increment and is never refreshed; when the count
//! crosses the threshold one critical alert is dispatched and the counter
//! keeps accumulating until the window expires.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, warn};

use super::jobs::queue::QueueName;
use super::kv::KvClient;
use super::traits::BaseFailureSink;

/// Threshold and window for one queue.
#[derive(Debug, Clone, Copy)]
pub struct AlertPolicy {
    pub max_failures: u32,
    pub window: Duration,
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self {
            max_failures: 5,
            window: Duration::from_secs(300),
        }
    }
}

/// Sliding-window failure counter with one alert per crossing.
pub struct FailureAlerter {
    kv: Arc<dyn KvClient>,
    sink: Arc<dyn BaseFailureSink>,
    admin_channel: String,
    default_policy: AlertPolicy,
    overrides: HashMap<QueueName, AlertPolicy>,
}

impl FailureAlerter {
    pub fn new(
        kv: Arc<dyn KvClient>,
        sink: Arc<dyn BaseFailureSink>,
        admin_channel: impl Into<String>,
    ) -> Self {
        Self {
            kv,
            sink,
            admin_channel: admin_channel.into(),
            default_policy: AlertPolicy::default(),
            overrides: HashMap::new(),
        }
    }

    /// Override the default policy for one queue.
    pub fn with_policy(mut self, queue: QueueName, policy: AlertPolicy) -> Self {
        self.overrides.insert(queue, policy);
        self
    }

    fn policy(&self, queue: QueueName) -> AlertPolicy {
        self.overrides
            .get(&queue)
            .copied()
            .unwrap_or(self.default_policy)
    }

    /// Record one failure. Dispatches a critical alert when the count within
    /// the current window reaches the queue's threshold.
    pub async fn record_failure(&self, queue: QueueName, representative_error: &str) -> Result<()> {
        let policy = self.policy(queue);
        let key = counter_key(queue);

        let count = self.kv.incr(&key).await?;
        if count == 1 {
            // First failure opens the window; the TTL is never refreshed
            self.kv.expire(&key, policy.window).await?;
        }

        if count == policy.max_failures as i64 {
            error!(
                queue = %queue,
                count,
                window_secs = policy.window.as_secs(),
                error = %representative_error,
                "failure threshold crossed"
            );
            let text = format!(
                ":rotating_light: queue `{queue}` recorded {count} failures within {}s. Latest: {representative_error}",
                policy.window.as_secs(),
            );
            if let Err(e) = self
                .sink
                .notify(&self.admin_channel, &text, None, None, None)
                .await
            {
                warn!(queue = %queue, error = %e, "failed to dispatch failure alert");
            }
        }

        Ok(())
    }

    /// Current failure count within the window (0 when the window expired).
    pub async fn failure_count(&self, queue: QueueName) -> Result<i64> {
        let raw = self.kv.get(&counter_key(queue)).await?;
        Ok(raw.and_then(|v| v.parse().ok()).unwrap_or(0))
    }
}

fn counter_key(queue: QueueName) -> String {
    format!("errors:{queue}:count")
}
