//! Worker autoscaler.
//!
//! Watches queue depth and decides a desired worker count per queue under
//! min/max bounds with a cooldown between actions. The autoscaler only
//! decides; the runtime applies targets by scaling worker instances.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::jobs::queue::{JobQueue, QueueName};
use super::kv::KvClient;

/// Decision history per queue is bounded...
const HISTORY_LIMIT: isize = 100;
/// ...and expires after a day of inactivity.
const HISTORY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Bounds and thresholds for one queue.
#[derive(Debug, Clone, Copy)]
pub struct ScalePolicy {
    pub min_workers: usize,
    pub max_workers: usize,
    pub scale_up_threshold: usize,
    pub scale_down_threshold: usize,
    pub step: usize,
    pub cooldown: Duration,
}

impl Default for ScalePolicy {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 10,
            scale_up_threshold: 50,
            scale_down_threshold: 5,
            step: 1,
            cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleAction {
    ScaleUp,
    ScaleDown,
    None,
}

/// One evaluation's outcome, recorded in the per-queue history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingDecision {
    pub queue: QueueName,
    pub action: ScaleAction,
    pub current: usize,
    pub target: usize,
    pub queue_depth: usize,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

struct QueueScaleState {
    desired: usize,
    last_action_at: Option<tokio::time::Instant>,
}

struct ScaledQueue {
    queue: Arc<dyn JobQueue>,
    policy: ScalePolicy,
}

/// Depth-driven scaling decisions with per-queue cooldown.
pub struct WorkerAutoscaler {
    kv: Arc<dyn KvClient>,
    queues: HashMap<QueueName, ScaledQueue>,
    state: Mutex<HashMap<QueueName, QueueScaleState>>,
    eval_interval: Duration,
}

impl WorkerAutoscaler {
    pub fn new(kv: Arc<dyn KvClient>) -> Self {
        Self {
            kv,
            queues: HashMap::new(),
            state: Mutex::new(HashMap::new()),
            eval_interval: Duration::from_secs(30),
        }
    }

    /// Put a queue under autoscaler control.
    pub fn add_queue(mut self, queue: Arc<dyn JobQueue>, policy: ScalePolicy) -> Self {
        self.queues
            .insert(queue.name(), ScaledQueue { queue, policy });
        self
    }

    pub fn with_eval_interval(mut self, interval: Duration) -> Self {
        self.eval_interval = interval;
        self
    }

    pub fn eval_interval(&self) -> Duration {
        self.eval_interval
    }

    pub fn scaled_queues(&self) -> Vec<QueueName> {
        self.queues.keys().copied().collect()
    }

    /// Current desired worker count for a queue.
    pub fn desired(&self, queue: QueueName) -> usize {
        let min = self
            .queues
            .get(&queue)
            .map(|s| s.policy.min_workers)
            .unwrap_or(1);
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&queue)
            .map(|s| s.desired)
            .unwrap_or(min)
    }

    /// Evaluate one queue and record the decision.
    pub async fn evaluate(&self, queue_name: QueueName) -> Result<ScalingDecision> {
        let Some(scaled) = self.queues.get(&queue_name) else {
            bail!("queue {queue_name} is not under autoscaler control")
        };
        let policy = scaled.policy;
        let depth = scaled.queue.waiting_count().await?;
        let now = tokio::time::Instant::now();

        let decision = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let entry = state.entry(queue_name).or_insert(QueueScaleState {
                desired: policy.min_workers,
                last_action_at: None,
            });

            let in_cooldown = entry
                .last_action_at
                .map(|last| now.duration_since(last) < policy.cooldown)
                .unwrap_or(false);

            if in_cooldown {
                ScalingDecision {
                    queue: queue_name,
                    action: ScaleAction::None,
                    current: entry.desired,
                    target: entry.desired,
                    queue_depth: depth,
                    reason: "cooldown active".to_string(),
                    timestamp: Utc::now(),
                }
            } else if depth >= policy.scale_up_threshold && entry.desired < policy.max_workers {
                let current = entry.desired;
                let target = (current + policy.step).min(policy.max_workers);
                entry.desired = target;
                entry.last_action_at = Some(now);
                ScalingDecision {
                    queue: queue_name,
                    action: ScaleAction::ScaleUp,
                    current,
                    target,
                    queue_depth: depth,
                    reason: format!(
                        "queue depth {depth} >= {}",
                        policy.scale_up_threshold
                    ),
                    timestamp: Utc::now(),
                }
            } else if depth <= policy.scale_down_threshold && entry.desired > policy.min_workers {
                let current = entry.desired;
                let target = current.saturating_sub(policy.step).max(policy.min_workers);
                entry.desired = target;
                entry.last_action_at = Some(now);
                ScalingDecision {
                    queue: queue_name,
                    action: ScaleAction::ScaleDown,
                    current,
                    target,
                    queue_depth: depth,
                    reason: format!(
                        "queue depth {depth} <= {}",
                        policy.scale_down_threshold
                    ),
                    timestamp: Utc::now(),
                }
            } else {
                ScalingDecision {
                    queue: queue_name,
                    action: ScaleAction::None,
                    current: entry.desired,
                    target: entry.desired,
                    queue_depth: depth,
                    reason: "within thresholds".to_string(),
                    timestamp: Utc::now(),
                }
            }
        };

        if decision.action != ScaleAction::None {
            info!(
                queue = %queue_name,
                action = ?decision.action,
                current = decision.current,
                target = decision.target,
                depth = decision.queue_depth,
                "scaling decision"
            );
        }

        if let Err(e) = self.record(&decision).await {
            warn!(queue = %queue_name, error = %e, "failed to record scaling decision");
        }

        Ok(decision)
    }

    /// Evaluate every controlled queue.
    pub async fn evaluate_all(&self) -> Result<Vec<ScalingDecision>> {
        let mut decisions = Vec::with_capacity(self.queues.len());
        for name in self.queues.keys().copied() {
            decisions.push(self.evaluate(name).await?);
        }
        Ok(decisions)
    }

    async fn record(&self, decision: &ScalingDecision) -> Result<()> {
        let key = history_key(decision.queue);
        self.kv
            .lpush(&key, &serde_json::to_string(decision)?)
            .await?;
        self.kv.ltrim(&key, 0, HISTORY_LIMIT - 1).await?;
        self.kv.expire(&key, HISTORY_TTL).await?;
        Ok(())
    }

    /// Recent decisions for a queue, newest first.
    pub async fn history(&self, queue: QueueName, limit: usize) -> Result<Vec<ScalingDecision>> {
        let raw = self
            .kv
            .lrange(&history_key(queue), 0, limit.saturating_sub(1) as isize)
            .await?;
        let mut decisions = Vec::with_capacity(raw.len());
        for item in raw {
            match serde_json::from_str(&item) {
                Ok(decision) => decisions.push(decision),
                Err(e) => warn!(queue = %queue, error = %e, "skipping malformed scaling record"),
            }
        }
        Ok(decisions)
    }
}

fn history_key(queue: QueueName) -> String {
    format!("autoscaler:history:{queue}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::jobs::job::JobOptions;
    use crate::kernel::testing::test_deps;
    use serde_json::json;

    fn policy() -> ScalePolicy {
        ScalePolicy {
            min_workers: 1,
            max_workers: 5,
            scale_up_threshold: 10,
            scale_down_threshold: 2,
            step: 1,
            cooldown: Duration::from_secs(60),
        }
    }

    async fn seed_jobs(queue: &Arc<dyn JobQueue>, n: usize) {
        for _ in 0..n {
            queue
                .enqueue("tick", json!({}), JobOptions::default())
                .await
                .unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn scale_up_then_cooldown_then_scale_up_again() {
        let (_deps, mocks) = test_deps();
        let queue = mocks.queue(QueueName::Orchestration);
        let autoscaler =
            WorkerAutoscaler::new(mocks.kv.clone()).add_queue(queue.clone(), policy());

        seed_jobs(&queue, 15).await;

        let first = autoscaler.evaluate(QueueName::Orchestration).await.unwrap();
        assert_eq!(first.action, ScaleAction::ScaleUp);
        assert_eq!(first.current, 1);
        assert_eq!(first.target, 2);

        let second = autoscaler.evaluate(QueueName::Orchestration).await.unwrap();
        assert_eq!(second.action, ScaleAction::None);
        assert_eq!(second.reason, "cooldown active");
        assert_eq!(autoscaler.desired(QueueName::Orchestration), 2);

        tokio::time::advance(Duration::from_secs(61)).await;

        let third = autoscaler.evaluate(QueueName::Orchestration).await.unwrap();
        assert_eq!(third.action, ScaleAction::ScaleUp);
        assert_eq!(third.target, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn scale_down_when_idle_and_above_min() {
        let (_deps, mocks) = test_deps();
        let queue = mocks.queue(QueueName::Webhooks);
        let autoscaler =
            WorkerAutoscaler::new(mocks.kv.clone()).add_queue(queue.clone(), policy());

        // Climb to 3 workers
        seed_jobs(&queue, 12).await;
        autoscaler.evaluate(QueueName::Webhooks).await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        autoscaler.evaluate(QueueName::Webhooks).await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(autoscaler.desired(QueueName::Webhooks), 3);

        // Drain the queue below the scale-down threshold
        while queue.claim("drain").await.unwrap().is_some() {}

        let decision = autoscaler.evaluate(QueueName::Webhooks).await.unwrap();
        assert_eq!(decision.action, ScaleAction::ScaleDown);
        assert_eq!(decision.target, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn never_scales_past_bounds() {
        let (_deps, mocks) = test_deps();
        let queue = mocks.queue(QueueName::Indexing);
        let mut tight = policy();
        tight.max_workers = 2;
        let autoscaler =
            WorkerAutoscaler::new(mocks.kv.clone()).add_queue(queue.clone(), tight);

        seed_jobs(&queue, 100).await;

        autoscaler.evaluate(QueueName::Indexing).await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        let at_max = autoscaler.evaluate(QueueName::Indexing).await.unwrap();
        assert_eq!(at_max.action, ScaleAction::None);
        assert_eq!(at_max.reason, "within thresholds");
        assert_eq!(autoscaler.desired(QueueName::Indexing), 2);

        // Min bound: empty queue, already at min
        let (_deps2, mocks2) = test_deps();
        let idle_queue = mocks2.queue(QueueName::Indexing);
        let idle = WorkerAutoscaler::new(mocks2.kv.clone()).add_queue(idle_queue, policy());
        let decision = idle.evaluate(QueueName::Indexing).await.unwrap();
        assert_eq!(decision.action, ScaleAction::None);
        assert_eq!(decision.target, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn decisions_are_recorded_in_history() {
        let (_deps, mocks) = test_deps();
        let queue = mocks.queue(QueueName::Orchestration);
        let autoscaler =
            WorkerAutoscaler::new(mocks.kv.clone()).add_queue(queue.clone(), policy());

        seed_jobs(&queue, 15).await;
        autoscaler.evaluate(QueueName::Orchestration).await.unwrap();
        autoscaler.evaluate(QueueName::Orchestration).await.unwrap();

        let history = autoscaler
            .history(QueueName::Orchestration, 10)
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
        // Newest first
        assert_eq!(history[0].action, ScaleAction::None);
        assert_eq!(history[1].action, ScaleAction::ScaleUp);
    }

    #[tokio::test]
    async fn uncontrolled_queue_errors() {
        let (_deps, mocks) = test_deps();
        let autoscaler = WorkerAutoscaler::new(mocks.kv.clone());
        assert!(autoscaler.evaluate(QueueName::Orchestration).await.is_err());
    }
}
