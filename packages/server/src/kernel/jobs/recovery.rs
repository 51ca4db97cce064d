//! Dead-letter recovery worker.
//!
//! Periodically drains the dead-letter store: transient failures are
//! re-enqueued onto their original queue after a backoff, permanent ones
//! are aggregated into one admin notification, and entries past the
//! retention window are swept by the cleanup action.
//!
//! Classification is message-pattern based. Downstream errors should
//! ideally carry machine-readable codes; the regexes remain the fallback
//! for untyped errors and are covered by an explicit test matrix.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::Utc;
use lazy_static::lazy_static;
use regex::RegexSet;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::dead_letter::DeadLetterStore;
use super::job::{DeadLetterEntry, JobOptions};
use super::manager::JobManager;
use crate::kernel::traits::BaseFailureSink;

/// Floor of the retry backoff ladder.
const BACKOFF_BASE: Duration = Duration::from_secs(5 * 60);
/// Ceiling of the retry backoff ladder.
const BACKOFF_CAP: Duration = Duration::from_secs(6 * 60 * 60);
/// Default retention before cleanup, in hours.
pub const DEFAULT_RETENTION_HOURS: u64 = 168;

lazy_static! {
    static ref RETRYABLE: RegexSet = RegexSet::new([
        r"(?i)timeout|timed out",
        r"(?i)rate limit|too many requests|\b429\b",
        r"(?i)\b(502|503|504)\b|temporarily unavailable|service unavailable",
        r"(?i)econnrefused|econnreset|etimedout|epipe|socket hang up",
        r"(?i)connection (refused|reset|closed|aborted)|network|dns",
        r"(?i)handler crashed",
    ])
    .expect("retryable patterns must compile");
    static ref AUTHENTICATION: RegexSet = RegexSet::new([
        r"(?i)\b401\b|unauthorized|unauthenticated|authentication|invalid (api key|token|credentials)",
    ])
    .expect("authentication patterns must compile");
    static ref PERMISSION: RegexSet = RegexSet::new([
        r"(?i)\b403\b|forbidden|permission denied|access denied|not authorized",
    ])
    .expect("permission patterns must compile");
    static ref QUOTA: RegexSet = RegexSet::new([
        r"(?i)quota|budget|usage limit|insufficient credits|payment required|\b402\b",
    ])
    .expect("quota patterns must compile");
    static ref INVALID_INPUT: RegexSet = RegexSet::new([
        r"(?i)invalid|validation|malformed|bad request|\b400\b|unprocessable",
    ])
    .expect("invalid-input patterns must compile");
    static ref NOT_FOUND: RegexSet = RegexSet::new([
        r"(?i)not found|\b404\b|does not exist|no such",
    ])
    .expect("not-found patterns must compile");
}

/// Label attached to permanent failures in the admin notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermanentReason {
    AuthenticationError,
    PermissionError,
    QuotaExceeded,
    InvalidInput,
    NotFound,
    Unclassified,
}

impl PermanentReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermanentReason::AuthenticationError => "authentication_error",
            PermanentReason::PermissionError => "permission_error",
            PermanentReason::QuotaExceeded => "quota_exceeded",
            PermanentReason::InvalidInput => "invalid_input",
            PermanentReason::NotFound => "not_found",
            PermanentReason::Unclassified => "unclassified",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Retryable,
    Permanent(PermanentReason),
}

/// Classify a failure message.
///
/// Retryable requires a transient pattern match AND no non-retryable match;
/// anything else is permanent. Unmatched messages are permanent too - an
/// unknown failure must reach an operator instead of looping forever.
pub fn classify_failure(reason: &str) -> FailureClass {
    if AUTHENTICATION.is_match(reason) {
        return FailureClass::Permanent(PermanentReason::AuthenticationError);
    }
    if PERMISSION.is_match(reason) {
        return FailureClass::Permanent(PermanentReason::PermissionError);
    }
    if QUOTA.is_match(reason) {
        return FailureClass::Permanent(PermanentReason::QuotaExceeded);
    }
    if INVALID_INPUT.is_match(reason) {
        return FailureClass::Permanent(PermanentReason::InvalidInput);
    }
    if NOT_FOUND.is_match(reason) {
        return FailureClass::Permanent(PermanentReason::NotFound);
    }
    if RETRYABLE.is_match(reason) {
        return FailureClass::Retryable;
    }
    FailureClass::Permanent(PermanentReason::Unclassified)
}

/// Minimum wait before retrying an entry that failed `attempts` times:
/// 5 min tripling per attempt, capped at 6 hours.
pub fn retry_backoff(attempts: u32) -> Duration {
    let factor = 3u64.saturating_pow(attempts.saturating_sub(1).min(6));
    BACKOFF_CAP.min(BACKOFF_BASE * factor as u32)
}

/// Action carried by one recovery job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RecoveryAction {
    ProcessBatch { limit: usize },
    ProcessSingle { job_id: Uuid },
    Cleanup { age_hours: u64 },
}

/// What one recovery run did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    pub processed: usize,
    /// (original job id, new job id) pairs re-enqueued on their queue.
    pub retried: Vec<(Uuid, Uuid)>,
    /// Permanent failures grouped into the admin notification.
    pub notified: Vec<(Uuid, PermanentReason)>,
    /// Entries still inside their backoff window.
    pub waiting_backoff: usize,
    /// Entries removed by cleanup.
    pub cleaned: usize,
}

/// Drains the dead-letter store. Runs on the `dlq-recovery` queue with a
/// single attempt - the retry mechanism must never retry itself.
pub struct RecoveryWorker {
    dead_letter: Arc<DeadLetterStore>,
    manager: Arc<JobManager>,
    failure_sink: Arc<dyn BaseFailureSink>,
    admin_channel: String,
}

impl RecoveryWorker {
    pub fn new(
        dead_letter: Arc<DeadLetterStore>,
        manager: Arc<JobManager>,
        failure_sink: Arc<dyn BaseFailureSink>,
        admin_channel: impl Into<String>,
    ) -> Self {
        Self {
            dead_letter,
            manager,
            failure_sink,
            admin_channel: admin_channel.into(),
        }
    }

    pub async fn run(&self, action: RecoveryAction) -> Result<RecoveryReport> {
        match action {
            RecoveryAction::ProcessBatch { limit } => self.process_batch(limit).await,
            RecoveryAction::ProcessSingle { job_id } => self.process_single(job_id).await,
            RecoveryAction::Cleanup { age_hours } => self.cleanup(age_hours).await,
        }
    }

    /// Drain up to `limit` entries through classify -> backoff -> retry.
    pub async fn process_batch(&self, limit: usize) -> Result<RecoveryReport> {
        let entries = self.dead_letter.peek(limit).await?;
        let mut report = RecoveryReport::default();
        let mut permanent: Vec<(DeadLetterEntry, PermanentReason)> = Vec::new();

        for entry in entries {
            report.processed += 1;
            self.process_entry(entry, &mut report, &mut permanent).await;
        }

        self.notify_permanent(&permanent).await;
        info!(
            processed = report.processed,
            retried = report.retried.len(),
            notified = report.notified.len(),
            waiting_backoff = report.waiting_backoff,
            "recovery batch finished"
        );
        Ok(report)
    }

    /// Run the same pipeline for exactly one entry (operator CLI).
    pub async fn process_single(&self, job_id: Uuid) -> Result<RecoveryReport> {
        let entry = self
            .dead_letter
            .find(job_id)
            .await?
            .ok_or_else(|| anyhow!("no dead-letter entry for job {job_id}"))?;

        let mut report = RecoveryReport {
            processed: 1,
            ..Default::default()
        };
        let mut permanent = Vec::new();
        self.process_entry(entry, &mut report, &mut permanent).await;
        self.notify_permanent(&permanent).await;
        Ok(report)
    }

    /// Remove entries older than `age_hours`.
    pub async fn cleanup(&self, age_hours: u64) -> Result<RecoveryReport> {
        let removed = self
            .dead_letter
            .remove_older_than(Duration::from_secs(age_hours * 3600))
            .await?;
        info!(removed, age_hours, "dead-letter cleanup finished");
        Ok(RecoveryReport {
            cleaned: removed,
            ..Default::default()
        })
    }

    async fn process_entry(
        &self,
        entry: DeadLetterEntry,
        report: &mut RecoveryReport,
        permanent: &mut Vec<(DeadLetterEntry, PermanentReason)>,
    ) {
        match classify_failure(&entry.failed_reason) {
            FailureClass::Retryable => {
                let waited = entry.age(Utc::now()).to_std().unwrap_or(Duration::ZERO);
                if waited < retry_backoff(entry.attempts_made) {
                    report.waiting_backoff += 1;
                    return;
                }

                match self
                    .manager
                    .enqueue(
                        entry.original_queue,
                        &entry.name,
                        entry.payload.clone(),
                        JobOptions::default(),
                    )
                    .await
                {
                    Ok(result) => {
                        let new_id = result.job_id();
                        info!(
                            original_job = %entry.job_id,
                            new_job = %new_id,
                            queue = %entry.original_queue,
                            "dead-letter entry re-enqueued"
                        );
                        report.retried.push((entry.job_id, new_id));
                        if let Err(e) = self.dead_letter.remove(entry.job_id).await {
                            warn!(job_id = %entry.job_id, error = %e, "failed to drop recovered entry");
                        }
                    }
                    Err(e) => {
                        warn!(job_id = %entry.job_id, error = %e, "re-enqueue failed");
                        report
                            .notified
                            .push((entry.job_id, PermanentReason::Unclassified));
                        permanent.push((entry, PermanentReason::Unclassified));
                    }
                }
            }
            FailureClass::Permanent(reason) => {
                report.notified.push((entry.job_id, reason));
                if let Err(e) = self.dead_letter.remove(entry.job_id).await {
                    warn!(job_id = %entry.job_id, error = %e, "failed to drop permanent entry");
                }
                permanent.push((entry, reason));
            }
        }
    }

    /// One aggregated notification per run, grouped by reason label.
    async fn notify_permanent(&self, permanent: &[(DeadLetterEntry, PermanentReason)]) {
        if permanent.is_empty() {
            return;
        }

        let mut text = format!(
            "Dead-letter recovery: {} job(s) failed permanently\n",
            permanent.len()
        );
        for (entry, reason) in permanent {
            text.push_str(&format!(
                "- [{}] {} on `{}` (job {}): {}\n",
                reason.as_str(),
                entry.name,
                entry.original_queue,
                entry.job_id,
                entry.failed_reason,
            ));
        }

        if let Err(e) = self
            .failure_sink
            .notify(&self.admin_channel, &text, None, None, None)
            .await
        {
            warn!(error = %e, "failed to dispatch recovery notification");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_messages_are_retryable() {
        for message in [
            "Read timeout contacting upstream",
            "request timed out after 30s",
            "ECONNREFUSED peer",
            "ECONNRESET by remote",
            "connection reset by peer",
            "429 Too Many Requests",
            "rate limit exceeded, retry later",
            "503 Service Unavailable",
            "upstream temporarily unavailable",
            "DNS resolution failed",
            "socket hang up",
            "handler crashed",
        ] {
            assert_eq!(
                classify_failure(message),
                FailureClass::Retryable,
                "expected retryable: {message}"
            );
        }
    }

    #[test]
    fn non_retryable_messages_get_specific_reasons() {
        let cases = [
            ("401 Unauthorized", PermanentReason::AuthenticationError),
            ("invalid API key provided", PermanentReason::AuthenticationError),
            ("403 Forbidden", PermanentReason::PermissionError),
            ("permission denied for channel", PermanentReason::PermissionError),
            ("monthly quota exhausted", PermanentReason::QuotaExceeded),
            ("organization budget exceeded", PermanentReason::QuotaExceeded),
            ("invalid payload for notifications.send", PermanentReason::InvalidInput),
            ("400 Bad Request", PermanentReason::InvalidInput),
            ("channel not found", PermanentReason::NotFound),
            ("404 document does not exist", PermanentReason::NotFound),
        ];

        for (message, expected) in cases {
            assert_eq!(
                classify_failure(message),
                FailureClass::Permanent(expected),
                "message: {message}"
            );
        }
    }

    #[test]
    fn non_retryable_wins_over_transient_wording() {
        // Mentions a timeout but is fundamentally an auth failure
        assert_eq!(
            classify_failure("401 Unauthorized after connection timeout"),
            FailureClass::Permanent(PermanentReason::AuthenticationError)
        );
    }

    #[test]
    fn unmatched_messages_are_permanent_unclassified() {
        assert_eq!(
            classify_failure("something inexplicable happened"),
            FailureClass::Permanent(PermanentReason::Unclassified)
        );
    }

    #[test]
    fn backoff_triples_from_five_minutes_and_caps_at_six_hours() {
        assert_eq!(retry_backoff(1), Duration::from_secs(5 * 60));
        assert_eq!(retry_backoff(2), Duration::from_secs(15 * 60));
        assert_eq!(retry_backoff(3), Duration::from_secs(45 * 60));
        assert_eq!(retry_backoff(4), Duration::from_secs(135 * 60));
        assert_eq!(retry_backoff(5), Duration::from_secs(6 * 60 * 60));
        assert_eq!(retry_backoff(20), Duration::from_secs(6 * 60 * 60));
    }

    #[test]
    fn recovery_action_json_shape() {
        let action: RecoveryAction =
            serde_json::from_str(r#"{"action": "process_batch", "limit": 25}"#).unwrap();
        assert!(matches!(action, RecoveryAction::ProcessBatch { limit: 25 }));

        let cleanup: RecoveryAction =
            serde_json::from_str(r#"{"action": "cleanup", "age_hours": 168}"#).unwrap();
        assert!(matches!(cleanup, RecoveryAction::Cleanup { age_hours: 168 }));
    }
}
