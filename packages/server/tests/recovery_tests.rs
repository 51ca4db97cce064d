//! Dead-letter recovery scenarios: classification, backoff, single-entry
//! recovery and retention cleanup.

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use server_core::kernel::jobs::job::{DeadLetterEntry, Job, JobOptions};
use server_core::kernel::jobs::recovery::RecoveryWorker;
use server_core::kernel::jobs::{JobQueue, QueueName};
use server_core::kernel::testing::{test_deps, TestMocks};

fn recovery_worker(
    deps: &std::sync::Arc<server_core::kernel::ServerDeps>,
    mocks: &TestMocks,
) -> RecoveryWorker {
    RecoveryWorker::new(
        mocks.dead_letter.clone(),
        mocks.manager.clone(),
        mocks.failure_sink.clone(),
        deps.admin_notification_channel.clone(),
    )
}

fn entry_on(queue: QueueName, reason: &str, minutes_ago: i64) -> DeadLetterEntry {
    let job = Job::new(
        queue,
        "orchestration.run",
        json!({"request": "x"}),
        JobOptions::default(),
        2,
    );
    let mut entry = DeadLetterEntry::from_job(&job, reason);
    entry.attempts_made = 1;
    entry.enqueued_at = Utc::now() - chrono::Duration::minutes(minutes_ago);
    entry
}

// S3 - a transient failure past its backoff is re-enqueued on its original
// queue; an auth failure is reported under authentication_error.
#[tokio::test]
async fn batch_classifies_transient_and_permanent_failures() {
    let (deps, mocks) = test_deps();
    let worker = recovery_worker(&deps, &mocks);

    let transient = entry_on(QueueName::Orchestration, "Read timeout contacting upstream", 10);
    let permanent = entry_on(QueueName::Orchestration, "401 Unauthorized", 10);
    mocks.dead_letter.push(&transient).await.unwrap();
    mocks.dead_letter.push(&permanent).await.unwrap();

    let report = worker.process_batch(10).await.unwrap();

    assert_eq!(report.processed, 2);
    assert_eq!(report.retried.len(), 1);
    let (original, new_id) = report.retried[0];
    assert_eq!(original, transient.job_id);
    assert_ne!(new_id, transient.job_id);

    // The transient entry is back on its original queue
    let counts = mocks
        .queue(QueueName::Orchestration)
        .job_counts()
        .await
        .unwrap();
    assert_eq!(counts.waiting, 1);

    // The permanent one went into the aggregated admin notification
    assert_eq!(report.notified.len(), 1);
    assert_eq!(report.notified[0].1.as_str(), "authentication_error");
    assert_eq!(mocks.failure_sink.notification_count(), 1);
    let text = mocks.failure_sink.last_text().unwrap();
    assert!(text.contains("authentication_error"));
    assert!(text.contains("401 Unauthorized"));

    // Both entries left the store (one retried, one reported)
    assert_eq!(mocks.dead_letter.len().await.unwrap(), 0);
}

// Entries still inside their backoff window are left alone.
#[tokio::test]
async fn backoff_window_defers_fresh_failures() {
    let (deps, mocks) = test_deps();
    let worker = recovery_worker(&deps, &mocks);

    // One attempt requires a 5-minute wait; this failed 1 minute ago
    let fresh = entry_on(QueueName::Webhooks, "connection reset by peer", 1);
    mocks.dead_letter.push(&fresh).await.unwrap();

    let report = worker.process_batch(10).await.unwrap();

    assert_eq!(report.waiting_backoff, 1);
    assert!(report.retried.is_empty());
    assert_eq!(mocks.dead_letter.len().await.unwrap(), 1);

    let counts = mocks.queue(QueueName::Webhooks).job_counts().await.unwrap();
    assert_eq!(counts.waiting, 0);
}

#[tokio::test]
async fn process_single_recovers_one_entry_by_id() {
    let (deps, mocks) = test_deps();
    let worker = recovery_worker(&deps, &mocks);

    let target = entry_on(QueueName::Indexing, "503 Service Unavailable", 20);
    let other = entry_on(QueueName::Indexing, "503 Service Unavailable", 20);
    mocks.dead_letter.push(&target).await.unwrap();
    mocks.dead_letter.push(&other).await.unwrap();

    let report = worker.process_single(target.job_id).await.unwrap();

    assert_eq!(report.processed, 1);
    assert_eq!(report.retried.len(), 1);
    assert_eq!(report.retried[0].0, target.job_id);
    // The other entry is untouched
    assert_eq!(mocks.dead_letter.len().await.unwrap(), 1);
}

#[tokio::test]
async fn process_single_unknown_id_errors() {
    let (deps, mocks) = test_deps();
    let worker = recovery_worker(&deps, &mocks);

    assert!(worker.process_single(Uuid::new_v4()).await.is_err());
}

#[tokio::test]
async fn cleanup_sweeps_entries_past_retention() {
    let (deps, mocks) = test_deps();
    let worker = recovery_worker(&deps, &mocks);

    let ancient = entry_on(QueueName::ChatEvents, "whatever", 200 * 60);
    let recent = entry_on(QueueName::ChatEvents, "whatever", 60);
    mocks.dead_letter.push(&ancient).await.unwrap();
    mocks.dead_letter.push(&recent).await.unwrap();

    let report = worker.cleanup(168).await.unwrap();

    assert_eq!(report.cleaned, 1);
    assert_eq!(mocks.dead_letter.len().await.unwrap(), 1);
    assert_eq!(
        mocks.dead_letter.peek(10).await.unwrap()[0].job_id,
        recent.job_id
    );
}
