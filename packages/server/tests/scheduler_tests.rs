//! Cron mutual exclusion across two scheduler instances sharing one
//! coordination store (the two-process scenario, in-process).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use server_core::kernel::scheduler::{CronScheduler, TaskRunOutcome};
use server_core::kernel::testing::test_deps;
use server_core::kernel::KvClient;

const TASK: &str = "refresh-analytics-views";

fn two_instances() -> (
    Arc<CronScheduler>,
    Arc<CronScheduler>,
    Arc<server_core::kernel::InMemoryKvClient>,
    Arc<AtomicUsize>,
) {
    let (deps, mocks) = test_deps();
    let runs = Arc::new(AtomicUsize::new(0));

    let a = Arc::new(CronScheduler::new(mocks.kv.clone(), deps.clone()));
    let b = Arc::new(CronScheduler::new(mocks.kv.clone(), deps));

    for scheduler in [&a, &b] {
        let seen = runs.clone();
        scheduler.register(TASK, "0 0 * * * *", move |_deps| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                // Hold the lock long enough for the loser to observe it
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(())
            }
        });
    }

    (a, b, mocks.kv, runs)
}

// S4 - both instances observe the same tick; exactly one handler runs.
#[tokio::test]
async fn same_tick_runs_exactly_once_across_instances() {
    let (a, b, _kv, runs) = two_instances();

    let (ra, rb) = tokio::join!(a.run_task(TASK), b.run_task(TASK));
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    let winners = [&ra, &rb]
        .iter()
        .filter(|o| matches!(o, TaskRunOutcome::Completed { .. }))
        .count();
    let skipped = [&ra, &rb]
        .iter()
        .filter(|o| matches!(o, TaskRunOutcome::Skipped))
        .count();

    assert_eq!(winners, 1, "exactly one instance must win the lock");
    assert_eq!(skipped, 1, "the other must skip silently");
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

// S4 continued - the winner dies mid-run; after the lock TTL elapses,
// either instance may run the task again.
#[tokio::test]
async fn dead_winner_lock_expires_and_releases_the_task() {
    let (a, b, kv, runs) = two_instances();

    // Simulate instance A acquiring the lock and crashing before release
    assert!(kv
        .set_nx_ex(
            &format!("cron:lock:{TASK}"),
            a.instance_id(),
            Duration::from_secs(3600),
        )
        .await
        .unwrap());

    assert_eq!(b.run_task(TASK).await.unwrap(), TaskRunOutcome::Skipped);
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    // One hour later the lease is gone
    kv.advance(Duration::from_secs(3601));

    assert!(matches!(
        b.run_task(TASK).await.unwrap(),
        TaskRunOutcome::Completed { .. }
    ));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

// Sequential ticks alternate freely: the lock never outlives a run.
#[tokio::test]
async fn sequential_ticks_do_not_starve_either_instance() {
    let (a, b, _kv, runs) = two_instances();

    for _ in 0..3 {
        assert!(matches!(
            a.run_task(TASK).await.unwrap(),
            TaskRunOutcome::Completed { .. }
        ));
        assert!(matches!(
            b.run_task(TASK).await.unwrap(),
            TaskRunOutcome::Completed { .. }
        ));
    }

    assert_eq!(runs.load(Ordering::SeqCst), 6);

    // Both instances contributed to the shared history
    let history = a.history(TASK, 50).await.unwrap();
    assert_eq!(history.len(), 6);
    let instances: std::collections::HashSet<String> =
        history.iter().map(|e| e.instance.clone()).collect();
    assert_eq!(instances.len(), 2);
}
