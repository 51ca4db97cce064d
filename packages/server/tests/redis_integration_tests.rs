//! Redis-backed integration tests.
//!
//! These exercise the production KV client and queue against a real store
//! via testcontainers. They are ignored by default; run them with
//! `cargo test -- --ignored` on a machine with Docker.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use testcontainers_modules::redis::Redis;
use testcontainers_modules::testcontainers::runners::AsyncRunner;
use testcontainers_modules::testcontainers::ContainerAsync;

use server_core::kernel::jobs::dead_letter::DeadLetterStore;
use server_core::kernel::jobs::redis_queue::RedisJobQueue;
use server_core::kernel::jobs::{FailOutcome, JobOptions, JobQueue, JobStatus, QueueName};
use server_core::kernel::kv::{KvClient, RedisKvClient};

async fn redis_fixture() -> (ContainerAsync<Redis>, String) {
    let container = Redis::default()
        .start()
        .await
        .expect("docker must be available for ignored integration tests");
    let port = container
        .get_host_port_ipv4(6379)
        .await
        .expect("mapped redis port");
    (container, format!("redis://127.0.0.1:{port}"))
}

async fn queue_fixture(url: &str, name: QueueName) -> RedisJobQueue {
    let kv: Arc<dyn KvClient> = Arc::new(RedisKvClient::connect(url).await.unwrap());
    let dead_letter = Arc::new(DeadLetterStore::new(kv));
    let manager = redis::Client::open(url)
        .unwrap()
        .get_connection_manager()
        .await
        .unwrap();
    RedisJobQueue::new(name.default_config(), manager, dead_letter)
}

#[tokio::test]
#[ignore = "requires docker"]
async fn kv_roundtrip_and_scripted_primitives() {
    let (_container, url) = redis_fixture().await;
    let kv = RedisKvClient::connect(&url).await.unwrap();

    kv.set_ex("k", "v", Duration::from_secs(60)).await.unwrap();
    assert_eq!(kv.get("k").await.unwrap(), Some("v".to_string()));
    assert!(kv.del("k").await.unwrap());
    assert_eq!(kv.get("k").await.unwrap(), None);

    assert_eq!(kv.incr("counter").await.unwrap(), 1);
    assert_eq!(kv.incr("counter").await.unwrap(), 2);
    assert!(kv.expire("counter", Duration::from_secs(300)).await.unwrap());

    assert_eq!(kv.hincrby("h", "processed", 2).await.unwrap(), 2);
    let all = kv.hgetall("h").await.unwrap();
    assert_eq!(all.get("processed"), Some(&"2".to_string()));

    kv.lpush("list", "a").await.unwrap();
    kv.lpush("list", "b").await.unwrap();
    assert_eq!(kv.lrange("list", 0, -1).await.unwrap(), vec!["b", "a"]);
    kv.ltrim("list", 0, 0).await.unwrap();
    assert_eq!(kv.lrange("list", 0, -1).await.unwrap(), vec!["b"]);

    // set-if-absent with TTL
    assert!(kv
        .set_nx_ex("lock", "me", Duration::from_secs(60))
        .await
        .unwrap());
    assert!(!kv
        .set_nx_ex("lock", "other", Duration::from_secs(60))
        .await
        .unwrap());

    // delete-if-equals only releases the holder's value
    assert!(!kv.del_if_equals("lock", "other").await.unwrap());
    assert!(kv.del_if_equals("lock", "me").await.unwrap());
}

#[tokio::test]
#[ignore = "requires docker"]
async fn queue_enqueue_claim_complete_roundtrip() {
    let (_container, url) = redis_fixture().await;
    let queue = queue_fixture(&url, QueueName::Notifications).await;

    let job = queue
        .enqueue("notifications.send", json!({"event_id": "evt-1"}), JobOptions::default())
        .await
        .unwrap();

    let claimed = queue.claim("worker-1").await.unwrap().unwrap();
    assert_eq!(claimed.id, job.id);
    assert_eq!(claimed.status, JobStatus::Active);
    assert!(queue.claim("worker-2").await.unwrap().is_none());

    queue.renew_lease(job.id).await.unwrap();
    queue.complete(job.id).await.unwrap();

    let stored = queue.get(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Completed);

    let counts = queue.job_counts().await.unwrap();
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.active, 0);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn queue_claims_highest_priority_first() {
    let (_container, url) = redis_fixture().await;
    let queue = queue_fixture(&url, QueueName::Webhooks).await;

    let low = queue
        .enqueue("webhooks.route", json!({}), JobOptions::builder().priority(9u8).build())
        .await
        .unwrap();
    let high = queue
        .enqueue("webhooks.route", json!({}), JobOptions::builder().priority(1u8).build())
        .await
        .unwrap();

    assert_eq!(queue.claim("w").await.unwrap().unwrap().id, high.id);
    assert_eq!(queue.claim("w").await.unwrap().unwrap().id, low.id);
}

#[tokio::test]
#[ignore = "requires docker"]
async fn exhausted_job_lands_in_the_dead_letter_store() {
    let (_container, url) = redis_fixture().await;

    let kv: Arc<dyn KvClient> = Arc::new(RedisKvClient::connect(&url).await.unwrap());
    let dead_letter = Arc::new(DeadLetterStore::new(kv.clone()));
    let manager = redis::Client::open(url.as_str())
        .unwrap()
        .get_connection_manager()
        .await
        .unwrap();
    let queue = RedisJobQueue::new(
        QueueName::Orchestration.default_config(),
        manager,
        dead_letter.clone(),
    );

    let job = queue
        .enqueue("orchestration.run", json!({"request": "x"}), JobOptions::default())
        .await
        .unwrap();
    assert_eq!(job.attempt_cap, 2);

    queue.claim("w").await.unwrap().unwrap();
    let first = queue.fail(job.id, "ECONNREFUSED peer").await.unwrap();
    assert!(matches!(first, FailOutcome::Retrying { .. }));

    // Wait out the 1s retry backoff, then fail the final attempt
    tokio::time::sleep(Duration::from_millis(1200)).await;
    queue.claim("w").await.unwrap().unwrap();
    let second = queue.fail(job.id, "ECONNREFUSED peer").await.unwrap();
    assert!(matches!(second, FailOutcome::DeadLettered { attempts_made: 2 }));

    let entries = dead_letter.peek(10).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].original_queue, QueueName::Orchestration);
    assert_eq!(entries[0].failed_reason, "ECONNREFUSED peer");
}
