//! Dead-letter store: the terminal holding queue for exhausted jobs.
//!
//! Entries live in a KV list so any instance (workers, the recovery worker,
//! the operator CLI) sees the same view. The store itself never reprocesses
//! anything; the recovery worker drains it and the cleanup action enforces
//! the retention window.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use super::job::DeadLetterEntry;
use crate::kernel::kv::KvClient;

const DEAD_LETTER_KEY: &str = "dlq:entries";

/// Hard cap on retained entries, independent of the age-based retention.
const MAX_ENTRIES: isize = 10_000;

/// KV-backed store of [`DeadLetterEntry`] values.
pub struct DeadLetterStore {
    kv: Arc<dyn KvClient>,
}

impl DeadLetterStore {
    pub fn new(kv: Arc<dyn KvClient>) -> Self {
        Self { kv }
    }

    /// Append an entry. Newest entries sit at the head of the list.
    pub async fn push(&self, entry: &DeadLetterEntry) -> Result<()> {
        let raw = serde_json::to_string(entry)?;
        self.kv.lpush(DEAD_LETTER_KEY, &raw).await?;
        self.kv.ltrim(DEAD_LETTER_KEY, 0, MAX_ENTRIES - 1).await?;
        Ok(())
    }

    /// Read up to `limit` entries, newest first. Unparseable entries are
    /// skipped with a warning rather than poisoning the whole batch.
    pub async fn peek(&self, limit: usize) -> Result<Vec<DeadLetterEntry>> {
        let raw = self
            .kv
            .lrange(DEAD_LETTER_KEY, 0, limit.saturating_sub(1) as isize)
            .await?;

        let mut entries = Vec::with_capacity(raw.len());
        for item in raw {
            match serde_json::from_str(&item) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(error = %e, "skipping malformed dead-letter entry"),
            }
        }
        Ok(entries)
    }

    /// Find the entry for a specific job id.
    pub async fn find(&self, job_id: Uuid) -> Result<Option<DeadLetterEntry>> {
        let all = self.peek(MAX_ENTRIES as usize).await?;
        Ok(all.into_iter().find(|e| e.job_id == job_id))
    }

    /// Remove the entry for `job_id`. Returns true when one was removed.
    ///
    /// The KV exposes no list-delete-by-value, so removal rewrites the list
    /// without the matching entry. The recovery worker is the only writer
    /// that removes, and it runs single-flight, so the rewrite is safe.
    pub async fn remove(&self, job_id: Uuid) -> Result<bool> {
        self.retain(|entry| entry.job_id != job_id).await
    }

    /// Drop entries older than `age`. Returns how many were removed.
    pub async fn remove_older_than(&self, age: Duration) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::from_std(age)?;
        let before = self.len().await?;
        self.retain(|entry| entry.enqueued_at >= cutoff).await?;
        let after = self.len().await?;
        Ok(before.saturating_sub(after))
    }

    pub async fn len(&self) -> Result<usize> {
        Ok(self.kv.lrange(DEAD_LETTER_KEY, 0, -1).await?.len())
    }

    async fn retain(&self, keep: impl Fn(&DeadLetterEntry) -> bool) -> Result<bool> {
        let raw = self.kv.lrange(DEAD_LETTER_KEY, 0, -1).await?;

        let mut kept = Vec::with_capacity(raw.len());
        let mut dropped = false;
        for item in &raw {
            match serde_json::from_str::<DeadLetterEntry>(item) {
                Ok(entry) if keep(&entry) => kept.push(item.clone()),
                Ok(_) => dropped = true,
                Err(_) => dropped = true,
            }
        }

        if !dropped {
            return Ok(false);
        }

        self.kv.del(DEAD_LETTER_KEY).await?;
        // lpush reverses, so push oldest first to preserve newest-first order
        for item in kept.iter().rev() {
            self.kv.lpush(DEAD_LETTER_KEY, item).await?;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::jobs::job::{Job, JobOptions};
    use crate::kernel::jobs::queue::QueueName;
    use crate::kernel::kv::InMemoryKvClient;
    use serde_json::json;

    fn store() -> DeadLetterStore {
        DeadLetterStore::new(Arc::new(InMemoryKvClient::new()))
    }

    fn entry(reason: &str) -> DeadLetterEntry {
        let job = Job::new(
            QueueName::Orchestration,
            "orchestrate",
            json!({"request": "x"}),
            JobOptions::default(),
            2,
        );
        DeadLetterEntry::from_job(&job, reason)
    }

    #[tokio::test]
    async fn push_then_peek_returns_newest_first() {
        let store = store();
        store.push(&entry("first")).await.unwrap();
        store.push(&entry("second")).await.unwrap();

        let entries = store.peek(10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].failed_reason, "second");
        assert_eq!(entries[1].failed_reason, "first");
    }

    #[tokio::test]
    async fn find_locates_entry_by_job_id() {
        let store = store();
        let target = entry("timeout");
        store.push(&entry("other")).await.unwrap();
        store.push(&target).await.unwrap();

        let found = store.find(target.job_id).await.unwrap().unwrap();
        assert_eq!(found.failed_reason, "timeout");

        assert!(store.find(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_drops_only_the_matching_entry() {
        let store = store();
        let target = entry("remove-me");
        store.push(&entry("keep")).await.unwrap();
        store.push(&target).await.unwrap();

        assert!(store.remove(target.job_id).await.unwrap());
        assert_eq!(store.len().await.unwrap(), 1);
        assert!(!store.remove(target.job_id).await.unwrap());
    }

    #[tokio::test]
    async fn remove_older_than_respects_cutoff() {
        let store = store();
        let mut old = entry("ancient");
        old.enqueued_at = Utc::now() - chrono::Duration::hours(200);
        store.push(&old).await.unwrap();
        store.push(&entry("fresh")).await.unwrap();

        let removed = store
            .remove_older_than(Duration::from_secs(168 * 3600))
            .await
            .unwrap();

        assert_eq!(removed, 1);
        let remaining = store.peek(10).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].failed_reason, "fresh");
    }
}
