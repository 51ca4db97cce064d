//! Key-value client for distributed coordination.
//!
//! A minimal façade over the coordination store: leases, dedup index,
//! counters, heartbeats, progress snapshots and bounded history lists all
//! live here. Queue internals use the store through their own keys; this
//! client only exposes the operations the cross-cutting services need.
//!
//! Two implementations:
//! - [`RedisKvClient`] - production, over a multiplexed connection manager
//! - [`InMemoryKvClient`] - tests and single-process development

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

/// Atomic "set if absent with TTL". Returns 1 when the key was set.
const SET_NX_EX_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[2])
  return 1
end
return 0
"#;

/// Atomic "delete if value equals expected". Returns 1 when deleted.
const DEL_IF_EQUALS_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Coordination-store operations used by the core.
///
/// All methods surface store failures as errors to the caller; none of them
/// swallow connectivity problems. Implementations must be safe for
/// concurrent use.
#[async_trait]
pub trait KvClient: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
    async fn del(&self, key: &str) -> Result<bool>;
    /// Atomic increment; creates the key at 0 first when absent.
    async fn incr(&self, key: &str) -> Result<i64>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;
    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;
    async fn lpush(&self, key: &str, value: &str) -> Result<i64>;
    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;
    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<()>;
    /// Scripted set-if-absent-with-TTL. Returns true when this caller won.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;
    /// Scripted compare-and-delete. Returns true when the key held `expected`.
    async fn del_if_equals(&self, key: &str, expected: &str) -> Result<bool>;
}

// ============================================================================
// Redis implementation
// ============================================================================

/// Redis-backed [`KvClient`] over a multiplexed connection manager.
///
/// The connection manager reconnects transparently; individual command
/// failures still surface to callers so they can degrade or retry.
#[derive(Clone)]
pub struct RedisKvClient {
    manager: ConnectionManager,
    set_nx_ex: redis::Script,
    del_if_equals: redis::Script,
}

impl RedisKvClient {
    /// Connect to the store at `redis_url`.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .with_context(|| format!("invalid redis url: {redis_url}"))?;
        let manager = client
            .get_connection_manager()
            .await
            .context("failed to connect to redis")?;

        Ok(Self {
            manager,
            set_nx_ex: redis::Script::new(SET_NX_EX_SCRIPT),
            del_if_equals: redis::Script::new(DEL_IF_EQUALS_SCRIPT),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

#[async_trait]
impl KvClient for RedisKvClient {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = self.conn().get(key).await?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let () = self
            .conn()
            .set_ex(key, value, ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let removed: i64 = self.conn().del(key).await?;
        Ok(removed > 0)
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let value: i64 = self.conn().incr(key, 1).await?;
        Ok(value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let set: bool = self.conn().expire(key, ttl.as_secs().max(1) as i64).await?;
        Ok(set)
    }

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let value: i64 = self.conn().hincr(key, field, delta).await?;
        Ok(value)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let map: HashMap<String, String> = self.conn().hgetall(key).await?;
        Ok(map)
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<i64> {
        let len: i64 = self.conn().lpush(key, value).await?;
        Ok(len)
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let values: Vec<String> = self.conn().lrange(key, start, stop).await?;
        Ok(values)
    }

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<()> {
        let () = self.conn().ltrim(key, start, stop).await?;
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn();
        let won: i64 = self
            .set_nx_ex
            .key(key)
            .arg(value)
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;
        Ok(won == 1)
    }

    async fn del_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        let mut conn = self.conn();
        let deleted: i64 = self
            .del_if_equals
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }
}

// ============================================================================
// In-memory implementation
// ============================================================================

enum Value {
    Str(String),
    List(VecDeque<String>),
    Hash(HashMap<String, i64>),
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

/// In-memory [`KvClient`] with per-key TTL semantics.
///
/// Used by tests and single-process development. [`InMemoryKvClient::advance`]
/// shifts the client's clock forward so TTL expiry can be exercised without
/// sleeping.
#[derive(Default)]
pub struct InMemoryKvClient {
    entries: Mutex<HashMap<String, Entry>>,
    clock_offset: Mutex<Duration>,
}

impl InMemoryKvClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shift the client's notion of "now" forward (test helper).
    pub fn advance(&self, by: Duration) {
        let mut offset = self.clock_offset.lock().unwrap_or_else(|e| e.into_inner());
        *offset += by;
    }

    fn now(&self) -> Instant {
        let offset = *self.clock_offset.lock().unwrap_or_else(|e| e.into_inner());
        Instant::now() + offset
    }

    /// Drop the entry when its TTL has elapsed, then run `f` on what remains.
    fn with_live_entry<T>(
        &self,
        key: &str,
        f: impl FnOnce(Option<&mut Entry>) -> T,
    ) -> T {
        let now = self.now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        let expired = entries
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| at <= now);
        if expired {
            entries.remove(key);
        }

        f(entries.get_mut(key))
    }

    fn insert(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let expires_at = ttl.map(|ttl| self.now() + ttl);
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.to_string(), Entry { value, expires_at });
    }
}

#[async_trait]
impl KvClient for InMemoryKvClient {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.with_live_entry(key, |entry| match entry {
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Some(s.clone()),
            _ => None,
        }))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.insert(key, Value::Str(value.to_string()), Some(ttl));
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let existed = self.with_live_entry(key, |entry| entry.is_some());
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
        Ok(existed)
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let now = self.now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        let expired = entries
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| at <= now);
        if expired {
            entries.remove(key);
        }

        let entry = entries.entry(key.to_string()).or_insert(Entry {
            value: Value::Str("0".to_string()),
            expires_at: None,
        });
        let current: i64 = match &entry.value {
            Value::Str(s) => s.parse().unwrap_or(0),
            _ => anyhow::bail!("key {key} holds a non-counter value"),
        };
        let next = current + 1;
        entry.value = Value::Str(next.to_string());
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = self.now();
        Ok(self.with_live_entry(key, |entry| match entry {
            Some(e) => {
                e.expires_at = Some(now + ttl);
                true
            }
            None => false,
        }))
    }

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries.entry(key.to_string()).or_insert(Entry {
            value: Value::Hash(HashMap::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::Hash(map) => {
                let slot = map.entry(field.to_string()).or_insert(0);
                *slot += delta;
                Ok(*slot)
            }
            _ => anyhow::bail!("key {key} holds a non-hash value"),
        }
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        Ok(self.with_live_entry(key, |entry| match entry {
            Some(Entry {
                value: Value::Hash(map),
                ..
            }) => map
                .iter()
                .map(|(k, v)| (k.clone(), v.to_string()))
                .collect(),
            _ => HashMap::new(),
        }))
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<i64> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries.entry(key.to_string()).or_insert(Entry {
            value: Value::List(VecDeque::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::List(list) => {
                list.push_front(value.to_string());
                Ok(list.len() as i64)
            }
            _ => anyhow::bail!("key {key} holds a non-list value"),
        }
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        Ok(self.with_live_entry(key, |entry| match entry {
            Some(Entry {
                value: Value::List(list),
                ..
            }) => {
                let len = list.len() as isize;
                let norm = |i: isize| -> isize {
                    if i < 0 {
                        (len + i).max(0)
                    } else {
                        i.min(len)
                    }
                };
                let start = norm(start) as usize;
                let stop = norm(stop) as usize;
                list.iter()
                    .skip(start)
                    .take(stop.saturating_sub(start) + 1)
                    .cloned()
                    .collect()
            }
            _ => Vec::new(),
        }))
    }

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<()> {
        self.with_live_entry(key, |entry| {
            if let Some(Entry {
                value: Value::List(list),
                ..
            }) = entry
            {
                let len = list.len() as isize;
                let norm = |i: isize| -> isize {
                    if i < 0 {
                        (len + i).max(0)
                    } else {
                        i.min(len)
                    }
                };
                let start = norm(start) as usize;
                let stop = norm(stop) as usize;
                let kept: VecDeque<String> = list
                    .iter()
                    .skip(start)
                    .take(stop.saturating_sub(start) + 1)
                    .cloned()
                    .collect();
                *list = kept;
            }
        });
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        // Atomic like the Lua script: check and set under one lock
        let now = self.now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        let live = match entries.get(key) {
            Some(entry) => entry.expires_at.map(|at| at > now).unwrap_or(true),
            None => false,
        };
        if live {
            return Ok(false);
        }

        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn del_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        // Atomic like the Lua script: compare and delete under one lock
        let now = self.now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        let matches = match entries.get(key) {
            Some(Entry {
                value: Value::Str(s),
                expires_at,
            }) => expires_at.map(|at| at > now).unwrap_or(true) && s == expected,
            _ => false,
        };
        if !matches {
            return Ok(false);
        }

        entries.remove(key);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_ex_then_get_roundtrips() {
        let kv = InMemoryKvClient::new();
        kv.set_ex("k", "v", Duration::from_secs(60)).await.unwrap();

        assert_eq!(kv.get("k").await.unwrap(), Some("v".to_string()));
    }

    #[tokio::test]
    async fn expired_keys_are_gone() {
        let kv = InMemoryKvClient::new();
        kv.set_ex("k", "v", Duration::from_secs(60)).await.unwrap();

        kv.advance(Duration::from_secs(61));

        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn incr_starts_at_one() {
        let kv = InMemoryKvClient::new();

        assert_eq!(kv.incr("counter").await.unwrap(), 1);
        assert_eq!(kv.incr("counter").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn incr_after_window_expiry_starts_fresh() {
        let kv = InMemoryKvClient::new();
        kv.incr("counter").await.unwrap();
        kv.expire("counter", Duration::from_secs(300)).await.unwrap();
        kv.advance(Duration::from_secs(301));

        assert_eq!(kv.incr("counter").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn set_nx_ex_only_first_caller_wins() {
        let kv = InMemoryKvClient::new();

        assert!(kv
            .set_nx_ex("lock", "instance-a", Duration::from_secs(3600))
            .await
            .unwrap());
        assert!(!kv
            .set_nx_ex("lock", "instance-b", Duration::from_secs(3600))
            .await
            .unwrap());
        assert_eq!(kv.get("lock").await.unwrap(), Some("instance-a".to_string()));
    }

    #[tokio::test]
    async fn set_nx_ex_succeeds_after_ttl_expiry() {
        let kv = InMemoryKvClient::new();
        kv.set_nx_ex("lock", "instance-a", Duration::from_secs(3600))
            .await
            .unwrap();

        kv.advance(Duration::from_secs(3601));

        assert!(kv
            .set_nx_ex("lock", "instance-b", Duration::from_secs(3600))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn del_if_equals_only_releases_own_value() {
        let kv = InMemoryKvClient::new();
        kv.set_nx_ex("lock", "instance-a", Duration::from_secs(3600))
            .await
            .unwrap();

        assert!(!kv.del_if_equals("lock", "instance-b").await.unwrap());
        assert!(kv.del_if_equals("lock", "instance-a").await.unwrap());
        assert_eq!(kv.get("lock").await.unwrap(), None);
    }

    #[tokio::test]
    async fn lpush_lrange_ltrim_behave_like_a_bounded_list() {
        let kv = InMemoryKvClient::new();
        for i in 0..5 {
            kv.lpush("history", &i.to_string()).await.unwrap();
        }

        // Newest first
        let all = kv.lrange("history", 0, -1).await.unwrap();
        assert_eq!(all, vec!["4", "3", "2", "1", "0"]);

        kv.ltrim("history", 0, 2).await.unwrap();
        let trimmed = kv.lrange("history", 0, -1).await.unwrap();
        assert_eq!(trimmed, vec!["4", "3", "2"]);
    }

    #[tokio::test]
    async fn hincrby_accumulates_per_field() {
        let kv = InMemoryKvClient::new();

        assert_eq!(kv.hincrby("metrics", "processed", 1).await.unwrap(), 1);
        assert_eq!(kv.hincrby("metrics", "processed", 2).await.unwrap(), 3);
        assert_eq!(kv.hincrby("metrics", "failed", 1).await.unwrap(), 1);

        let all = kv.hgetall("metrics").await.unwrap();
        assert_eq!(all.get("processed"), Some(&"3".to_string()));
        assert_eq!(all.get("failed"), Some(&"1".to_string()));
    }
}
