use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::collections::HashMap;
use std::env;
use uuid::Uuid;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    /// Chat channel that receives operator alerts and recovery notifications.
    pub admin_notification_channel: String,
    /// Organization used for system-originated work (scheduled tasks, recovery).
    pub admin_organization_id: Option<Uuid>,
    /// Per-queue worker concurrency overrides (QUEUE_<NAME>_CONCURRENCY).
    pub queue_concurrency_overrides: HashMap<String, usize>,
    /// Dead-letter retention in days before cleanup sweeps entries.
    pub backup_retention_days: i64,
    /// How long graceful shutdown waits for in-flight jobs to drain.
    pub shutdown_deadline_secs: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            admin_notification_channel: env::var("ADMIN_NOTIFICATION_CHANNEL")
                .unwrap_or_else(|_| "#ops-alerts".to_string()),
            admin_organization_id: match env::var("ADMIN_ORGANIZATION_ID") {
                Ok(raw) => Some(
                    raw.parse()
                        .context("ADMIN_ORGANIZATION_ID must be a valid UUID")?,
                ),
                Err(_) => None,
            },
            queue_concurrency_overrides: parse_concurrency_overrides(env::vars()),
            backup_retention_days: env::var("BACKUP_RETENTION_DAYS")
                .unwrap_or_else(|_| "7".to_string())
                .parse()
                .context("BACKUP_RETENTION_DAYS must be a valid number")?,
            shutdown_deadline_secs: env::var("SHUTDOWN_DEADLINE_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .context("SHUTDOWN_DEADLINE_SECS must be a valid number")?,
        })
    }

    /// Concurrency override for a queue, keyed by its kebab-case name.
    pub fn queue_concurrency(&self, queue: &str) -> Option<usize> {
        self.queue_concurrency_overrides.get(queue).copied()
    }
}

/// Extract QUEUE_<NAME>_CONCURRENCY=N overrides from the environment.
///
/// `QUEUE_CHAT_EVENTS_CONCURRENCY=8` maps to queue name `chat-events`.
fn parse_concurrency_overrides(
    vars: impl Iterator<Item = (String, String)>,
) -> HashMap<String, usize> {
    let mut overrides = HashMap::new();

    for (key, value) in vars {
        let Some(rest) = key.strip_prefix("QUEUE_") else {
            continue;
        };
        let Some(name) = rest.strip_suffix("_CONCURRENCY") else {
            continue;
        };
        match value.parse::<usize>() {
            Ok(n) if n > 0 => {
                overrides.insert(name.to_lowercase().replace('_', "-"), n);
            }
            _ => {
                tracing::warn!(var = %key, value = %value, "ignoring invalid concurrency override");
            }
        }
    }

    overrides
}
