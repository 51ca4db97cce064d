//! Mock collaborators for tests.
//!
//! Every mock records its calls for later inspection and can be told to
//! fail, so handler retry and dead-letter paths can be exercised without
//! real providers.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;
use uuid::Uuid;

use super::traits::{
    BaseChatClient, BaseEmbeddingService, BaseExecutionStore, BaseFailureSink, BaseOrchestrator,
    ExecutionRecord, OrchestrationMetadata, OrchestrationOutcome, OrchestrationRequest,
};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// =============================================================================
// Orchestrator
// =============================================================================

#[derive(Default)]
pub struct MockOrchestrator {
    pub requests: Mutex<Vec<OrchestrationRequest>>,
    fail_with: Mutex<Option<String>>,
}

impl MockOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with `message`.
    pub fn fail_with(&self, message: &str) {
        *lock(&self.fail_with) = Some(message.to_string());
    }

    pub fn request_count(&self) -> usize {
        lock(&self.requests).len()
    }
}

#[async_trait]
impl BaseOrchestrator for MockOrchestrator {
    async fn orchestrate(&self, request: OrchestrationRequest) -> Result<OrchestrationOutcome> {
        lock(&self.requests).push(request.clone());
        if let Some(message) = lock(&self.fail_with).clone() {
            bail!(message);
        }
        Ok(OrchestrationOutcome {
            output: format!("echo: {}", request.request),
            status: "completed".to_string(),
            metadata: OrchestrationMetadata {
                category: "general".to_string(),
                skills: vec![],
                model: "mock-model".to_string(),
            },
        })
    }
}

// =============================================================================
// Chat client
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub channel: String,
    pub text: String,
    pub thread_ts: Option<String>,
}

#[derive(Default)]
pub struct MockChatClient {
    pub sent: Mutex<Vec<SentMessage>>,
    pub updated: Mutex<Vec<(String, String)>>,
    next_ts: AtomicUsize,
    should_fail: AtomicBool,
}

impl MockChatClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_should_fail(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::SeqCst);
    }

    pub fn sent_count(&self) -> usize {
        lock(&self.sent).len()
    }
}

#[async_trait]
impl BaseChatClient for MockChatClient {
    async fn post_message(
        &self,
        channel: &str,
        text: &str,
        _blocks: Option<serde_json::Value>,
        thread_ts: Option<&str>,
    ) -> Result<String> {
        if self.should_fail.load(Ordering::SeqCst) {
            bail!("503 Service Unavailable posting message");
        }
        lock(&self.sent).push(SentMessage {
            channel: channel.to_string(),
            text: text.to_string(),
            thread_ts: thread_ts.map(str::to_string),
        });
        let ts = self.next_ts.fetch_add(1, Ordering::SeqCst);
        Ok(format!("{}.{:06}", 1700000000 + ts, ts))
    }

    async fn update_message(
        &self,
        _channel: &str,
        ts: &str,
        text: &str,
        _blocks: Option<serde_json::Value>,
    ) -> Result<()> {
        if self.should_fail.load(Ordering::SeqCst) {
            bail!("503 Service Unavailable updating message");
        }
        lock(&self.updated).push((ts.to_string(), text.to_string()));
        Ok(())
    }
}

// =============================================================================
// Execution store
// =============================================================================

#[derive(Default)]
pub struct MockExecutionStore {
    pub executions: Mutex<Vec<ExecutionRecord>>,
    pub updates: Mutex<Vec<(Uuid, String)>>,
    pub audit_entries: Mutex<Vec<(Uuid, String)>>,
}

impl MockExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn execution_count(&self) -> usize {
        lock(&self.executions).len()
    }
}

#[async_trait]
impl BaseExecutionStore for MockExecutionStore {
    async fn create_execution(&self, record: ExecutionRecord) -> Result<()> {
        lock(&self.executions).push(record);
        Ok(())
    }

    async fn update_execution(
        &self,
        id: Uuid,
        status: &str,
        _output: Option<String>,
        _error: Option<String>,
    ) -> Result<()> {
        lock(&self.updates).push((id, status.to_string()));
        Ok(())
    }

    async fn insert_audit_entry(
        &self,
        organization_id: Uuid,
        action: &str,
        _detail: serde_json::Value,
    ) -> Result<()> {
        lock(&self.audit_entries).push((organization_id, action.to_string()));
        Ok(())
    }
}

// =============================================================================
// Failure sink
// =============================================================================

#[derive(Debug, Clone)]
pub struct Notification {
    pub channel: String,
    pub text: String,
    pub event_id: Option<String>,
}

#[derive(Default)]
pub struct MockFailureSink {
    pub notifications: Mutex<Vec<Notification>>,
}

impl MockFailureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notification_count(&self) -> usize {
        lock(&self.notifications).len()
    }

    pub fn last_text(&self) -> Option<String> {
        lock(&self.notifications).last().map(|n| n.text.clone())
    }
}

#[async_trait]
impl BaseFailureSink for MockFailureSink {
    async fn notify(
        &self,
        channel: &str,
        text: &str,
        _organization_id: Option<Uuid>,
        _user_id: Option<Uuid>,
        event_id: Option<String>,
    ) -> Result<()> {
        lock(&self.notifications).push(Notification {
            channel: channel.to_string(),
            text: text.to_string(),
            event_id,
        });
        Ok(())
    }
}

// =============================================================================
// Embedding service
// =============================================================================

#[derive(Default)]
pub struct MockEmbeddingService {
    pub stored: Mutex<Vec<(Uuid, Uuid)>>,
}

impl MockEmbeddingService {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BaseEmbeddingService for MockEmbeddingService {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|_| vec![0.0f32; 8]).collect())
    }

    async fn store(
        &self,
        organization_id: Uuid,
        document_id: Uuid,
        _embeddings: Vec<Vec<f32>>,
    ) -> Result<()> {
        lock(&self.stored).push((organization_id, document_id));
        Ok(())
    }
}
