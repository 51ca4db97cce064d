//! Collaborator interfaces consumed by worker handlers.
//!
//! Only the surface the core needs is defined here; implementations
//! (LLM orchestration, chat providers, the relational store) live outside
//! this crate and are injected through [`crate::kernel::deps::ServerDeps`].

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Orchestration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationRequest {
    pub request: String,
    pub session_id: String,
    pub organization_id: Uuid,
    pub user_id: Option<Uuid>,
    pub thread_context: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationMetadata {
    pub category: String,
    pub skills: Vec<String>,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationOutcome {
    pub output: String,
    pub status: String,
    pub metadata: OrchestrationMetadata,
}

/// The LLM-backed orchestration step that turns a user request into output.
#[async_trait]
pub trait BaseOrchestrator: Send + Sync {
    async fn orchestrate(&self, request: OrchestrationRequest) -> Result<OrchestrationOutcome>;
}

// =============================================================================
// Chat
// =============================================================================

/// Chat provider surface used by the notifications worker.
#[async_trait]
pub trait BaseChatClient: Send + Sync {
    /// Post a message; returns the provider's message timestamp/id.
    async fn post_message(
        &self,
        channel: &str,
        text: &str,
        blocks: Option<serde_json::Value>,
        thread_ts: Option<&str>,
    ) -> Result<String>;

    /// Update a previously posted message in place.
    async fn update_message(
        &self,
        channel: &str,
        ts: &str,
        text: &str,
        blocks: Option<serde_json::Value>,
    ) -> Result<()>;
}

// =============================================================================
// Execution records
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub user_id: Option<Uuid>,
    pub task: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
}

/// Narrow interface to the relational store for execution rows and audit
/// entries. The store is never relied on for queue semantics.
#[async_trait]
pub trait BaseExecutionStore: Send + Sync {
    async fn create_execution(&self, record: ExecutionRecord) -> Result<()>;

    async fn update_execution(
        &self,
        id: Uuid,
        status: &str,
        output: Option<String>,
        error: Option<String>,
    ) -> Result<()>;

    async fn insert_audit_entry(
        &self,
        organization_id: Uuid,
        action: &str,
        detail: serde_json::Value,
    ) -> Result<()>;
}

// =============================================================================
// Failure sink
// =============================================================================

/// Operator-facing notification channel used by the failure alerter and the
/// dead-letter recovery worker.
#[async_trait]
pub trait BaseFailureSink: Send + Sync {
    async fn notify(
        &self,
        channel: &str,
        text: &str,
        organization_id: Option<Uuid>,
        user_id: Option<Uuid>,
        event_id: Option<String>,
    ) -> Result<()>;
}

// =============================================================================
// Embeddings
// =============================================================================

/// Embedding generation and storage behind the indexing queue.
#[async_trait]
pub trait BaseEmbeddingService: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn store(
        &self,
        organization_id: Uuid,
        document_id: Uuid,
        embeddings: Vec<Vec<f32>>,
    ) -> Result<()>;
}
