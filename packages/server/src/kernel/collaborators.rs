//! Placeholder collaborator wiring for standalone hosts.
//!
//! The real integrations (LLM orchestration, chat provider, execution
//! store, embeddings) are injected by the deployment that embeds this
//! crate. Standalone hosts (the worker binary without integrations, the
//! operator CLI) boot with this set: jobs that reach an unconfigured
//! collaborator fail with an explicit message, which the recovery
//! classifier treats as permanent, and the failure sink degrades to
//! structured logs.

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use uuid::Uuid;

use super::runtime::Collaborators;
use super::traits::{
    BaseChatClient, BaseEmbeddingService, BaseExecutionStore, BaseFailureSink, BaseOrchestrator,
    ExecutionRecord, OrchestrationOutcome, OrchestrationRequest,
};

/// Collaborator set for hosts without integrations wired in.
pub fn placeholders() -> Collaborators {
    Collaborators {
        orchestrator: Arc::new(Unconfigured),
        chat: Arc::new(Unconfigured),
        execution_store: Arc::new(Unconfigured),
        failure_sink: Arc::new(LogFailureSink),
        embedding_service: Arc::new(Unconfigured),
    }
}

struct Unconfigured;

#[async_trait]
impl BaseOrchestrator for Unconfigured {
    async fn orchestrate(&self, _request: OrchestrationRequest) -> Result<OrchestrationOutcome> {
        bail!("orchestrator collaborator not configured")
    }
}

#[async_trait]
impl BaseChatClient for Unconfigured {
    async fn post_message(
        &self,
        _channel: &str,
        _text: &str,
        _blocks: Option<serde_json::Value>,
        _thread_ts: Option<&str>,
    ) -> Result<String> {
        bail!("chat collaborator not configured")
    }

    async fn update_message(
        &self,
        _channel: &str,
        _ts: &str,
        _text: &str,
        _blocks: Option<serde_json::Value>,
    ) -> Result<()> {
        bail!("chat collaborator not configured")
    }
}

#[async_trait]
impl BaseExecutionStore for Unconfigured {
    async fn create_execution(&self, _record: ExecutionRecord) -> Result<()> {
        bail!("execution store collaborator not configured")
    }

    async fn update_execution(
        &self,
        _id: Uuid,
        _status: &str,
        _output: Option<String>,
        _error: Option<String>,
    ) -> Result<()> {
        bail!("execution store collaborator not configured")
    }

    async fn insert_audit_entry(
        &self,
        _organization_id: Uuid,
        _action: &str,
        _detail: serde_json::Value,
    ) -> Result<()> {
        bail!("execution store collaborator not configured")
    }
}

#[async_trait]
impl BaseEmbeddingService for Unconfigured {
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        bail!("embedding collaborator not configured")
    }

    async fn store(
        &self,
        _organization_id: Uuid,
        _document_id: Uuid,
        _embeddings: Vec<Vec<f32>>,
    ) -> Result<()> {
        bail!("embedding collaborator not configured")
    }
}

/// Failure sink that degrades to structured logs when no chat provider is
/// wired in. Alerts stay visible to operators tailing the host.
pub struct LogFailureSink;

#[async_trait]
impl BaseFailureSink for LogFailureSink {
    async fn notify(
        &self,
        channel: &str,
        text: &str,
        organization_id: Option<Uuid>,
        _user_id: Option<Uuid>,
        event_id: Option<String>,
    ) -> Result<()> {
        tracing::error!(
            channel = %channel,
            organization_id = ?organization_id,
            event_id = ?event_id,
            "{text}"
        );
        Ok(())
    }
}
