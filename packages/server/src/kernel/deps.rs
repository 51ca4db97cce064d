//! Server dependencies for worker handlers.
//!
//! The central dependency container handed to every handler. External
//! services sit behind traits so tests can substitute mocks.

use std::sync::Arc;

use uuid::Uuid;

use super::jobs::dead_letter::DeadLetterStore;
use super::jobs::manager::JobManager;
use super::kv::KvClient;
use super::progress::ProgressBus;
use super::traits::{
    BaseChatClient, BaseEmbeddingService, BaseExecutionStore, BaseFailureSink, BaseOrchestrator,
};

/// Dependencies accessible to worker handlers (traits for testability).
#[derive(Clone)]
pub struct ServerDeps {
    pub kv: Arc<dyn KvClient>,
    pub job_manager: Arc<JobManager>,
    pub dead_letter: Arc<DeadLetterStore>,
    pub progress: ProgressBus,
    pub orchestrator: Arc<dyn BaseOrchestrator>,
    pub chat: Arc<dyn BaseChatClient>,
    pub execution_store: Arc<dyn BaseExecutionStore>,
    pub failure_sink: Arc<dyn BaseFailureSink>,
    pub embedding_service: Arc<dyn BaseEmbeddingService>,
    /// Channel receiving operator alerts and recovery notifications.
    pub admin_notification_channel: String,
    /// Organization for system-originated work.
    pub admin_organization_id: Option<Uuid>,
}

impl ServerDeps {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kv: Arc<dyn KvClient>,
        job_manager: Arc<JobManager>,
        dead_letter: Arc<DeadLetterStore>,
        progress: ProgressBus,
        orchestrator: Arc<dyn BaseOrchestrator>,
        chat: Arc<dyn BaseChatClient>,
        execution_store: Arc<dyn BaseExecutionStore>,
        failure_sink: Arc<dyn BaseFailureSink>,
        embedding_service: Arc<dyn BaseEmbeddingService>,
        admin_notification_channel: String,
        admin_organization_id: Option<Uuid>,
    ) -> Self {
        Self {
            kv,
            job_manager,
            dead_letter,
            progress,
            orchestrator,
            chat,
            execution_store,
            failure_sink,
            embedding_service,
            admin_notification_channel,
            admin_organization_id,
        }
    }
}
