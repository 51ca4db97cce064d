//! Test harness: a fully wired in-memory core.
//!
//! Builds the whole dependency graph (in-memory KV, in-memory queues,
//! dead-letter store, job manager, mock collaborators) so unit and
//! integration tests exercise real queue/worker semantics without Redis or
//! external providers.

use std::collections::HashMap;
use std::sync::Arc;

use super::deps::ServerDeps;
use super::jobs::dead_letter::DeadLetterStore;
use super::jobs::manager::JobManager;
use super::jobs::memory::InMemoryJobQueue;
use super::jobs::queue::{JobQueue, QueueName};
use super::kv::InMemoryKvClient;
use super::progress::ProgressBus;
use super::test_dependencies::{
    MockChatClient, MockEmbeddingService, MockExecutionStore, MockFailureSink, MockOrchestrator,
};

/// Handles to everything a test may want to inspect or manipulate.
pub struct TestMocks {
    pub kv: Arc<InMemoryKvClient>,
    pub dead_letter: Arc<DeadLetterStore>,
    pub queues: HashMap<QueueName, Arc<dyn JobQueue>>,
    pub manager: Arc<JobManager>,
    pub orchestrator: Arc<MockOrchestrator>,
    pub chat: Arc<MockChatClient>,
    pub execution_store: Arc<MockExecutionStore>,
    pub failure_sink: Arc<MockFailureSink>,
    pub embedding_service: Arc<MockEmbeddingService>,
}

impl TestMocks {
    pub fn queue(&self, name: QueueName) -> Arc<dyn JobQueue> {
        self.queues
            .get(&name)
            .cloned()
            .unwrap_or_else(|| panic!("queue {name} missing from test topology"))
    }
}

/// Build [`ServerDeps`] over in-memory infrastructure and mocks.
pub fn test_deps() -> (Arc<ServerDeps>, TestMocks) {
    let kv = Arc::new(InMemoryKvClient::new());
    let dead_letter = Arc::new(DeadLetterStore::new(kv.clone()));

    let mut queues: HashMap<QueueName, Arc<dyn JobQueue>> = HashMap::new();
    for name in QueueName::ALL {
        queues.insert(
            name,
            Arc::new(InMemoryJobQueue::new(
                name.default_config(),
                dead_letter.clone(),
            )),
        );
    }

    let progress = ProgressBus::new();
    let manager = Arc::new(JobManager::new(
        queues.clone(),
        kv.clone(),
        progress.clone(),
    ));

    let orchestrator = Arc::new(MockOrchestrator::new());
    let chat = Arc::new(MockChatClient::new());
    let execution_store = Arc::new(MockExecutionStore::new());
    let failure_sink = Arc::new(MockFailureSink::new());
    let embedding_service = Arc::new(MockEmbeddingService::new());

    let deps = Arc::new(ServerDeps::new(
        kv.clone(),
        manager.clone(),
        dead_letter.clone(),
        progress,
        orchestrator.clone(),
        chat.clone(),
        execution_store.clone(),
        failure_sink.clone(),
        embedding_service.clone(),
        "#ops-alerts".to_string(),
        None,
    ));

    let mocks = TestMocks {
        kv,
        dead_letter,
        queues,
        manager,
        orchestrator,
        chat,
        execution_store,
        failure_sink,
        embedding_service,
    };

    (deps, mocks)
}
