//! Indexing: generate and store embeddings for a document.
//!
//! Runs on the indexing queue with a long lock; embedding batches for large
//! documents can take minutes.

use std::sync::Arc;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::kernel::jobs::{HandlerRegistry, JobContext};
use crate::kernel::progress::ProgressStage;
use crate::kernel::ServerDeps;

pub const JOB_NAME: &str = "indexing.embed";

/// Characters per embedding chunk.
const CHUNK_SIZE: usize = 2000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingJob {
    pub organization_id: Uuid,
    pub document_id: Uuid,
    pub content: String,
}

pub fn register(registry: &mut HandlerRegistry) {
    registry.register::<IndexingJob, _, _>(JOB_NAME, |job, ctx, deps| async move {
        index_document(job, ctx, &deps).await
    });
}

fn chunk_content(content: &str) -> Vec<String> {
    let chars: Vec<char> = content.chars().collect();
    chars
        .chunks(CHUNK_SIZE)
        .map(|c| c.iter().collect())
        .collect()
}

async fn index_document(job: IndexingJob, ctx: JobContext, deps: &Arc<ServerDeps>) -> Result<()> {
    if job.content.trim().is_empty() {
        bail!("invalid indexing job: document {} has no content", job.document_id);
    }

    let org = ctx.tenant.organization_id;
    let chunks = chunk_content(&job.content);

    deps.job_manager
        .update_progress(
            org,
            ctx.job_id,
            ProgressStage::Processing,
            50,
            format!("embedding {} chunks", chunks.len()),
        )
        .await?;

    let embeddings = deps.embedding_service.embed(&chunks).await?;

    deps.job_manager
        .update_progress(org, ctx.job_id, ProgressStage::Finalizing, 80, "storing embeddings")
        .await?;

    deps.embedding_service
        .store(job.organization_id, job.document_id, embeddings)
        .await?;

    info!(
        document_id = %job.document_id,
        chunks = chunks.len(),
        "document indexed"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::jobs::QueueName;
    use crate::kernel::testing::test_deps;
    use tokio_util::sync::CancellationToken;

    fn ctx(org: Uuid) -> JobContext {
        JobContext {
            job_id: Uuid::new_v4(),
            queue: QueueName::Indexing,
            attempt: 1,
            attempt_cap: 3,
            tenant: crate::common::TenantContext::new(org, None),
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn chunking_splits_on_the_chunk_size() {
        assert_eq!(chunk_content("short"), vec!["short".to_string()]);

        let long = "x".repeat(4500);
        let chunks = chunk_content(&long);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 2000);
        assert_eq!(chunks[2].len(), 500);
    }

    #[tokio::test]
    async fn embeddings_are_generated_and_stored() {
        let (deps, mocks) = test_deps();
        let org = Uuid::new_v4();
        let doc = Uuid::new_v4();

        index_document(
            IndexingJob {
                organization_id: org,
                document_id: doc,
                content: "the quick brown fox".to_string(),
            },
            ctx(org),
            &deps,
        )
        .await
        .unwrap();

        let stored = mocks.embedding_service.stored.lock().unwrap();
        assert_eq!(stored.as_slice(), &[(org, doc)]);
    }

    #[tokio::test]
    async fn empty_document_is_rejected() {
        let (deps, _mocks) = test_deps();
        let org = Uuid::new_v4();

        let err = index_document(
            IndexingJob {
                organization_id: org,
                document_id: Uuid::new_v4(),
                content: "  ".to_string(),
            },
            ctx(org),
            &deps,
        )
        .await
        .unwrap_err();

        assert!(err.to_string().contains("no content"));
    }
}
