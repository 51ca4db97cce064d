use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::queue::QueueName;

/// Job lifecycle events published by the queue façade.
///
/// These are facts about the lifecycle, not commands. The health monitor
/// and the failure alerter consume them; operators can tap the stream for
/// observability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobEvent {
    /// A worker acquired the job's lease and started the handler.
    Started {
        queue: QueueName,
        job_id: Uuid,
        name: String,
        worker_id: String,
        attempt: u32,
    },

    /// The handler returned success.
    Completed {
        queue: QueueName,
        job_id: Uuid,
        name: String,
        duration_ms: u64,
    },

    /// The handler failed; the façade scheduled a retry.
    Failed {
        queue: QueueName,
        job_id: Uuid,
        name: String,
        error: String,
        attempt: u32,
        will_retry: bool,
    },

    /// A lease expired without completion and the job was requeued.
    Stalled {
        queue: QueueName,
        job_id: Uuid,
        times_stalled: u32,
    },

    /// Attempts exhausted; a dead-letter entry was written.
    DeadLettered {
        queue: QueueName,
        job_id: Uuid,
        name: String,
        total_attempts: u32,
        final_error: String,
    },

    /// A waiting or delayed job was removed before running.
    Removed { queue: QueueName, job_id: Uuid },
}

impl JobEvent {
    pub fn queue(&self) -> QueueName {
        match self {
            JobEvent::Started { queue, .. }
            | JobEvent::Completed { queue, .. }
            | JobEvent::Failed { queue, .. }
            | JobEvent::Stalled { queue, .. }
            | JobEvent::DeadLettered { queue, .. }
            | JobEvent::Removed { queue, .. } => *queue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_variant_names() {
        let event = JobEvent::DeadLettered {
            queue: QueueName::Orchestration,
            job_id: Uuid::new_v4(),
            name: "orchestrate".to_string(),
            total_attempts: 2,
            final_error: "Read timeout contacting upstream".to_string(),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("DeadLettered"));
        assert!(json.contains("orchestration"));

        let back: JobEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.queue(), QueueName::Orchestration);
    }

    #[test]
    fn queue_accessor_covers_all_variants() {
        let id = Uuid::new_v4();
        let events = vec![
            JobEvent::Started {
                queue: QueueName::ChatEvents,
                job_id: id,
                name: "ingest".to_string(),
                worker_id: "worker-1".to_string(),
                attempt: 1,
            },
            JobEvent::Completed {
                queue: QueueName::ChatEvents,
                job_id: id,
                name: "ingest".to_string(),
                duration_ms: 12,
            },
            JobEvent::Stalled {
                queue: QueueName::ChatEvents,
                job_id: id,
                times_stalled: 1,
            },
            JobEvent::Removed {
                queue: QueueName::ChatEvents,
                job_id: id,
            },
        ];

        for event in events {
            assert_eq!(event.queue(), QueueName::ChatEvents);
        }
    }
}
