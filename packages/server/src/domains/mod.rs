//! Worker handlers per domain.
//!
//! Each domain owns its payload schema and handler; the kernel provides the
//! queues, workers and recovery machinery that host them.

pub mod chat_events;
pub mod indexing;
pub mod installations;
pub mod notifications;
pub mod orchestration;
pub mod recovery;
pub mod scheduled;
pub mod webhooks;

use crate::kernel::jobs::HandlerRegistry;

/// Register every domain handler.
pub fn register_all(registry: &mut HandlerRegistry) {
    chat_events::register(registry);
    orchestration::register(registry);
    notifications::register(registry);
    webhooks::register(registry);
    scheduled::register(registry);
    indexing::register(registry);
    installations::register(registry);
    recovery::register(registry);
}
