//! Tenant context carried through every job.
//!
//! Each job payload carries `{organization_id, user_id?}`. The worker base
//! derives a `TenantContext` from the payload before invoking the handler so
//! downstream calls (LLM, chat, execution store) see consistent identity.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity under which a job executes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantContext {
    pub organization_id: Uuid,
    pub user_id: Option<Uuid>,
}

impl TenantContext {
    pub fn new(organization_id: Uuid, user_id: Option<Uuid>) -> Self {
        Self {
            organization_id,
            user_id,
        }
    }

    /// Context for system-originated work (scheduled tasks, recovery sweeps).
    ///
    /// Uses the nil organization unless an admin organization is configured.
    /// Handlers running as the system opt into unscoped store access
    /// explicitly via [`TenantContext::is_system`].
    pub fn system(admin_organization_id: Option<Uuid>) -> Self {
        Self {
            organization_id: admin_organization_id.unwrap_or(Uuid::nil()),
            user_id: None,
        }
    }

    /// Whether this context represents the system rather than a real tenant.
    pub fn is_system(&self) -> bool {
        self.user_id.is_none() && self.organization_id == Uuid::nil()
    }

    /// Extract the tenant context from a job payload.
    ///
    /// Falls back to the system context when the payload carries no
    /// `organization_id` field (e.g. recovery sweeps enqueued internally).
    pub fn from_payload(payload: &serde_json::Value) -> Self {
        let organization_id = payload
            .get("organization_id")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok());

        let user_id = payload
            .get("user_id")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok());

        match organization_id {
            Some(org) => Self::new(org, user_id),
            None => Self::system(None),
        }
    }
}
