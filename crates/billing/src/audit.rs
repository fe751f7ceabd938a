//! Audit trail for subscription and settings mutations.
//!
//! Every state-changing operation appends exactly one entry. The log is
//! append-only: nothing in this codebase updates or deletes rows, and it is
//! the sole record of who changed what.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BillingResult;
use crate::store::AuditSink;

/// Who performed a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    Admin,
    User,
    /// Automated paths: webhooks, the reconciliation job.
    System,
}

impl ActorType {
    pub fn as_str(self) -> &'static str {
        match self {
            ActorType::Admin => "admin",
            ActorType::User => "user",
            ActorType::System => "system",
        }
    }
}

/// The acting principal attached to every mutation.
#[derive(Debug, Clone, Copy)]
pub struct Actor {
    pub id: Option<Uuid>,
    pub kind: ActorType,
}

impl Actor {
    pub fn admin(id: Uuid) -> Self {
        Self {
            id: Some(id),
            kind: ActorType::Admin,
        }
    }

    pub fn user(id: Uuid) -> Self {
        Self {
            id: Some(id),
            kind: ActorType::User,
        }
    }

    pub fn system() -> Self {
        Self {
            id: None,
            kind: ActorType::System,
        }
    }
}

/// A single audit entry, ready to append.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub actor_id: Option<Uuid>,
    pub actor_type: ActorType,
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    pub details: serde_json::Value,
}

impl AuditEntry {
    pub fn new(action: &str, entity_type: &str, entity_id: impl ToString) -> Self {
        Self {
            actor_id: None,
            actor_type: ActorType::System,
            action: action.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            details: serde_json::Value::Null,
        }
    }

    pub fn actor(mut self, actor: Actor) -> Self {
        self.actor_id = actor.id;
        self.actor_type = actor.kind;
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// Appends audit entries through the configured sink.
#[derive(Clone)]
pub struct AuditLogger {
    sink: Arc<dyn AuditSink>,
}

impl AuditLogger {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    pub async fn append(&self, entry: AuditEntry) -> BillingResult<()> {
        tracing::debug!(
            action = %entry.action,
            entity_type = %entry.entity_type,
            entity_id = %entry.entity_id,
            actor_type = entry.actor_type.as_str(),
            "Appending audit entry"
        );
        self.sink.append(entry).await
    }
}
