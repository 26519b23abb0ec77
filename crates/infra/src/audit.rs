//! Audit sink collaborator: best-effort change log.

use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use invflow_core::UserId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub user_id: UserId,
    /// e.g. `workflow.task.approve`, `stock.movement.post`.
    pub action: String,
    pub entity_id: Uuid,
    pub old_value: Option<JsonValue>,
    pub new_value: Option<JsonValue>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit sink unavailable: {0}")]
    Unavailable(String),
}

pub trait AuditSink: Send + Sync {
    fn log_change(&self, entry: AuditEntry) -> Result<(), AuditError>;
}

/// Record after commit; a failing sink never fails the operation.
pub(crate) fn record(sink: &dyn AuditSink, entry: AuditEntry) {
    let action = entry.action.clone();
    if let Err(e) = sink.log_change(entry) {
        tracing::warn!(%action, error = %e, "audit sink rejected entry");
    }
}

/// Emits audit entries as structured log lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn log_change(&self, entry: AuditEntry) -> Result<(), AuditError> {
        tracing::info!(
            user_id = %entry.user_id,
            action = %entry.action,
            entity_id = %entry.entity_id,
            old = ?entry.old_value,
            new = ?entry.new_value,
            "audit"
        );
        Ok(())
    }
}

/// Keeps entries in memory. Intended for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryAuditSink {
    entries: RwLock<Vec<AuditEntry>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.read().map(|e| e.clone()).unwrap_or_default()
    }
}

impl AuditSink for InMemoryAuditSink {
    fn log_change(&self, entry: AuditEntry) -> Result<(), AuditError> {
        self.entries
            .write()
            .map_err(|_| AuditError::Unavailable("lock poisoned".to_string()))?
            .push(entry);
        Ok(())
    }
}
