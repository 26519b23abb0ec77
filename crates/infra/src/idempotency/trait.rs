use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use invflow_core::{IdempotencyRecordId, UserId};

use crate::error::EngineError;

/// Uniqueness scope of a record: the same client key may be reused by
/// another user or on another route.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub key: String,
    pub user_id: UserId,
    pub route_key: String,
}

impl IdempotencyKey {
    pub fn new(key: impl Into<String>, user_id: UserId, route_key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            user_id,
            route_key: route_key.into(),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordStatus {
    Processing,
    Completed,
}

impl RecordStatus {
    pub fn code(self) -> &'static str {
        match self {
            RecordStatus::Processing => "PROCESSING",
            RecordStatus::Completed => "COMPLETED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub id: IdempotencyRecordId,
    #[serde(flatten)]
    pub key: IdempotencyKey,
    pub status: RecordStatus,
    pub status_code: Option<u16>,
    pub body: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn processing(key: IdempotencyKey, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            id: IdempotencyRecordId::new(),
            key,
            status: RecordStatus::Processing,
            status_code: None,
            body: None,
            created_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn outcome(&self) -> CheckOutcome {
        match (self.status, self.status_code) {
            (RecordStatus::Completed, Some(status_code)) => CheckOutcome::Completed {
                record_id: self.id,
                status_code,
                body: self.body.clone().unwrap_or(JsonValue::Null),
            },
            _ => CheckOutcome::InFlight(self.id),
        }
    }
}

/// Result of `check_or_insert`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// No live record existed; the caller owns the new PROCESSING record.
    Inserted(IdempotencyRecordId),
    /// A finished execution; replay its stored response.
    Completed {
        record_id: IdempotencyRecordId,
        status_code: u16,
        body: JsonValue,
    },
    /// A concurrent duplicate is still running.
    InFlight(IdempotencyRecordId),
}

impl CheckOutcome {
    pub fn exists(&self) -> bool {
        !matches!(self, CheckOutcome::Inserted(_))
    }

    pub fn record_id(&self) -> IdempotencyRecordId {
        match self {
            CheckOutcome::Inserted(id) | CheckOutcome::InFlight(id) => *id,
            CheckOutcome::Completed { record_id, .. } => *record_id,
        }
    }
}

#[derive(Debug, Error)]
pub enum IdempotencyError {
    #[error("idempotency record {0} not found")]
    NotFound(IdempotencyRecordId),

    /// Only the inserting flow may complete or release a record, and only once.
    #[error("idempotency record {0} is not processing")]
    NotProcessing(IdempotencyRecordId),

    #[error("idempotency backend error: {0}")]
    Backend(String),
}

impl From<IdempotencyError> for EngineError {
    fn from(value: IdempotencyError) -> Self {
        EngineError::Store(value.to_string())
    }
}

/// Durable, uniquely keyed record of mutating requests.
///
/// Implementations must make `check_or_insert` atomic: of two concurrent
/// calls with the same key exactly one observes `Inserted`.
#[async_trait::async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Insert a PROCESSING record unless a live one exists for `key`.
    /// Expired records count as absent and are replaced.
    async fn check_or_insert(
        &self,
        key: &IdempotencyKey,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<CheckOutcome, IdempotencyError>;

    /// PROCESSING -> COMPLETED with the response to replay.
    async fn update_response(
        &self,
        id: IdempotencyRecordId,
        status_code: u16,
        body: JsonValue,
    ) -> Result<(), IdempotencyError>;

    /// Drop a PROCESSING record so the client may retry with the same key.
    async fn release(&self, id: IdempotencyRecordId) -> Result<(), IdempotencyError>;

    async fn get(&self, id: IdempotencyRecordId) -> Result<Option<IdempotencyRecord>, IdempotencyError>;

    /// Remove expired records. Returns how many were removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, IdempotencyError>;
}
