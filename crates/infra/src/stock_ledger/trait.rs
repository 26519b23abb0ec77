use thiserror::Error;
use uuid::Uuid;

use invflow_core::MovementId;
use invflow_inventory::{StockError, StockKey, StockLevel, StockMovement};

use crate::error::EngineError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// A line failed its pre-check or an invariant; nothing was written.
    #[error(transparent)]
    Stock(#[from] StockError),

    /// Row lock wait exceeded the configured timeout.
    #[error("stock rows busy: {0}")]
    Busy(String),

    /// Serialization failure or deadlock; safe to retry the whole commit.
    #[error("ledger commit conflict: {0}")]
    Conflict(String),

    #[error("ledger backend error: {0}")]
    Backend(String),
}

impl LedgerError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, LedgerError::Conflict(_))
    }
}

impl From<LedgerError> for EngineError {
    fn from(value: LedgerError) -> Self {
        match value {
            LedgerError::Stock(e) => e.into(),
            LedgerError::Busy(msg) | LedgerError::Conflict(msg) => EngineError::Busy(msg),
            LedgerError::Backend(msg) => EngineError::Store(msg),
        }
    }
}

/// Persistence boundary for stock levels and the movement journal.
#[async_trait::async_trait]
pub trait StockLedger: Send + Sync {
    /// Apply every line of every movement and journal the movements, all or
    /// nothing. Returns the updated levels in key order.
    async fn commit(&self, movements: &[StockMovement]) -> Result<Vec<StockLevel>, LedgerError>;

    async fn level(&self, key: StockKey) -> Result<Option<StockLevel>, LedgerError>;

    async fn movement(&self, id: MovementId) -> Result<Option<StockMovement>, LedgerError>;

    /// Movements posted for a business request, oldest first.
    async fn movements_for_request(&self, request_id: Uuid) -> Result<Vec<StockMovement>, LedgerError>;
}
