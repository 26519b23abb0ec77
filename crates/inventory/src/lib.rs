//! Stock ledger domain (pure).
//!
//! Movement semantics, line validation and the `StockLevel` aggregate with its
//! non-negativity invariants. No IO: persistence and row locking live in
//! `invflow-infra`.

pub mod error;
pub mod level;
pub mod movement;

pub use error::{Shortfall, StockError};
pub use level::{StockKey, StockLevel, apply_lines};
pub use movement::{
    MovementLine, MovementPosted, MovementType, PostMovement, PostTransfer, StockEvent,
    StockMovement, TransferLine,
};
