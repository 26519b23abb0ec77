//! Stock level rows and the append-only movement journal.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryStockLedger;
pub use postgres::PostgresStockLedger;
pub use r#trait::{LedgerError, StockLedger};
