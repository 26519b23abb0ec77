use serde::{Deserialize, Serialize};
use thiserror::Error;

use invflow_core::ProductId;

/// Which quantity a rejected line would have driven below its floor.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Shortfall {
    OnHand,
    Reserved,
    Available,
}

impl core::fmt::Display for Shortfall {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            Shortfall::OnHand => "on-hand",
            Shortfall::Reserved => "reserved",
            Shortfall::Available => "available",
        })
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StockError {
    #[error("unknown movement type '{0}'")]
    UnknownMovementType(String),

    /// The request is malformed (empty, wrong sign for its type, ...).
    #[error("invalid movement{}: {reason}", .line.map_or_else(String::new, |l| format!(" (line {l})")))]
    Invalid { line: Option<usize>, reason: String },

    /// A line would leave a stock level negative or over-reserved.
    #[error(
        "insufficient {shortfall} stock for product {product_id} on line {line}: requested {requested}, have {available}"
    )]
    InsufficientStock {
        line: usize,
        product_id: ProductId,
        shortfall: Shortfall,
        requested: i64,
        available: i64,
    },
}

impl StockError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid {
            line: None,
            reason: reason.into(),
        }
    }

    pub fn invalid_line(line: usize, reason: impl Into<String>) -> Self {
        Self::Invalid {
            line: Some(line),
            reason: reason.into(),
        }
    }
}
