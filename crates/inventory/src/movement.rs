use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use invflow_core::{MovementId, ProductId, UserId, WarehouseId};
use invflow_events::Event;

use crate::error::StockError;

/// Kind of inventory transaction. Determines which deltas a line may carry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MovementType {
    Receipt,
    Issue,
    Reserve,
    Release,
    ConsumeReserve,
    TransferOut,
    TransferIn,
    AdjustmentIn,
    AdjustmentOut,
    ReturnIn,
    ReturnOut,
}

/// Required sign of a delta for a movement type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Sign {
    Positive,
    Negative,
    Zero,
}

impl Sign {
    fn admits(self, value: i64) -> bool {
        match self {
            Sign::Positive => value > 0,
            Sign::Negative => value < 0,
            Sign::Zero => value == 0,
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Sign::Positive => "positive",
            Sign::Negative => "negative",
            Sign::Zero => "zero",
        }
    }
}

impl MovementType {
    pub const ALL: [MovementType; 11] = [
        MovementType::Receipt,
        MovementType::Issue,
        MovementType::Reserve,
        MovementType::Release,
        MovementType::ConsumeReserve,
        MovementType::TransferOut,
        MovementType::TransferIn,
        MovementType::AdjustmentIn,
        MovementType::AdjustmentOut,
        MovementType::ReturnIn,
        MovementType::ReturnOut,
    ];

    pub fn code(self) -> &'static str {
        match self {
            MovementType::Receipt => "RECEIPT",
            MovementType::Issue => "ISSUE",
            MovementType::Reserve => "RESERVE",
            MovementType::Release => "RELEASE",
            MovementType::ConsumeReserve => "CONSUME_RESERVE",
            MovementType::TransferOut => "TRANSFER_OUT",
            MovementType::TransferIn => "TRANSFER_IN",
            MovementType::AdjustmentIn => "ADJUSTMENT_IN",
            MovementType::AdjustmentOut => "ADJUSTMENT_OUT",
            MovementType::ReturnIn => "RETURN_IN",
            MovementType::ReturnOut => "RETURN_OUT",
        }
    }

    /// ADJUSTMENT_IN / ADJUSTMENT_OUT bypass business pre-checks and need elevated rights.
    pub fn is_privileged(self) -> bool {
        matches!(self, MovementType::AdjustmentIn | MovementType::AdjustmentOut)
    }

    /// Transfers only exist as an OUT/IN pair.
    pub fn is_transfer(self) -> bool {
        matches!(self, MovementType::TransferOut | MovementType::TransferIn)
    }

    fn signs(self) -> (Sign, Sign) {
        use Sign::*;
        match self {
            MovementType::Receipt
            | MovementType::TransferIn
            | MovementType::AdjustmentIn
            | MovementType::ReturnIn => (Positive, Zero),
            MovementType::Issue
            | MovementType::TransferOut
            | MovementType::AdjustmentOut
            | MovementType::ReturnOut => (Negative, Zero),
            MovementType::Reserve => (Zero, Positive),
            MovementType::Release => (Zero, Negative),
            MovementType::ConsumeReserve => (Negative, Negative),
        }
    }

    /// Check one line's deltas against this type's semantics.
    pub fn check_line(self, index: usize, line: &MovementLine) -> Result<(), StockError> {
        let (on_hand, reserved) = self.signs();
        if !on_hand.admits(line.qty_delta_on_hand) {
            return Err(StockError::invalid_line(
                index,
                format!(
                    "{} requires a {} on-hand delta, got {}",
                    self.code(),
                    on_hand.describe(),
                    line.qty_delta_on_hand
                ),
            ));
        }
        if !reserved.admits(line.qty_delta_reserved) {
            return Err(StockError::invalid_line(
                index,
                format!(
                    "{} requires a {} reserved delta, got {}",
                    self.code(),
                    reserved.describe(),
                    line.qty_delta_reserved
                ),
            ));
        }
        if self == MovementType::ConsumeReserve && line.qty_delta_on_hand != line.qty_delta_reserved {
            return Err(StockError::invalid_line(
                index,
                "CONSUME_RESERVE must consume the same quantity from on-hand and reserved",
            ));
        }
        if line.unit_cost.is_some_and(|c| c < 0) {
            return Err(StockError::invalid_line(index, "unit cost cannot be negative"));
        }
        Ok(())
    }
}

impl core::fmt::Display for MovementType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for MovementType {
    type Err = StockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MovementType::ALL
            .into_iter()
            .find(|t| t.code() == s)
            .ok_or_else(|| StockError::UnknownMovementType(s.to_string()))
    }
}

/// One product line of a movement. Deltas are signed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementLine {
    pub product_id: ProductId,
    pub qty_delta_on_hand: i64,
    pub qty_delta_reserved: i64,
    /// Minor currency units.
    pub unit_cost: Option<i64>,
    pub line_notes: Option<String>,
}

impl MovementLine {
    pub fn new(product_id: ProductId, qty_delta_on_hand: i64, qty_delta_reserved: i64) -> Self {
        Self {
            product_id,
            qty_delta_on_hand,
            qty_delta_reserved,
            unit_cost: None,
            line_notes: None,
        }
    }

    pub fn receipt(product_id: ProductId, qty: i64) -> Self {
        Self::new(product_id, qty, 0)
    }

    pub fn issue(product_id: ProductId, qty: i64) -> Self {
        Self::new(product_id, -qty, 0)
    }

    pub fn reserve(product_id: ProductId, qty: i64) -> Self {
        Self::new(product_id, 0, qty)
    }

    pub fn release(product_id: ProductId, qty: i64) -> Self {
        Self::new(product_id, 0, -qty)
    }

    pub fn consume_reserve(product_id: ProductId, qty: i64) -> Self {
        Self::new(product_id, -qty, -qty)
    }

    pub fn with_unit_cost(mut self, unit_cost: i64) -> Self {
        self.unit_cost = Some(unit_cost);
        self
    }
}

/// A request to post a movement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostMovement {
    pub movement_type: MovementType,
    pub reason_code: Option<String>,
    pub warehouse_id: WarehouseId,
    pub request_id: Option<Uuid>,
    pub reservation_id: Option<Uuid>,
    pub user_id: UserId,
    pub notes: Option<String>,
    pub lines: Vec<MovementLine>,
}

impl PostMovement {
    pub fn new(
        movement_type: MovementType,
        warehouse_id: WarehouseId,
        user_id: UserId,
        lines: Vec<MovementLine>,
    ) -> Self {
        Self {
            movement_type,
            reason_code: None,
            warehouse_id,
            request_id: None,
            reservation_id: None,
            user_id,
            notes: None,
            lines,
        }
    }

    pub fn for_request(mut self, request_id: Uuid) -> Self {
        self.request_id = Some(request_id);
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    /// Validate line semantics. Does not look at stock levels.
    pub fn validate(&self) -> Result<(), StockError> {
        if self.lines.is_empty() {
            return Err(StockError::invalid("a movement needs at least one line"));
        }
        for (idx, line) in self.lines.iter().enumerate() {
            self.movement_type.check_line(idx, line)?;
        }
        Ok(())
    }
}

/// One product moved between warehouses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferLine {
    pub product_id: ProductId,
    pub qty: i64,
    pub unit_cost: Option<i64>,
}

/// A request to move stock between two warehouses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostTransfer {
    pub from_warehouse_id: WarehouseId,
    pub to_warehouse_id: WarehouseId,
    pub reason_code: Option<String>,
    pub user_id: UserId,
    pub notes: Option<String>,
    pub lines: Vec<TransferLine>,
}

impl PostTransfer {
    /// Split into the TRANSFER_OUT and TRANSFER_IN legs (same magnitudes).
    pub fn into_legs(self) -> Result<(PostMovement, PostMovement), StockError> {
        if self.from_warehouse_id == self.to_warehouse_id {
            return Err(StockError::invalid("transfer source and destination must differ"));
        }
        if let Some((idx, _)) = self.lines.iter().enumerate().find(|(_, l)| l.qty <= 0) {
            return Err(StockError::invalid_line(idx, "transfer quantity must be positive"));
        }

        let leg = |movement_type, warehouse_id, sign: i64| PostMovement {
            movement_type,
            reason_code: self.reason_code.clone(),
            warehouse_id,
            request_id: None,
            reservation_id: None,
            user_id: self.user_id,
            notes: self.notes.clone(),
            lines: self
                .lines
                .iter()
                .map(|l| MovementLine {
                    product_id: l.product_id,
                    qty_delta_on_hand: sign * l.qty,
                    qty_delta_reserved: 0,
                    unit_cost: l.unit_cost,
                    line_notes: None,
                })
                .collect(),
        };

        let out = leg(MovementType::TransferOut, self.from_warehouse_id, -1);
        let inbound = leg(MovementType::TransferIn, self.to_warehouse_id, 1);
        out.validate()?;
        inbound.validate()?;
        Ok((out, inbound))
    }
}

/// A posted, immutable movement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockMovement {
    pub id: MovementId,
    pub movement_type: MovementType,
    pub reason_code: Option<String>,
    pub warehouse_id: WarehouseId,
    pub request_id: Option<Uuid>,
    pub reservation_id: Option<Uuid>,
    pub user_id: UserId,
    pub created_at: DateTime<Utc>,
    pub notes: Option<String>,
    pub lines: Vec<MovementLine>,
}

impl StockMovement {
    pub fn from_request(id: MovementId, request: PostMovement, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            movement_type: request.movement_type,
            reason_code: request.reason_code,
            warehouse_id: request.warehouse_id,
            request_id: request.request_id,
            reservation_id: request.reservation_id,
            user_id: request.user_id,
            created_at,
            notes: request.notes,
            lines: request.lines,
        }
    }
}

/// Event: MovementPosted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementPosted {
    pub movement_id: MovementId,
    pub movement_type: MovementType,
    pub warehouse_id: WarehouseId,
    pub request_id: Option<Uuid>,
    pub user_id: UserId,
    pub line_count: usize,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StockEvent {
    MovementPosted(MovementPosted),
}

impl StockEvent {
    pub fn posted(movement: &StockMovement) -> Self {
        StockEvent::MovementPosted(MovementPosted {
            movement_id: movement.id,
            movement_type: movement.movement_type,
            warehouse_id: movement.warehouse_id,
            request_id: movement.request_id,
            user_id: movement.user_id,
            line_count: movement.lines.len(),
            occurred_at: movement.created_at,
        })
    }
}

impl Event for StockEvent {
    fn event_type(&self) -> &'static str {
        match self {
            StockEvent::MovementPosted(_) => "stock.movement.posted",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            StockEvent::MovementPosted(e) => e.occurred_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(movement_type: MovementType, lines: Vec<MovementLine>) -> PostMovement {
        PostMovement::new(movement_type, WarehouseId::new(), UserId::new(), lines)
    }

    #[test]
    fn codes_parse_back_to_their_type() {
        for t in MovementType::ALL {
            assert_eq!(t.code().parse::<MovementType>().unwrap(), t);
        }
        assert!(matches!(
            "SHRINKAGE".parse::<MovementType>(),
            Err(StockError::UnknownMovementType(_))
        ));
    }

    #[test]
    fn line_signs_must_match_the_movement_type() {
        let p = ProductId::new();
        assert!(request(MovementType::Receipt, vec![MovementLine::receipt(p, 5)]).validate().is_ok());
        assert!(request(MovementType::Issue, vec![MovementLine::issue(p, 5)]).validate().is_ok());
        assert!(request(MovementType::Reserve, vec![MovementLine::reserve(p, 5)]).validate().is_ok());

        let err = request(MovementType::Receipt, vec![MovementLine::issue(p, 5)])
            .validate()
            .unwrap_err();
        assert!(matches!(err, StockError::Invalid { line: Some(0), .. }));

        let err = request(MovementType::Issue, vec![MovementLine::new(p, -1, 1)])
            .validate()
            .unwrap_err();
        assert!(matches!(err, StockError::Invalid { line: Some(0), .. }));
    }

    #[test]
    fn consume_reserve_requires_matching_magnitudes() {
        let p = ProductId::new();
        assert!(
            request(MovementType::ConsumeReserve, vec![MovementLine::consume_reserve(p, 3)])
                .validate()
                .is_ok()
        );
        assert!(
            request(MovementType::ConsumeReserve, vec![MovementLine::new(p, -3, -2)])
                .validate()
                .is_err()
        );
    }

    #[test]
    fn empty_movement_is_rejected() {
        let err = request(MovementType::Receipt, vec![]).validate().unwrap_err();
        assert!(matches!(err, StockError::Invalid { line: None, .. }));
    }

    #[test]
    fn transfer_splits_into_mirrored_legs() {
        let p = ProductId::new();
        let transfer = PostTransfer {
            from_warehouse_id: WarehouseId::new(),
            to_warehouse_id: WarehouseId::new(),
            reason_code: Some("REBALANCE".into()),
            user_id: UserId::new(),
            notes: None,
            lines: vec![TransferLine { product_id: p, qty: 4, unit_cost: None }],
        };
        let (out, inbound) = transfer.clone().into_legs().unwrap();

        assert_eq!(out.movement_type, MovementType::TransferOut);
        assert_eq!(out.warehouse_id, transfer.from_warehouse_id);
        assert_eq!(out.lines[0].qty_delta_on_hand, -4);
        assert_eq!(inbound.movement_type, MovementType::TransferIn);
        assert_eq!(inbound.warehouse_id, transfer.to_warehouse_id);
        assert_eq!(inbound.lines[0].qty_delta_on_hand, 4);
    }

    #[test]
    fn transfer_to_same_warehouse_is_rejected() {
        let w = WarehouseId::new();
        let transfer = PostTransfer {
            from_warehouse_id: w,
            to_warehouse_id: w,
            reason_code: None,
            user_id: UserId::new(),
            notes: None,
            lines: vec![TransferLine { product_id: ProductId::new(), qty: 1, unit_cost: None }],
        };
        assert!(transfer.into_legs().is_err());
    }
}
