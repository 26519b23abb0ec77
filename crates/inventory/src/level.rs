use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use invflow_core::{AggregateRoot, ProductId, WarehouseId};

use crate::error::{Shortfall, StockError};
use crate::movement::MovementLine;

/// Identity of a stock level row. Ordered so lock acquisition can be sorted.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StockKey {
    pub warehouse_id: WarehouseId,
    pub product_id: ProductId,
}

impl StockKey {
    pub fn new(warehouse_id: WarehouseId, product_id: ProductId) -> Self {
        Self {
            warehouse_id,
            product_id,
        }
    }
}

impl core::fmt::Display for StockKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.warehouse_id, self.product_id)
    }
}

/// Aggregate root: current quantity of one product in one warehouse.
///
/// Invariants (checked on every change, never relaxed):
/// - `on_hand >= 0`
/// - `reserved >= 0`
/// - `reserved <= on_hand`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLevel {
    #[serde(flatten)]
    pub key: StockKey,
    pub on_hand: i64,
    pub reserved: i64,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl StockLevel {
    /// A level that has never seen a movement.
    pub fn empty(key: StockKey, now: DateTime<Utc>) -> Self {
        Self {
            key,
            on_hand: 0,
            reserved: 0,
            version: 0,
            updated_at: now,
        }
    }

    pub fn warehouse_id(&self) -> WarehouseId {
        self.key.warehouse_id
    }

    pub fn product_id(&self) -> ProductId {
        self.key.product_id
    }

    pub fn available(&self) -> i64 {
        self.on_hand - self.reserved
    }

    pub fn holds_invariants(&self) -> bool {
        self.on_hand >= 0 && self.reserved >= 0 && self.reserved <= self.on_hand
    }

    /// Apply one line's deltas if the result keeps every invariant.
    /// On error `self` is left unchanged.
    pub fn apply_line(&mut self, index: usize, line: &MovementLine) -> Result<(), StockError> {
        let overflow = || StockError::invalid_line(index, "quantity overflow");
        let on_hand = self
            .on_hand
            .checked_add(line.qty_delta_on_hand)
            .ok_or_else(overflow)?;
        let reserved = self
            .reserved
            .checked_add(line.qty_delta_reserved)
            .ok_or_else(overflow)?;

        let short = |shortfall, requested, available| StockError::InsufficientStock {
            line: index,
            product_id: line.product_id,
            shortfall,
            requested,
            available,
        };

        if on_hand < 0 {
            return Err(short(Shortfall::OnHand, -line.qty_delta_on_hand, self.on_hand));
        }
        if reserved < 0 {
            return Err(short(Shortfall::Reserved, -line.qty_delta_reserved, self.reserved));
        }
        if on_hand < reserved {
            return Err(short(
                Shortfall::Available,
                line.qty_delta_reserved - line.qty_delta_on_hand,
                self.available(),
            ));
        }

        self.on_hand = on_hand;
        self.reserved = reserved;
        Ok(())
    }
}

impl AggregateRoot for StockLevel {
    type Id = StockKey;

    fn id(&self) -> &Self::Id {
        &self.key
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Apply `lines` for `warehouse_id` to `levels`, all or nothing.
///
/// Missing rows are created empty. Several lines for the same product
/// accumulate in order. Every touched row gets its version bumped once and
/// is returned in key order. On error `levels` is untouched.
pub fn apply_lines(
    levels: &mut BTreeMap<StockKey, StockLevel>,
    warehouse_id: WarehouseId,
    lines: &[MovementLine],
    now: DateTime<Utc>,
) -> Result<Vec<StockLevel>, StockError> {
    let mut working = levels.clone();
    let mut touched = BTreeSet::new();

    for (idx, line) in lines.iter().enumerate() {
        let key = StockKey::new(warehouse_id, line.product_id);
        let level = working
            .entry(key)
            .or_insert_with(|| StockLevel::empty(key, now));
        level.apply_line(idx, line)?;
        touched.insert(key);
    }

    let mut updated = Vec::with_capacity(touched.len());
    for key in touched {
        if let Some(level) = working.get_mut(&key) {
            level.version += 1;
            level.updated_at = now;
            updated.push(level.clone());
        }
    }
    *levels = working;
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::movement::MovementType;
    use proptest::prelude::*;

    fn seeded(on_hand: i64, reserved: i64) -> (BTreeMap<StockKey, StockLevel>, StockKey) {
        let key = StockKey::new(WarehouseId::new(), ProductId::new());
        let mut level = StockLevel::empty(key, Utc::now());
        level.on_hand = on_hand;
        level.reserved = reserved;
        level.version = 1;
        (BTreeMap::from([(key, level)]), key)
    }

    #[test]
    fn issue_cannot_consume_reserved_stock() {
        let (mut levels, key) = seeded(10, 2);

        let err = apply_lines(
            &mut levels,
            key.warehouse_id,
            &[MovementLine::issue(key.product_id, 9)],
            Utc::now(),
        )
        .unwrap_err();
        match err {
            StockError::InsufficientStock {
                shortfall: Shortfall::Available,
                requested: 9,
                available: 8,
                ..
            } => {}
            other => panic!("expected available shortfall, got {other:?}"),
        }
        assert_eq!(levels[&key].on_hand, 10);
        assert_eq!(levels[&key].version, 1);

        let updated = apply_lines(
            &mut levels,
            key.warehouse_id,
            &[MovementLine::issue(key.product_id, 8)],
            Utc::now(),
        )
        .unwrap();
        assert_eq!(updated.len(), 1);
        assert_eq!((levels[&key].on_hand, levels[&key].reserved), (2, 2));
        assert_eq!(levels[&key].version, 2);
    }

    #[test]
    fn failing_line_rolls_back_earlier_lines() {
        let (mut levels, key) = seeded(5, 0);
        let other = ProductId::new();
        let before = levels.clone();

        let err = apply_lines(
            &mut levels,
            key.warehouse_id,
            &[
                MovementLine::issue(key.product_id, 5),
                MovementLine::issue(other, 1),
            ],
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            StockError::InsufficientStock { line: 1, shortfall: Shortfall::OnHand, .. }
        ));
        assert_eq!(levels, before);
    }

    #[test]
    fn lines_for_the_same_product_accumulate() {
        let (mut levels, key) = seeded(0, 0);
        let updated = apply_lines(
            &mut levels,
            key.warehouse_id,
            &[
                MovementLine::receipt(key.product_id, 3),
                MovementLine::receipt(key.product_id, 4),
            ],
            Utc::now(),
        )
        .unwrap();
        assert_eq!(updated.len(), 1);
        assert_eq!(levels[&key].on_hand, 7);
        assert_eq!(levels[&key].version, 2);
    }

    #[test]
    fn release_beyond_reserved_is_a_reserved_shortfall() {
        let (mut levels, key) = seeded(10, 2);
        let err = apply_lines(
            &mut levels,
            key.warehouse_id,
            &[MovementLine::release(key.product_id, 3)],
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            StockError::InsufficientStock { shortfall: Shortfall::Reserved, .. }
        ));
    }

    fn line_for(t: MovementType, product_id: ProductId, qty: i64) -> MovementLine {
        match t {
            MovementType::Receipt | MovementType::AdjustmentIn | MovementType::ReturnIn => {
                MovementLine::receipt(product_id, qty)
            }
            MovementType::Issue | MovementType::AdjustmentOut | MovementType::ReturnOut => {
                MovementLine::issue(product_id, qty)
            }
            MovementType::Reserve => MovementLine::reserve(product_id, qty),
            MovementType::Release => MovementLine::release(product_id, qty),
            _ => MovementLine::consume_reserve(product_id, qty),
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: whatever sequence of movements is attempted, accepted
        /// ones never leave a level negative or over-reserved.
        #[test]
        fn invariants_hold_for_any_movement_sequence(
            ops in prop::collection::vec((0usize..8, 1i64..50), 1..60)
        ) {
            let kinds = [
                MovementType::Receipt,
                MovementType::Issue,
                MovementType::Reserve,
                MovementType::Release,
                MovementType::ConsumeReserve,
                MovementType::AdjustmentIn,
                MovementType::AdjustmentOut,
                MovementType::ReturnIn,
            ];
            let (mut levels, key) = seeded(0, 0);

            for (kind, qty) in ops {
                let t = kinds[kind];
                let line = line_for(t, key.product_id, qty);
                prop_assert!(t.check_line(0, &line).is_ok());
                let before = levels[&key].clone();
                match apply_lines(&mut levels, key.warehouse_id, &[line], Utc::now()) {
                    Ok(_) => prop_assert_eq!(levels[&key].version, before.version + 1),
                    Err(_) => prop_assert_eq!(&levels[&key], &before),
                }
                prop_assert!(levels[&key].holds_invariants());
            }
        }
    }
}
