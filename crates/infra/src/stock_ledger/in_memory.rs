use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use chrono::Utc;
use uuid::Uuid;

use invflow_core::MovementId;
use invflow_inventory::{StockKey, StockLevel, StockMovement, apply_lines};

use super::r#trait::{LedgerError, StockLedger};

#[derive(Debug, Default)]
struct Ledger {
    levels: BTreeMap<StockKey, StockLevel>,
    journal: Vec<StockMovement>,
}

/// In-memory stock ledger.
///
/// Intended for tests/dev. Commits run under one mutex and only touch the
/// rows the movements name.
#[derive(Debug, Default)]
pub struct InMemoryStockLedger {
    ledger: Mutex<Ledger>,
}

impl InMemoryStockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Ledger>, LedgerError> {
        self.ledger
            .lock()
            .map_err(|_| LedgerError::Backend("lock poisoned".to_string()))
    }

    pub fn journal_len(&self) -> usize {
        self.ledger.lock().map(|l| l.journal.len()).unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl StockLedger for InMemoryStockLedger {
    async fn commit(&self, movements: &[StockMovement]) -> Result<Vec<StockLevel>, LedgerError> {
        let now = Utc::now();
        let mut ledger = self.lock()?;

        let keys: BTreeSet<StockKey> = movements
            .iter()
            .flat_map(|m| m.lines.iter().map(|l| StockKey::new(m.warehouse_id, l.product_id)))
            .collect();
        let mut working: BTreeMap<StockKey, StockLevel> = keys
            .iter()
            .filter_map(|k| ledger.levels.get(k).map(|l| (*k, l.clone())))
            .collect();

        for movement in movements {
            apply_lines(&mut working, movement.warehouse_id, &movement.lines, now)?;
        }

        let updated: Vec<StockLevel> = working.values().cloned().collect();
        ledger.levels.extend(working);
        ledger.journal.extend(movements.iter().cloned());
        Ok(updated)
    }

    async fn level(&self, key: StockKey) -> Result<Option<StockLevel>, LedgerError> {
        Ok(self.lock()?.levels.get(&key).cloned())
    }

    async fn movement(&self, id: MovementId) -> Result<Option<StockMovement>, LedgerError> {
        Ok(self.lock()?.journal.iter().find(|m| m.id == id).cloned())
    }

    async fn movements_for_request(&self, request_id: Uuid) -> Result<Vec<StockMovement>, LedgerError> {
        Ok(self
            .lock()?
            .journal
            .iter()
            .filter(|m| m.request_id == Some(request_id))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use invflow_core::{MovementId, ProductId, UserId, WarehouseId};
    use invflow_inventory::{MovementLine, MovementType, PostMovement, StockError};

    fn movement(kind: MovementType, wh: WarehouseId, lines: Vec<MovementLine>) -> StockMovement {
        StockMovement::from_request(
            MovementId::new(),
            PostMovement::new(kind, wh, UserId::new(), lines),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn failed_commit_writes_nothing() {
        let ledger = InMemoryStockLedger::new();
        let wh = WarehouseId::new();
        let (p1, p2) = (ProductId::new(), ProductId::new());

        ledger
            .commit(&[movement(MovementType::Receipt, wh, vec![MovementLine::receipt(p1, 5)])])
            .await
            .unwrap();

        let err = ledger
            .commit(&[movement(
                MovementType::Issue,
                wh,
                vec![MovementLine::issue(p1, 2), MovementLine::issue(p2, 1)],
            )])
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Stock(StockError::InsufficientStock { line: 1, .. })));

        let level = ledger.level(StockKey::new(wh, p1)).await.unwrap().unwrap();
        assert_eq!(level.on_hand, 5);
        assert_eq!(level.version, 1);
        assert!(ledger.level(StockKey::new(wh, p2)).await.unwrap().is_none());
        assert_eq!(ledger.journal_len(), 1);
    }

    #[tokio::test]
    async fn movements_are_found_by_request() {
        let ledger = InMemoryStockLedger::new();
        let wh = WarehouseId::new();
        let request_id = Uuid::now_v7();
        let mut m = movement(MovementType::Receipt, wh, vec![MovementLine::receipt(ProductId::new(), 3)]);
        m.request_id = Some(request_id);
        let id = m.id;

        ledger.commit(&[m]).await.unwrap();
        assert_eq!(ledger.movements_for_request(request_id).await.unwrap().len(), 1);
        assert!(ledger.movement(id).await.unwrap().is_some());
    }
}
