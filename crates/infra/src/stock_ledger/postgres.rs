//! Postgres-backed stock ledger.
//!
//! A commit runs in one transaction. Every touched `stock_levels` row is
//! locked with `SELECT .. FOR UPDATE` in `(warehouse_id, product_id)` order, so
//! concurrent commits never deadlock on each other and a pre-check always sees
//! the latest committed quantities. The table's CHECK constraints mirror the
//! in-process invariants.
//!
//! | PostgreSQL code | Meaning | Mapped to |
//! |-----------------|---------|-----------|
//! | `55P03` | `lock_timeout` expired | `LedgerError::Busy` |
//! | `40001`, `40P01` | serialization failure, deadlock | `LedgerError::Conflict` |
//! | `23514` | CHECK constraint (quantity invariant) | `LedgerError::Backend` |
//! | other | - | `LedgerError::Backend` |

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use invflow_core::{MovementId, ProductId, UserId, WarehouseId};
use invflow_inventory::{MovementLine, MovementType, StockKey, StockLevel, StockMovement, apply_lines};

use super::r#trait::{LedgerError, StockLedger};

#[derive(Debug, Clone)]
pub struct PostgresStockLedger {
    pool: Arc<PgPool>,
    lock_timeout: Duration,
}

impl PostgresStockLedger {
    pub fn new(pool: PgPool, lock_timeout: Duration) -> Self {
        Self::from_shared(Arc::new(pool), lock_timeout)
    }

    pub fn from_shared(pool: Arc<PgPool>, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    async fn lock_rows(
        tx: &mut Transaction<'_, Postgres>,
        keys: &BTreeSet<StockKey>,
    ) -> Result<BTreeMap<StockKey, StockLevel>, LedgerError> {
        let now = Utc::now();
        let mut levels = BTreeMap::new();

        for key in keys {
            sqlx::query(
                r#"
                INSERT INTO stock_levels (warehouse_id, product_id, on_hand, reserved, version, updated_at)
                VALUES ($1, $2, 0, 0, 0, $3)
                ON CONFLICT (warehouse_id, product_id) DO NOTHING
                "#,
            )
            .bind(key.warehouse_id.as_uuid())
            .bind(key.product_id.as_uuid())
            .bind(now)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("insert_level", e))?;

            let row = sqlx::query(
                r#"
                SELECT warehouse_id, product_id, on_hand, reserved, version, updated_at
                FROM stock_levels
                WHERE warehouse_id = $1 AND product_id = $2
                FOR UPDATE
                "#,
            )
            .bind(key.warehouse_id.as_uuid())
            .bind(key.product_id.as_uuid())
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("lock_level", e))?;

            let level = level_from_row(&row)?;
            // Placeholder rows count as absent so version numbering starts at 1.
            if level.version > 0 {
                levels.insert(*key, level);
            }
        }
        Ok(levels)
    }

    async fn write_movement(
        tx: &mut Transaction<'_, Postgres>,
        movement: &StockMovement,
    ) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO stock_movements (
                id, movement_type, reason_code, warehouse_id, request_id,
                reservation_id, user_id, created_at, notes
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(movement.id.as_uuid())
        .bind(movement.movement_type.code())
        .bind(&movement.reason_code)
        .bind(movement.warehouse_id.as_uuid())
        .bind(movement.request_id)
        .bind(movement.reservation_id)
        .bind(movement.user_id.as_uuid())
        .bind(movement.created_at)
        .bind(&movement.notes)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("insert_movement", e))?;

        for (line_no, line) in movement.lines.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO stock_movement_lines (
                    movement_id, line_no, product_id, qty_delta_on_hand,
                    qty_delta_reserved, unit_cost, line_notes
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(movement.id.as_uuid())
            .bind(line_no as i32)
            .bind(line.product_id.as_uuid())
            .bind(line.qty_delta_on_hand)
            .bind(line.qty_delta_reserved)
            .bind(line.unit_cost)
            .bind(&line.line_notes)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("insert_movement_line", e))?;
        }
        Ok(())
    }

    async fn load_lines(&self, movement_id: Uuid) -> Result<Vec<MovementLine>, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT product_id, qty_delta_on_hand, qty_delta_reserved, unit_cost, line_notes
            FROM stock_movement_lines
            WHERE movement_id = $1
            ORDER BY line_no ASC
            "#,
        )
        .bind(movement_id)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_lines", e))?;

        let mut lines = Vec::with_capacity(rows.len());
        for row in &rows {
            lines.push(MovementLine {
                product_id: ProductId::from_uuid(row.try_get("product_id").map_err(decode)?),
                qty_delta_on_hand: row.try_get("qty_delta_on_hand").map_err(decode)?,
                qty_delta_reserved: row.try_get("qty_delta_reserved").map_err(decode)?,
                unit_cost: row.try_get("unit_cost").map_err(decode)?,
                line_notes: row.try_get("line_notes").map_err(decode)?,
            });
        }
        Ok(lines)
    }

    async fn hydrate(&self, row: &PgRow) -> Result<StockMovement, LedgerError> {
        let id: Uuid = row.try_get("id").map_err(decode)?;
        let movement_type: String = row.try_get("movement_type").map_err(decode)?;
        Ok(StockMovement {
            id: MovementId::from_uuid(id),
            movement_type: MovementType::from_str(&movement_type)?,
            reason_code: row.try_get("reason_code").map_err(decode)?,
            warehouse_id: WarehouseId::from_uuid(row.try_get("warehouse_id").map_err(decode)?),
            request_id: row.try_get("request_id").map_err(decode)?,
            reservation_id: row.try_get("reservation_id").map_err(decode)?,
            user_id: UserId::from_uuid(row.try_get("user_id").map_err(decode)?),
            created_at: row.try_get("created_at").map_err(decode)?,
            notes: row.try_get("notes").map_err(decode)?,
            lines: self.load_lines(id).await?,
        })
    }
}

#[async_trait::async_trait]
impl StockLedger for PostgresStockLedger {
    #[instrument(skip(self, movements), fields(movement_count = movements.len()), err)]
    async fn commit(&self, movements: &[StockMovement]) -> Result<Vec<StockLevel>, LedgerError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // SET does not take bind parameters; the value is a plain integer.
        sqlx::query(&format!(
            "SET LOCAL lock_timeout = '{}ms'",
            self.lock_timeout.as_millis()
        ))
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("set_lock_timeout", e))?;

        let keys: BTreeSet<StockKey> = movements
            .iter()
            .flat_map(|m| m.lines.iter().map(|l| StockKey::new(m.warehouse_id, l.product_id)))
            .collect();
        let mut working = Self::lock_rows(&mut tx, &keys).await?;

        let now = Utc::now();
        for movement in movements {
            // Dropping `tx` on the error path rolls back the placeholder rows.
            apply_lines(&mut working, movement.warehouse_id, &movement.lines, now)?;
        }

        for level in working.values() {
            sqlx::query(
                r#"
                UPDATE stock_levels
                SET on_hand = $3, reserved = $4, version = $5, updated_at = $6
                WHERE warehouse_id = $1 AND product_id = $2
                "#,
            )
            .bind(level.key.warehouse_id.as_uuid())
            .bind(level.key.product_id.as_uuid())
            .bind(level.on_hand)
            .bind(level.reserved)
            .bind(level.version as i64)
            .bind(level.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("update_level", e))?;
        }

        for movement in movements {
            Self::write_movement(&mut tx, movement).await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(working.into_values().collect())
    }

    async fn level(&self, key: StockKey) -> Result<Option<StockLevel>, LedgerError> {
        let row = sqlx::query(
            r#"
            SELECT warehouse_id, product_id, on_hand, reserved, version, updated_at
            FROM stock_levels
            WHERE warehouse_id = $1 AND product_id = $2 AND version > 0
            "#,
        )
        .bind(key.warehouse_id.as_uuid())
        .bind(key.product_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("level", e))?;

        row.as_ref().map(level_from_row).transpose()
    }

    async fn movement(&self, id: MovementId) -> Result<Option<StockMovement>, LedgerError> {
        let row = sqlx::query(
            r#"
            SELECT id, movement_type, reason_code, warehouse_id, request_id,
                   reservation_id, user_id, created_at, notes
            FROM stock_movements
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("movement", e))?;

        match row {
            Some(row) => Ok(Some(self.hydrate(&row).await?)),
            None => Ok(None),
        }
    }

    async fn movements_for_request(&self, request_id: Uuid) -> Result<Vec<StockMovement>, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT id, movement_type, reason_code, warehouse_id, request_id,
                   reservation_id, user_id, created_at, notes
            FROM stock_movements
            WHERE request_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(request_id)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("movements_for_request", e))?;

        let mut movements = Vec::with_capacity(rows.len());
        for row in &rows {
            movements.push(self.hydrate(row).await?);
        }
        Ok(movements)
    }
}

fn level_from_row(row: &PgRow) -> Result<StockLevel, LedgerError> {
    let version: i64 = row.try_get("version").map_err(decode)?;
    Ok(StockLevel {
        key: StockKey::new(
            WarehouseId::from_uuid(row.try_get("warehouse_id").map_err(decode)?),
            ProductId::from_uuid(row.try_get("product_id").map_err(decode)?),
        ),
        on_hand: row.try_get("on_hand").map_err(decode)?,
        reserved: row.try_get("reserved").map_err(decode)?,
        version: u64::try_from(version).unwrap_or_default(),
        updated_at: row.try_get("updated_at").map_err(decode)?,
    })
}

fn decode(err: sqlx::Error) -> LedgerError {
    LedgerError::Backend(format!("failed to decode ledger row: {err}"))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LedgerError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("55P03") => LedgerError::Busy(msg),
                Some("40001") | Some("40P01") => LedgerError::Conflict(msg),
                _ => LedgerError::Backend(msg),
            }
        }
        sqlx::Error::PoolTimedOut => {
            LedgerError::Busy(format!("connection pool timed out in {operation}"))
        }
        sqlx::Error::PoolClosed => {
            LedgerError::Backend(format!("connection pool closed in {operation}"))
        }
        other => LedgerError::Backend(format!("sqlx error in {operation}: {other}")),
    }
}
