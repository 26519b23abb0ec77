//! Stock Ledger Posting Engine.
//!
//! ```text
//! PostMovement
//!   ↓
//! 1. Idempotency gate (replay / in-flight / insert)
//!   ↓
//! 2. Validate line semantics, authorize (stock.post, stock.adjust)
//!   ↓
//! 3. Lock every touched (warehouse, product) row in key order
//!   ↓
//! 4. Ledger commit: pre-checks + invariants + journal, all or nothing
//!   ↓
//! 5. Publish `stock.movement.posted`, audit (best-effort)
//! ```
//!
//! Two concurrent ISSUEs on the same row serialize on step 3, so the second
//! pre-check always sees the first one's result.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use tracing::instrument;

use invflow_auth::{AccessScope, Authorizer, Permission, require};
use invflow_core::MovementId;
use invflow_events::{EventBus, EventEnvelope};
use invflow_inventory::{
    PostMovement, PostTransfer, StockError, StockEvent, StockKey, StockLevel, StockMovement,
};

use crate::audit::{self, AuditEntry, AuditSink};
use crate::call::CallOptions;
use crate::config::EngineConfig;
use crate::error::{EngineError, trace_failure};
use crate::idempotency::IdempotencyGate;
use crate::locks::KeyedLocks;
use crate::stock_ledger::StockLedger;

pub const POST_MOVEMENT_ROUTE: &str = "stock.post_movement";
pub const POST_TRANSFER_ROUTE: &str = "stock.post_transfer";
/// Route of postings the workflow engine triggers on its own.
pub const WORKFLOW_POSTING_ROUTE: &str = "workflow.posting";

const MOVEMENT_AGGREGATE: &str = "stock.movement";

/// Both legs of a committed transfer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferPosted {
    pub out_movement_id: MovementId,
    pub in_movement_id: MovementId,
}

pub struct PostingEngine<B> {
    ledger: Arc<dyn StockLedger>,
    gate: Arc<IdempotencyGate>,
    authorizer: Arc<dyn Authorizer>,
    audit: Arc<dyn AuditSink>,
    bus: B,
    locks: KeyedLocks<StockKey>,
    commit_retries: u32,
}

impl<B> PostingEngine<B>
where
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub fn new(
        ledger: Arc<dyn StockLedger>,
        gate: Arc<IdempotencyGate>,
        authorizer: Arc<dyn Authorizer>,
        audit: Arc<dyn AuditSink>,
        bus: B,
        config: &EngineConfig,
    ) -> Self {
        Self {
            ledger,
            gate,
            authorizer,
            audit,
            bus,
            locks: KeyedLocks::new(config.lock_timeout),
            commit_retries: config.commit_retries,
        }
    }

    /// Post one movement. TRANSFER_OUT / TRANSFER_IN are only accepted as a
    /// pair through [`PostingEngine::post_transfer`].
    #[instrument(
        skip(self, request, opts),
        fields(
            movement_type = %request.movement_type,
            warehouse_id = %request.warehouse_id,
            user_id = %request.user_id,
            line_count = request.lines.len()
        )
    )]
    pub async fn post_movement(
        &self,
        request: PostMovement,
        opts: CallOptions,
    ) -> Result<MovementId, EngineError> {
        let user = request.user_id;
        let result = self
            .gate
            .run(opts.key(), user, POST_MOVEMENT_ROUTE, opts.deadline, || async move {
                request.validate()?;
                if request.movement_type.is_transfer() {
                    return Err(EngineError::validation(format!(
                        "{} must be posted as half of a transfer",
                        request.movement_type
                    )));
                }
                self.authorize(&request)?;
                let movement = StockMovement::from_request(MovementId::new(), request, Utc::now());
                let id = movement.id;
                self.commit(vec![movement]).await?;
                Ok::<_, EngineError>(id)
            })
            .await;
        trace_failure(POST_MOVEMENT_ROUTE, &result);
        result
    }

    /// Post TRANSFER_OUT at the source and TRANSFER_IN at the destination as
    /// one atomic commit.
    #[instrument(
        skip(self, request, opts),
        fields(
            from = %request.from_warehouse_id,
            to = %request.to_warehouse_id,
            user_id = %request.user_id
        )
    )]
    pub async fn post_transfer(
        &self,
        request: PostTransfer,
        opts: CallOptions,
    ) -> Result<TransferPosted, EngineError> {
        let user = request.user_id;
        let result = self
            .gate
            .run(opts.key(), user, POST_TRANSFER_ROUTE, opts.deadline, || async move {
                let (out, inbound) = request.into_legs()?;
                self.authorize(&out)?;
                self.authorize(&inbound)?;

                let now = Utc::now();
                let out = StockMovement::from_request(MovementId::new(), out, now);
                let inbound = StockMovement::from_request(MovementId::new(), inbound, now);
                let posted = TransferPosted {
                    out_movement_id: out.id,
                    in_movement_id: inbound.id,
                };
                self.commit(vec![out, inbound]).await?;
                Ok::<_, EngineError>(posted)
            })
            .await;
        trace_failure(POST_TRANSFER_ROUTE, &result);
        result
    }

    /// Post on behalf of the workflow engine. The step that triggered the
    /// posting already authorized the actor; `key` makes retries replay.
    pub(crate) async fn post_for_workflow(
        &self,
        request: PostMovement,
        key: &str,
    ) -> Result<MovementId, EngineError> {
        let user = request.user_id;
        self.gate
            .run_until_success(key, user, WORKFLOW_POSTING_ROUTE, || async move {
                request.validate()?;
                if request.movement_type.is_transfer() {
                    return Err(StockError::invalid("workflow postings cannot be transfers").into());
                }
                let movement = StockMovement::from_request(MovementId::new(), request, Utc::now());
                let id = movement.id;
                self.commit(vec![movement]).await?;
                Ok::<_, EngineError>(id)
            })
            .await
    }

    pub async fn stock_level(&self, key: StockKey) -> Result<Option<StockLevel>, EngineError> {
        Ok(self.ledger.level(key).await?)
    }

    pub async fn movement(&self, id: MovementId) -> Result<StockMovement, EngineError> {
        self.ledger
            .movement(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("stock movement {id}")))
    }

    /// Hold the row locks of `keys`, as a posting in progress would.
    #[cfg(test)]
    pub(crate) async fn hold_rows(
        &self,
        keys: impl IntoIterator<Item = StockKey>,
    ) -> Result<crate::locks::LockSet, EngineError> {
        self.locks.acquire_all(keys).await
    }

    fn authorize(&self, request: &PostMovement) -> Result<(), EngineError> {
        let warehouse = Some(*request.warehouse_id.as_uuid());
        require(
            &*self.authorizer,
            request.user_id,
            &Permission::STOCK_POST,
            Some(AccessScope::Warehouse),
            warehouse,
        )?;
        if request.movement_type.is_privileged() {
            require(
                &*self.authorizer,
                request.user_id,
                &Permission::STOCK_ADJUST,
                Some(AccessScope::Warehouse),
                warehouse,
            )?;
        }
        Ok(())
    }

    async fn commit(&self, movements: Vec<StockMovement>) -> Result<Vec<StockLevel>, EngineError> {
        let keys: Vec<StockKey> = movements
            .iter()
            .flat_map(|m| m.lines.iter().map(|l| StockKey::new(m.warehouse_id, l.product_id)))
            .collect();
        let rows = self.locks.acquire_all(keys).await?;

        let mut attempt = 0;
        let levels = loop {
            match self.ledger.commit(&movements).await {
                Ok(levels) => break levels,
                Err(e) if e.is_conflict() && attempt < self.commit_retries => {
                    attempt += 1;
                    tracing::debug!(attempt, error = %e, "ledger conflict; retrying commit");
                }
                Err(e) => return Err(e.into()),
            }
        };
        drop(rows);

        for movement in &movements {
            tracing::info!(
                movement_id = %movement.id,
                movement_type = %movement.movement_type,
                warehouse_id = %movement.warehouse_id,
                "stock movement posted"
            );
            self.publish(movement);
            audit::record(
                &*self.audit,
                AuditEntry {
                    user_id: movement.user_id,
                    action: "stock.movement.post".to_string(),
                    entity_id: *movement.id.as_uuid(),
                    old_value: None,
                    new_value: Some(json!({
                        "movement_type": movement.movement_type,
                        "warehouse_id": movement.warehouse_id,
                        "lines": movement.lines,
                        "levels": levels
                            .iter()
                            .filter(|l| l.key.warehouse_id == movement.warehouse_id)
                            .collect::<Vec<_>>(),
                    })),
                    at: movement.created_at,
                },
            );
        }
        Ok(levels)
    }

    fn publish(&self, movement: &StockMovement) {
        let envelope = match EventEnvelope::from_event(
            *movement.id.as_uuid(),
            MOVEMENT_AGGREGATE,
            1,
            &StockEvent::posted(movement),
        ) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(movement_id = %movement.id, error = %e, "failed to encode stock event");
                return;
            }
        };
        if let Err(e) = self.bus.publish(envelope) {
            tracing::warn!(movement_id = %movement.id, error = ?e, "failed to publish stock event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use invflow_auth::{Grant, StaticAuthorizer};
    use invflow_core::{ProductId, UserId, WarehouseId};
    use invflow_events::InMemoryEventBus;
    use invflow_inventory::{MovementLine, MovementType, TransferLine};

    use crate::audit::InMemoryAuditSink;
    use crate::idempotency::InMemoryIdempotencyStore;
    use crate::stock_ledger::InMemoryStockLedger;

    type Bus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;

    struct Fixture {
        engine: PostingEngine<Bus>,
        authz: Arc<StaticAuthorizer>,
        bus: Bus,
        clerk: UserId,
        wh: WarehouseId,
    }

    fn fixture() -> Fixture {
        let clerk = UserId::new();
        let wh = WarehouseId::new();
        let authz = Arc::new(StaticAuthorizer::new().with_grant(clerk, Grant::warehouse(Permission::STOCK_POST, wh)));
        let bus: Bus = Arc::new(InMemoryEventBus::new());
        let gate = Arc::new(IdempotencyGate::new(
            Arc::new(InMemoryIdempotencyStore::new()),
            Duration::from_secs(60),
        ));
        let engine = PostingEngine::new(
            Arc::new(InMemoryStockLedger::new()),
            gate,
            authz.clone(),
            Arc::new(InMemoryAuditSink::new()),
            bus.clone(),
            &EngineConfig::default(),
        );
        Fixture {
            engine,
            authz,
            bus,
            clerk,
            wh,
        }
    }

    impl Fixture {
        async fn on_hand(&self, wh: WarehouseId, product: ProductId) -> i64 {
            self.engine
                .stock_level(StockKey::new(wh, product))
                .await
                .unwrap()
                .map_or(0, |l| l.on_hand)
        }
    }

    #[tokio::test]
    async fn receipt_is_posted_and_published() {
        let f = fixture();
        let events = f.bus.subscribe();
        let p = ProductId::new();

        let id = f
            .engine
            .post_movement(
                PostMovement::new(MovementType::Receipt, f.wh, f.clerk, vec![MovementLine::receipt(p, 4)]),
                CallOptions::new(),
            )
            .await
            .unwrap();

        assert_eq!(f.on_hand(f.wh, p).await, 4);
        assert_eq!(f.engine.movement(id).await.unwrap().lines.len(), 1);
        let published = events.drain();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].event_type(), "stock.movement.posted");
    }

    #[tokio::test]
    async fn posting_requires_warehouse_permission() {
        let f = fixture();
        let other_wh = WarehouseId::new();
        let err = f
            .engine
            .post_movement(
                PostMovement::new(
                    MovementType::Receipt,
                    other_wh,
                    f.clerk,
                    vec![MovementLine::receipt(ProductId::new(), 1)],
                ),
                CallOptions::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "forbidden");
    }

    #[tokio::test]
    async fn adjustments_need_stock_adjust() {
        let f = fixture();
        let request = PostMovement::new(
            MovementType::AdjustmentIn,
            f.wh,
            f.clerk,
            vec![MovementLine::receipt(ProductId::new(), 2)],
        );

        let err = f.engine.post_movement(request.clone(), CallOptions::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::Forbidden(_)));

        f.authz.grant(f.clerk, Grant::warehouse(Permission::STOCK_ADJUST, f.wh));
        assert!(f.engine.post_movement(request, CallOptions::new()).await.is_ok());
    }

    #[tokio::test]
    async fn single_transfer_leg_is_rejected() {
        let f = fixture();
        let err = f
            .engine
            .post_movement(
                PostMovement::new(
                    MovementType::TransferIn,
                    f.wh,
                    f.clerk,
                    vec![MovementLine::receipt(ProductId::new(), 2)],
                ),
                CallOptions::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn transfer_moves_stock_or_nothing() {
        let f = fixture();
        let dest = WarehouseId::new();
        f.authz.grant(f.clerk, Grant::warehouse(Permission::STOCK_POST, dest));
        let p = ProductId::new();
        f.engine
            .post_movement(
                PostMovement::new(MovementType::Receipt, f.wh, f.clerk, vec![MovementLine::receipt(p, 5)]),
                CallOptions::new(),
            )
            .await
            .unwrap();

        let transfer = |qty| PostTransfer {
            from_warehouse_id: f.wh,
            to_warehouse_id: dest,
            reason_code: None,
            user_id: f.clerk,
            notes: None,
            lines: vec![TransferLine {
                product_id: p,
                qty,
                unit_cost: None,
            }],
        };

        let err = f.engine.post_transfer(transfer(6), CallOptions::new()).await.unwrap_err();
        assert_eq!(err.code(), "insufficient_stock");
        assert_eq!(f.on_hand(dest, p).await, 0);

        f.engine.post_transfer(transfer(3), CallOptions::new()).await.unwrap();
        assert_eq!(f.on_hand(f.wh, p).await, 2);
        assert_eq!(f.on_hand(dest, p).await, 3);
    }

    #[tokio::test]
    async fn keyed_retries_post_once() {
        let f = fixture();
        let p = ProductId::new();
        let request = PostMovement::new(MovementType::Receipt, f.wh, f.clerk, vec![MovementLine::receipt(p, 5)]);
        let opts = CallOptions::new().with_idempotency_key("receipt-1");

        let first = f.engine.post_movement(request.clone(), opts.clone()).await.unwrap();
        let second = f.engine.post_movement(request, opts).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(f.on_hand(f.wh, p).await, 5);
    }
}
