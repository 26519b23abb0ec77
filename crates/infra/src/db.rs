//! Postgres pool and schema bootstrap for the persistent stores.

use sqlx::PgPool;

use crate::error::EngineError;

const SCHEMA: &[(&str, &str)] = &[
    (
        "idempotency_records",
        r#"
        CREATE TABLE IF NOT EXISTS idempotency_records (
            id UUID PRIMARY KEY,
            idem_key TEXT NOT NULL,
            user_id UUID NOT NULL,
            route_key TEXT NOT NULL,
            status TEXT NOT NULL,
            status_code INT,
            body JSONB,
            created_at TIMESTAMPTZ NOT NULL,
            expires_at TIMESTAMPTZ NOT NULL,
            UNIQUE (idem_key, user_id, route_key)
        )
        "#,
    ),
    (
        "idempotency_records_expires_at_idx",
        "CREATE INDEX IF NOT EXISTS idempotency_records_expires_at_idx ON idempotency_records (expires_at)",
    ),
    (
        "stock_levels",
        r#"
        CREATE TABLE IF NOT EXISTS stock_levels (
            warehouse_id UUID NOT NULL,
            product_id UUID NOT NULL,
            on_hand BIGINT NOT NULL,
            reserved BIGINT NOT NULL,
            version BIGINT NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (warehouse_id, product_id),
            CHECK (on_hand >= 0),
            CHECK (reserved >= 0),
            CHECK (on_hand - reserved >= 0)
        )
        "#,
    ),
    (
        "stock_movements",
        r#"
        CREATE TABLE IF NOT EXISTS stock_movements (
            id UUID PRIMARY KEY,
            movement_type TEXT NOT NULL,
            reason_code TEXT,
            warehouse_id UUID NOT NULL,
            request_id UUID,
            reservation_id UUID,
            user_id UUID NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            notes TEXT
        )
        "#,
    ),
    (
        "stock_movements_request_id_idx",
        "CREATE INDEX IF NOT EXISTS stock_movements_request_id_idx ON stock_movements (request_id)",
    ),
    (
        "stock_movement_lines",
        r#"
        CREATE TABLE IF NOT EXISTS stock_movement_lines (
            movement_id UUID NOT NULL REFERENCES stock_movements (id),
            line_no INT NOT NULL,
            product_id UUID NOT NULL,
            qty_delta_on_hand BIGINT NOT NULL,
            qty_delta_reserved BIGINT NOT NULL,
            unit_cost BIGINT,
            line_notes TEXT,
            PRIMARY KEY (movement_id, line_no)
        )
        "#,
    ),
];

pub async fn connect(database_url: &str) -> Result<PgPool, EngineError> {
    PgPool::connect(database_url).await.map_err(|e| {
        tracing::error!(error = %e, "failed to connect to Postgres");
        EngineError::store(format!("connect: {e}"))
    })
}

/// Create the idempotency and stock ledger tables when missing.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), EngineError> {
    for (name, ddl) in SCHEMA {
        sqlx::query(ddl)
            .execute(pool)
            .await
            .map_err(|e| EngineError::store(format!("create {name}: {e}")))?;
    }
    tracing::debug!(objects = SCHEMA.len(), "schema ensured");
    Ok(())
}
