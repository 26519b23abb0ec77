//! Postgres-backed idempotency store.
//!
//! Uniqueness is enforced by the `(idem_key, user_id, route_key)` constraint.
//! The insert uses `ON CONFLICT DO NOTHING`, so two processes racing on the
//! same key see a single winner and the loser reads the existing row.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;

use invflow_core::{IdempotencyRecordId, UserId};

use super::r#trait::{
    CheckOutcome, IdempotencyError, IdempotencyKey, IdempotencyRecord, IdempotencyStore,
    RecordStatus,
};

#[derive(Debug, Clone)]
pub struct PostgresIdempotencyStore {
    pool: Arc<PgPool>,
}

impl PostgresIdempotencyStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn from_shared(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    async fn find_by_key(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, IdempotencyError> {
        let row = sqlx::query(
            r#"
            SELECT id, idem_key, user_id, route_key, status, status_code, body, created_at, expires_at
            FROM idempotency_records
            WHERE idem_key = $1 AND user_id = $2 AND route_key = $3
            "#,
        )
        .bind(&key.key)
        .bind(key.user_id.as_uuid())
        .bind(&key.route_key)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_by_key", e))?;

        row.as_ref().map(record_from_row).transpose()
    }
}

#[async_trait::async_trait]
impl IdempotencyStore for PostgresIdempotencyStore {
    #[instrument(skip(self, key), fields(route = %key.route_key, user_id = %key.user_id), err)]
    async fn check_or_insert(
        &self,
        key: &IdempotencyKey,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<CheckOutcome, IdempotencyError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query(
            r#"
            DELETE FROM idempotency_records
            WHERE idem_key = $1 AND user_id = $2 AND route_key = $3 AND expires_at <= $4
            "#,
        )
        .bind(&key.key)
        .bind(key.user_id.as_uuid())
        .bind(&key.route_key)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("delete_expired_key", e))?;

        let record = IdempotencyRecord::processing(key.clone(), now, ttl);
        let inserted = sqlx::query(
            r#"
            INSERT INTO idempotency_records (
                id, idem_key, user_id, route_key, status, created_at, expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (idem_key, user_id, route_key) DO NOTHING
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(&key.key)
        .bind(key.user_id.as_uuid())
        .bind(&key.route_key)
        .bind(RecordStatus::Processing.code())
        .bind(record.created_at)
        .bind(record.expires_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_record", e))?
        .rows_affected();

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        if inserted == 1 {
            return Ok(CheckOutcome::Inserted(record.id));
        }

        match self.find_by_key(key).await? {
            Some(existing) => Ok(existing.outcome()),
            // Released between our insert attempt and the lookup.
            None => Err(IdempotencyError::Backend(
                "idempotency record vanished during check; retry".to_string(),
            )),
        }
    }

    #[instrument(skip(self, body), fields(record_id = %id), err)]
    async fn update_response(
        &self,
        id: IdempotencyRecordId,
        status_code: u16,
        body: JsonValue,
    ) -> Result<(), IdempotencyError> {
        let updated = sqlx::query(
            r#"
            UPDATE idempotency_records
            SET status = $2, status_code = $3, body = $4
            WHERE id = $1 AND status = $5
            "#,
        )
        .bind(id.as_uuid())
        .bind(RecordStatus::Completed.code())
        .bind(i32::from(status_code))
        .bind(&body)
        .bind(RecordStatus::Processing.code())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_response", e))?
        .rows_affected();

        if updated == 1 {
            return Ok(());
        }
        match self.get(id).await? {
            Some(_) => Err(IdempotencyError::NotProcessing(id)),
            None => Err(IdempotencyError::NotFound(id)),
        }
    }

    #[instrument(skip(self), fields(record_id = %id), err)]
    async fn release(&self, id: IdempotencyRecordId) -> Result<(), IdempotencyError> {
        let deleted = sqlx::query(
            r#"
            DELETE FROM idempotency_records
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(RecordStatus::Processing.code())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("release", e))?
        .rows_affected();

        if deleted == 1 {
            return Ok(());
        }
        match self.get(id).await? {
            Some(_) => Err(IdempotencyError::NotProcessing(id)),
            None => Err(IdempotencyError::NotFound(id)),
        }
    }

    async fn get(&self, id: IdempotencyRecordId) -> Result<Option<IdempotencyRecord>, IdempotencyError> {
        let row = sqlx::query(
            r#"
            SELECT id, idem_key, user_id, route_key, status, status_code, body, created_at, expires_at
            FROM idempotency_records
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(record_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, IdempotencyError> {
        let purged = sqlx::query("DELETE FROM idempotency_records WHERE expires_at <= $1")
            .bind(now)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("purge_expired", e))?
            .rows_affected();
        tracing::debug!(purged, "purged expired idempotency records");
        Ok(purged)
    }
}

fn record_from_row(row: &PgRow) -> Result<IdempotencyRecord, IdempotencyError> {
    let decode = |e: sqlx::Error| IdempotencyError::Backend(format!("failed to decode record row: {e}"));

    let status = match row.try_get::<String, _>("status").map_err(decode)?.as_str() {
        "PROCESSING" => RecordStatus::Processing,
        "COMPLETED" => RecordStatus::Completed,
        other => {
            return Err(IdempotencyError::Backend(format!(
                "unknown idempotency status '{other}'"
            )));
        }
    };
    let status_code: Option<i32> = row.try_get("status_code").map_err(decode)?;

    Ok(IdempotencyRecord {
        id: IdempotencyRecordId::from_uuid(row.try_get("id").map_err(decode)?),
        key: IdempotencyKey {
            key: row.try_get("idem_key").map_err(decode)?,
            user_id: UserId::from_uuid(row.try_get("user_id").map_err(decode)?),
            route_key: row.try_get("route_key").map_err(decode)?,
        },
        status,
        status_code: status_code.and_then(|c| u16::try_from(c).ok()),
        body: row.try_get("body").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
        expires_at: row.try_get("expires_at").map_err(decode)?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> IdempotencyError {
    match err {
        sqlx::Error::Database(db_err) => IdempotencyError::Backend(format!(
            "database error in {operation} ({}): {}",
            db_err.code().as_deref().unwrap_or("?"),
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            IdempotencyError::Backend(format!("connection pool closed in {operation}"))
        }
        other => IdempotencyError::Backend(format!("sqlx error in {operation}: {other}")),
    }
}
