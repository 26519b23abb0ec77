//! Idempotency coordinator for mutating operations.
//!
//! A caller-supplied key, scoped by user and route, guarantees one effective
//! execution. Completed responses are replayed. Retryable failures and
//! store faults release the key so the client can try again, and so does a
//! request dropped before its operation finished.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryIdempotencyStore;
pub use postgres::PostgresIdempotencyStore;
pub use r#trait::{
    CheckOutcome, IdempotencyError, IdempotencyKey, IdempotencyRecord, IdempotencyStore,
    RecordStatus,
};

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tracing::instrument;

use invflow_core::{IdempotencyRecordId, UserId};

use crate::error::EngineError;

const SUCCESS_STATUS: u16 = 200;

/// Attempts at writing a settled outcome before giving up.
const SETTLE_ATTEMPTS: usize = 3;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum FailurePolicy {
    /// Terminal failures are stored and replayed.
    Record,
    Release,
}

/// Record ids whose owning future was dropped before it settled.
type Abandoned = Arc<Mutex<HashSet<IdempotencyRecordId>>>;

pub struct IdempotencyGate {
    store: Arc<dyn IdempotencyStore>,
    ttl: chrono::Duration,
    abandoned: Abandoned,
}

impl IdempotencyGate {
    pub fn new(store: Arc<dyn IdempotencyStore>, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(1));
        Self {
            store,
            ttl,
            abandoned: Arc::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn IdempotencyStore> {
        &self.store
    }

    /// Run `op` at most once per `(key, user, route_key)`.
    ///
    /// Without a key the operation simply runs. With a key:
    /// - a completed success is deserialized and returned without running `op`
    /// - a completed failure is returned as `EngineError::Replayed`
    /// - a duplicate still in flight fails with `IdempotencyConflict`
    /// - `deadline` bounds `op`; expiry is retryable and releases the key
    ///
    /// Dropping the returned future before `op` finishes releases the key.
    #[instrument(skip(self, key, op), fields(route = route_key, user_id = %user))]
    pub async fn run<T, F, Fut>(
        &self,
        key: Option<&str>,
        user: UserId,
        route_key: &str,
        deadline: Option<Duration>,
        op: F,
    ) -> Result<T, EngineError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        self.run_with(key, user, route_key, deadline, FailurePolicy::Record, op)
            .await
    }

    /// Like [`IdempotencyGate::run`], but only a success is recorded: every
    /// failure frees the key so a later attempt runs again.
    pub async fn run_until_success<T, F, Fut>(
        &self,
        key: &str,
        user: UserId,
        route_key: &str,
        op: F,
    ) -> Result<T, EngineError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        self.run_with(Some(key), user, route_key, None, FailurePolicy::Release, op)
            .await
    }

    async fn run_with<T, F, Fut>(
        &self,
        key: Option<&str>,
        user: UserId,
        route_key: &str,
        deadline: Option<Duration>,
        policy: FailurePolicy,
        op: F,
    ) -> Result<T, EngineError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let Some(key) = key else {
            return with_deadline(deadline, op()).await;
        };
        if key.trim().is_empty() {
            return Err(EngineError::validation("idempotency key must not be blank"));
        }

        let scoped = IdempotencyKey::new(key, user, route_key);
        let record_id = loop {
            match self.store.check_or_insert(&scoped, Utc::now(), self.ttl).await? {
                CheckOutcome::Inserted(id) => break id,
                CheckOutcome::InFlight(id) if self.reclaim(id) => {
                    tracing::debug!(record_id = %id, "reclaiming key of a dropped request");
                    match self.store.release(id).await {
                        Ok(()) | Err(IdempotencyError::NotFound(_)) => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
                CheckOutcome::InFlight(_) => {
                    return Err(EngineError::IdempotencyConflict(format!(
                        "request '{key}' is still being processed"
                    )));
                }
                CheckOutcome::Completed {
                    status_code, body, ..
                } => {
                    tracing::debug!(status_code, "replaying stored response");
                    if status_code == SUCCESS_STATUS {
                        return serde_json::from_value(body).map_err(|e| {
                            EngineError::store(format!("stored response does not decode: {e}"))
                        });
                    }
                    return Err(EngineError::from_stored(status_code, &body));
                }
            }
        };

        let mut pending = PendingRecord {
            store: self.store.clone(),
            abandoned: self.abandoned.clone(),
            record_id,
            settlement: None,
            settled: false,
        };
        let result = with_deadline(deadline, op()).await;
        pending.settlement = Some(Settlement::of(policy, &result));
        pending.settle().await;
        result
    }

    /// Take `id` out of the abandoned set. True when it was there.
    fn reclaim(&self, id: IdempotencyRecordId) -> bool {
        self.abandoned
            .lock()
            .map(|mut ids| ids.remove(&id))
            .unwrap_or(false)
    }
}

/// What gets written to a record once its operation has finished.
#[derive(Debug, Clone)]
enum Settlement {
    Complete { status_code: u16, body: JsonValue },
    Release,
}

impl Settlement {
    fn of<T: Serialize>(policy: FailurePolicy, result: &Result<T, EngineError>) -> Self {
        match result {
            Ok(value) => match serde_json::to_value(value) {
                Ok(body) => Settlement::Complete {
                    status_code: SUCCESS_STATUS,
                    body,
                },
                Err(e) => {
                    tracing::warn!(error = %e, "response not serializable; releasing key");
                    Settlement::Release
                }
            },
            Err(err) if frees_key(err) || policy == FailurePolicy::Release => Settlement::Release,
            Err(err) => Settlement::Complete {
                status_code: err.status_code(),
                body: err.to_body(),
            },
        }
    }

    async fn apply(
        &self,
        store: &dyn IdempotencyStore,
        record_id: IdempotencyRecordId,
    ) -> Result<(), IdempotencyError> {
        match self {
            Settlement::Complete { status_code, body } => {
                store.update_response(record_id, *status_code, body.clone()).await
            }
            Settlement::Release => store.release(record_id).await,
        }
    }
}

/// Failures that leave nothing committed and may succeed on a retry.
fn frees_key(err: &EngineError) -> bool {
    err.is_retryable() || matches!(err, EngineError::Store(_))
}

/// A PROCESSING record owned by a running operation.
///
/// Dropped unsettled, it releases the record in the background and marks it
/// abandoned so the next request with the same key can take it over.
struct PendingRecord {
    store: Arc<dyn IdempotencyStore>,
    abandoned: Abandoned,
    record_id: IdempotencyRecordId,
    settlement: Option<Settlement>,
    settled: bool,
}

impl PendingRecord {
    async fn settle(&mut self) {
        let Some(settlement) = self.settlement.clone() else {
            return;
        };
        let record_id = self.record_id;
        let mut last_error = None;
        for _ in 0..SETTLE_ATTEMPTS {
            match settlement.apply(&*self.store, record_id).await {
                Ok(()) => {
                    self.settled = true;
                    return;
                }
                Err(e) => last_error = Some(e),
            }
        }
        self.settled = true;

        let error = last_error.map(|e| e.to_string()).unwrap_or_default();
        match settlement {
            Settlement::Release => {
                tracing::warn!(%record_id, %error, "failed to release idempotency record");
                self.mark_abandoned();
            }
            // The operation committed; rerunning it on this key would apply it twice.
            Settlement::Complete { .. } => {
                tracing::error!(%record_id, %error, "failed to store idempotent response; key stays in flight");
            }
        }
    }

    fn mark_abandoned(&self) {
        if let Ok(mut ids) = self.abandoned.lock() {
            ids.insert(self.record_id);
        }
    }
}

impl Drop for PendingRecord {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let settlement = self.settlement.take().unwrap_or(Settlement::Release);
        if matches!(settlement, Settlement::Release) {
            self.mark_abandoned();
        }
        tracing::debug!(record_id = %self.record_id, "request dropped before its key was settled");

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = self.store.clone();
        let abandoned = self.abandoned.clone();
        let record_id = self.record_id;
        handle.spawn(async move {
            match settlement.apply(&*store, record_id).await {
                Ok(()) | Err(IdempotencyError::NotFound(_)) => {
                    if let Ok(mut ids) = abandoned.lock() {
                        ids.remove(&record_id);
                    }
                }
                Err(e) => tracing::warn!(%record_id, error = %e, "failed to settle dropped request"),
            }
        });
    }
}

/// Bound `fut` by `deadline`. The future is dropped on expiry, before commit
/// when the deadline fires while waiting for locks.
pub async fn with_deadline<T, Fut>(deadline: Option<Duration>, fut: Fut) -> Result<T, EngineError>
where
    Fut: Future<Output = Result<T, EngineError>>,
{
    match deadline {
        None => fut.await,
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| EngineError::DeadlineExceeded(limit))?,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn gate() -> IdempotencyGate {
        IdempotencyGate::new(Arc::new(InMemoryIdempotencyStore::new()), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn success_is_replayed_without_rerunning() {
        let gate = gate();
        let user = UserId::new();
        let runs = AtomicUsize::new(0);
        let counter = &runs;

        for _ in 0..3 {
            let value: u32 = gate
                .run(Some("k1"), user, "stock.post", None, || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(42)
                })
                .await
                .unwrap();
            assert_eq!(value, 42);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn terminal_failure_is_replayed_and_retryable_failure_is_not() {
        let gate = gate();
        let user = UserId::new();

        let first: Result<u32, _> = gate
            .run(Some("bad"), user, "r", None, || async {
                Err(EngineError::Forbidden("nope".into()))
            })
            .await;
        assert_eq!(first.unwrap_err().code(), "forbidden");

        let again: Result<u32, _> = gate
            .run(Some("bad"), user, "r", None, || async { Ok(1) })
            .await;
        let err = again.unwrap_err();
        assert!(matches!(err, EngineError::Replayed { status_code: 403, .. }));

        let busy: Result<u32, _> = gate
            .run(Some("busy"), user, "r", None, || async {
                Err(EngineError::busy("locked"))
            })
            .await;
        assert!(busy.is_err());
        let retried: u32 = gate
            .run(Some("busy"), user, "r", None, || async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(retried, 7);
    }

    #[tokio::test]
    async fn deadline_expiry_releases_the_key() {
        let gate = gate();
        let user = UserId::new();

        let slow: Result<u32, _> = gate
            .run(Some("slow"), user, "r", Some(Duration::from_millis(10)), || async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(1)
            })
            .await;
        assert!(matches!(slow, Err(EngineError::DeadlineExceeded(_))));

        let value: u32 = gate
            .run(Some("slow"), user, "r", None, || async { Ok(2) })
            .await
            .unwrap();
        assert_eq!(value, 2);
    }

    #[tokio::test]
    async fn store_fault_is_not_frozen_into_the_key() {
        let gate = gate();
        let user = UserId::new();

        let failed: Result<u32, _> = gate
            .run(Some("k"), user, "r", None, || async {
                Err(EngineError::store("connection reset"))
            })
            .await;
        assert!(matches!(failed, Err(EngineError::Store(_))));

        let retried: u32 = gate
            .run(Some("k"), user, "r", None, || async { Ok(5) })
            .await
            .unwrap();
        assert_eq!(retried, 5);
    }

    #[tokio::test]
    async fn dropped_request_frees_its_key() {
        let gate = gate();
        let user = UserId::new();

        let stalled = gate.run(Some("k"), user, "r", None, || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<u32, EngineError>(1)
        });
        assert!(tokio::time::timeout(Duration::from_millis(20), stalled).await.is_err());

        let value: u32 = gate
            .run(Some("k"), user, "r", None, || async { Ok(2) })
            .await
            .unwrap();
        assert_eq!(value, 2);

        let replayed: u32 = gate
            .run(Some("k"), user, "r", None, || async { Ok(3) })
            .await
            .unwrap();
        assert_eq!(replayed, 2);
    }

    #[tokio::test]
    async fn success_only_mode_reruns_after_a_terminal_failure() {
        let gate = gate();
        let user = UserId::new();

        let failed: Result<u32, _> = gate
            .run_until_success("fulfill:1", user, "r", || async {
                Err(EngineError::validation("short"))
            })
            .await;
        assert!(matches!(failed, Err(EngineError::Validation(_))));

        let ok: u32 = gate
            .run_until_success("fulfill:1", user, "r", || async { Ok(3) })
            .await
            .unwrap();
        let replayed: u32 = gate
            .run_until_success("fulfill:1", user, "r", || async { Ok(99) })
            .await
            .unwrap();
        assert_eq!((ok, replayed), (3, 3));
    }

    #[tokio::test]
    async fn blank_key_is_rejected() {
        let result: Result<u32, _> = gate()
            .run(Some("  "), UserId::new(), "r", None, || async { Ok(1) })
            .await;
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }
}
