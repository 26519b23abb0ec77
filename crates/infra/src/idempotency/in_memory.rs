use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value as JsonValue;

use invflow_core::IdempotencyRecordId;

use super::r#trait::{
    CheckOutcome, IdempotencyError, IdempotencyKey, IdempotencyRecord, IdempotencyStore,
    RecordStatus,
};

#[derive(Debug, Default)]
struct Records {
    by_key: HashMap<IdempotencyKey, IdempotencyRecordId>,
    by_id: HashMap<IdempotencyRecordId, IdempotencyRecord>,
}

impl Records {
    fn remove(&mut self, id: IdempotencyRecordId) -> Option<IdempotencyRecord> {
        let record = self.by_id.remove(&id)?;
        self.by_key.remove(&record.key);
        Some(record)
    }
}

/// In-memory idempotency store.
///
/// Intended for tests/dev. A single mutex makes check-or-insert atomic.
#[derive(Debug, Default)]
pub struct InMemoryIdempotencyStore {
    records: Mutex<Records>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Records>, IdempotencyError> {
        self.records
            .lock()
            .map_err(|_| IdempotencyError::Backend("lock poisoned".to_string()))
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.by_id.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn check_or_insert(
        &self,
        key: &IdempotencyKey,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<CheckOutcome, IdempotencyError> {
        let mut records = self.lock()?;

        if let Some(id) = records.by_key.get(key).copied() {
            match records.by_id.get(&id) {
                Some(existing) if !existing.is_expired(now) => return Ok(existing.outcome()),
                _ => {
                    records.remove(id);
                }
            }
        }

        let record = IdempotencyRecord::processing(key.clone(), now, ttl);
        let id = record.id;
        records.by_key.insert(key.clone(), id);
        records.by_id.insert(id, record);
        Ok(CheckOutcome::Inserted(id))
    }

    async fn update_response(
        &self,
        id: IdempotencyRecordId,
        status_code: u16,
        body: JsonValue,
    ) -> Result<(), IdempotencyError> {
        let mut records = self.lock()?;
        let record = records
            .by_id
            .get_mut(&id)
            .ok_or(IdempotencyError::NotFound(id))?;
        if record.status != RecordStatus::Processing {
            return Err(IdempotencyError::NotProcessing(id));
        }
        record.status = RecordStatus::Completed;
        record.status_code = Some(status_code);
        record.body = Some(body);
        Ok(())
    }

    async fn release(&self, id: IdempotencyRecordId) -> Result<(), IdempotencyError> {
        let mut records = self.lock()?;
        match records.by_id.get(&id).map(|r| r.status) {
            None => Err(IdempotencyError::NotFound(id)),
            Some(RecordStatus::Completed) => Err(IdempotencyError::NotProcessing(id)),
            Some(RecordStatus::Processing) => {
                records.remove(id);
                Ok(())
            }
        }
    }

    async fn get(&self, id: IdempotencyRecordId) -> Result<Option<IdempotencyRecord>, IdempotencyError> {
        Ok(self.lock()?.by_id.get(&id).cloned())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, IdempotencyError> {
        let mut records = self.lock()?;
        let expired: Vec<IdempotencyRecordId> = records
            .by_id
            .values()
            .filter(|r| r.is_expired(now))
            .map(|r| r.id)
            .collect();
        for id in &expired {
            records.remove(*id);
        }
        Ok(expired.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use invflow_core::UserId;
    use serde_json::json;

    fn key(user: UserId) -> IdempotencyKey {
        IdempotencyKey::new("abc", user, "workflow.process_action")
    }

    #[tokio::test]
    async fn second_check_sees_in_flight_then_completed() {
        let store = InMemoryIdempotencyStore::new();
        let user = UserId::new();
        let now = Utc::now();

        let first = store.check_or_insert(&key(user), now, Duration::hours(1)).await.unwrap();
        let CheckOutcome::Inserted(id) = first else {
            panic!("expected insert, got {first:?}");
        };
        assert_eq!(
            store.check_or_insert(&key(user), now, Duration::hours(1)).await.unwrap(),
            CheckOutcome::InFlight(id)
        );

        store.update_response(id, 200, json!({"ok": true})).await.unwrap();
        let replay = store.check_or_insert(&key(user), now, Duration::hours(1)).await.unwrap();
        assert!(replay.exists());
        assert_eq!(
            replay,
            CheckOutcome::Completed {
                record_id: id,
                status_code: 200,
                body: json!({"ok": true})
            }
        );

        assert!(matches!(
            store.update_response(id, 500, json!({})).await,
            Err(IdempotencyError::NotProcessing(_))
        ));
    }

    #[tokio::test]
    async fn keys_are_scoped_by_user_and_route() {
        let store = InMemoryIdempotencyStore::new();
        let now = Utc::now();
        let a = store.check_or_insert(&key(UserId::new()), now, Duration::hours(1)).await.unwrap();
        let b = store.check_or_insert(&key(UserId::new()), now, Duration::hours(1)).await.unwrap();
        assert!(!a.exists());
        assert!(!b.exists());
    }

    #[tokio::test]
    async fn released_and_expired_records_free_the_key() {
        let store = InMemoryIdempotencyStore::new();
        let user = UserId::new();
        let now = Utc::now();

        let id = store.check_or_insert(&key(user), now, Duration::hours(1)).await.unwrap().record_id();
        store.release(id).await.unwrap();
        assert!(store.is_empty());

        let id = store.check_or_insert(&key(user), now, Duration::seconds(5)).await.unwrap().record_id();
        store.update_response(id, 200, json!(1)).await.unwrap();
        let later = now + Duration::seconds(10);
        assert!(!store.check_or_insert(&key(user), later, Duration::seconds(5)).await.unwrap().exists());

        assert_eq!(store.purge_expired(later + Duration::seconds(10)).await.unwrap(), 1);
        assert!(store.is_empty());
    }
}
