//! Per-aggregate async locks with bounded waits.
//!
//! One lock per key (instance id, stock row). Waiting longer than the
//! configured timeout yields `EngineError::Busy` instead of hanging.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::error::EngineError;

const PRUNE_THRESHOLD: usize = 1024;

#[derive(Debug)]
pub struct KeyedLocks<K> {
    slots: Mutex<HashMap<K, Arc<AsyncMutex<()>>>>,
    timeout: Duration,
}

/// Guards held for a set of keys; released together on drop.
#[derive(Debug)]
pub struct LockSet {
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl<K> KeyedLocks<K>
where
    K: Eq + Hash + Ord + Clone + core::fmt::Display,
{
    pub fn new(timeout: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    fn slot(&self, key: &K) -> Result<Arc<AsyncMutex<()>>, EngineError> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| EngineError::store("lock table poisoned"))?;
        if slots.len() > PRUNE_THRESHOLD {
            slots.retain(|_, slot| Arc::strong_count(slot) > 1);
        }
        Ok(slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone())
    }

    /// Wait for `key`, at most the configured timeout.
    pub async fn acquire(&self, key: &K) -> Result<OwnedMutexGuard<()>, EngineError> {
        let slot = self.slot(key)?;
        tokio::time::timeout(self.timeout, slot.lock_owned())
            .await
            .map_err(|_| {
                tracing::debug!(%key, timeout = ?self.timeout, "lock wait timed out");
                EngineError::busy(format!("timed out waiting for lock on {key}"))
            })
    }

    /// Lock every key in ascending order. Duplicates are locked once.
    pub async fn acquire_all(&self, keys: impl IntoIterator<Item = K>) -> Result<LockSet, EngineError> {
        let mut keys: Vec<K> = keys.into_iter().collect();
        keys.sort();
        keys.dedup();

        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            guards.push(self.acquire(key).await?);
        }
        Ok(LockSet { _guards: guards })
    }

    pub fn len(&self) -> usize {
        self.slots.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_waiter_times_out_with_busy() {
        let locks: KeyedLocks<u32> = KeyedLocks::new(Duration::from_millis(20));
        let _held = locks.acquire(&7).await.unwrap();

        let err = locks.acquire(&7).await.unwrap_err();
        assert!(matches!(err, EngineError::Busy(_)));

        // Other keys are independent.
        assert!(locks.acquire(&8).await.is_ok());
    }

    #[tokio::test]
    async fn lock_is_released_on_drop() {
        let locks: KeyedLocks<u32> = KeyedLocks::new(Duration::from_millis(20));
        drop(locks.acquire_all([3, 1, 3]).await.unwrap());
        assert!(locks.acquire_all([1, 3]).await.is_ok());
    }
}
