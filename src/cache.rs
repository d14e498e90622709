//! Bounded in-process cache of validated completed records.
//!
//! An optional fast path only: in-progress state is never cached, because
//! claim races must always be resolved against the authoritative store. A
//! hit past the record's own expiry is a miss (and evicts the entry).

use moka::sync::Cache;

use crate::record::IdempotencyRecord;

/// Bounded cache keyed by idempotency key. Capacity 0 disables it entirely;
/// all operations become no-ops.
#[derive(Debug)]
pub struct LocalCache {
    inner: Option<Cache<String, IdempotencyRecord>>,
}

impl LocalCache {
    /// Creates a cache holding up to `capacity` records; 0 disables it.
    pub fn new(capacity: u64) -> Self {
        let inner = if capacity == 0 {
            None
        } else {
            Some(Cache::builder().max_capacity(capacity).build())
        };
        Self { inner }
    }

    /// Returns true when the cache is active.
    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Looks up a fresh completed record. Expired entries are evicted and
    /// reported as misses.
    pub fn get(&self, idempotency_key: &str) -> Option<IdempotencyRecord> {
        let cache = self.inner.as_ref()?;
        let record = cache.get(idempotency_key)?;
        if record.is_expired() {
            cache.invalidate(idempotency_key);
            return None;
        }
        Some(record)
    }

    /// Stores a completed record. Records in any other state are ignored:
    /// the cache has no way to observe updates made to a live claim outside
    /// this process.
    pub fn put(&self, record: IdempotencyRecord) {
        if let Some(cache) = &self.inner {
            if record.stored_status().is_completed() {
                cache.insert(record.idempotency_key.clone(), record);
            }
        }
    }

    /// Drops the entry for a key, if present.
    pub fn remove(&self, idempotency_key: &str) {
        if let Some(cache) = &self.inner {
            cache.invalidate(idempotency_key);
        }
    }
}
