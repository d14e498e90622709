//! In-memory reference implementation of the persistence contract.
//!
//! Implements the full conditional-write semantics over a process-local map.
//! Useful for tests and as the executable model for real backends: the
//! create condition here mirrors the conditional put a store like DynamoDB
//! would express (`absent OR record expired OR (in-progress AND lease
//! lapsed)`), and the success transition mirrors a conditioned update on the
//! claim lease.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::record::{now_millis, now_seconds, IdempotencyRecord};

use super::{PersistenceError, PersistenceLayer};

/// Process-local persistence layer backed by a mutex-guarded map.
#[derive(Debug, Default)]
pub struct InMemoryPersistenceLayer {
    records: Mutex<HashMap<String, IdempotencyRecord>>,
}

impl InMemoryPersistenceLayer {
    /// Creates an empty in-memory persistence layer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of physically stored records, expired ones included.
    /// Intended for tests and diagnostics.
    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    /// Returns true when no records are physically stored.
    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }

    /// Seeds a record directly, bypassing the conditional-create check.
    /// Intended for tests that need pre-existing state.
    pub async fn seed(&self, record: IdempotencyRecord) {
        self.records
            .lock()
            .await
            .insert(record.idempotency_key.clone(), record);
    }
}

/// A new claim may take a key over when the existing record is logically
/// absent: past its overall expiry, or an in-progress claim whose lease has
/// lapsed.
fn reclaimable(existing: &IdempotencyRecord, now_seconds: u64, now_millis: u64) -> bool {
    existing.is_expired_at(now_seconds) || existing.is_lease_expired_at(now_millis)
}

#[async_trait]
impl PersistenceLayer for InMemoryPersistenceLayer {
    async fn save_in_progress(&self, record: &IdempotencyRecord) -> Result<(), PersistenceError> {
        let mut records = self.records.lock().await;
        if let Some(existing) = records.get(&record.idempotency_key) {
            if !reclaimable(existing, now_seconds(), now_millis()) {
                return Err(PersistenceError::already_exists(existing.clone()));
            }
        }
        records.insert(record.idempotency_key.clone(), record.clone());
        Ok(())
    }

    async fn save_success(&self, record: &IdempotencyRecord) -> Result<(), PersistenceError> {
        let mut records = self.records.lock().await;
        match records.get_mut(&record.idempotency_key) {
            Some(existing)
                if existing.stored_status().is_in_progress()
                    && existing.in_progress_expiry_timestamp
                        == record.in_progress_expiry_timestamp =>
            {
                *existing = record.clone();
                Ok(())
            }
            _ => Err(PersistenceError::ConditionFailed {
                key: record.idempotency_key.clone(),
            }),
        }
    }

    async fn save_failure(&self, idempotency_key: &str) -> Result<(), PersistenceError> {
        self.records.lock().await.remove(idempotency_key);
        Ok(())
    }

    async fn get_record(
        &self,
        idempotency_key: &str,
    ) -> Result<IdempotencyRecord, PersistenceError> {
        self.records
            .lock()
            .await
            .get(idempotency_key)
            .cloned()
            .ok_or_else(|| PersistenceError::ItemNotFound {
                key: idempotency_key.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn live_claim(key: &str) -> IdempotencyRecord {
        IdempotencyRecord::in_progress(key, now_seconds() + 60, Some(now_millis() + 60_000), None)
    }

    #[tokio::test]
    async fn creates_record_when_key_absent() {
        let layer = InMemoryPersistenceLayer::new();
        layer.save_in_progress(&live_claim("k1")).await.unwrap();
        let stored = layer.get_record("k1").await.unwrap();
        assert!(stored.stored_status().is_in_progress());
    }

    #[tokio::test]
    async fn conflict_carries_existing_record() {
        let layer = InMemoryPersistenceLayer::new();
        layer.save_in_progress(&live_claim("k1")).await.unwrap();

        let err = layer.save_in_progress(&live_claim("k1")).await.unwrap_err();
        match err {
            PersistenceError::ItemAlreadyExists { existing } => {
                let existing = existing.expect("conflict should carry the record");
                assert_eq!(existing.idempotency_key, "k1");
            }
            other => panic!("expected ItemAlreadyExists, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn expired_record_is_replaced_by_new_claim() {
        let layer = InMemoryPersistenceLayer::new();
        let expired =
            IdempotencyRecord::completed("k1", now_seconds() - 10, None, None, json!("old"));
        layer.seed(expired).await;

        layer.save_in_progress(&live_claim("k1")).await.unwrap();
        let stored = layer.get_record("k1").await.unwrap();
        assert!(stored.stored_status().is_in_progress());
    }

    #[tokio::test]
    async fn lapsed_lease_is_reclaimable() {
        let layer = InMemoryPersistenceLayer::new();
        let abandoned =
            IdempotencyRecord::in_progress("k1", now_seconds() + 60, Some(now_millis() - 1), None);
        layer.seed(abandoned).await;

        layer.save_in_progress(&live_claim("k1")).await.unwrap();
    }

    #[tokio::test]
    async fn live_lease_blocks_new_claim() {
        let layer = InMemoryPersistenceLayer::new();
        layer.save_in_progress(&live_claim("k1")).await.unwrap();
        let err = layer.save_in_progress(&live_claim("k1")).await.unwrap_err();
        assert!(matches!(err, PersistenceError::ItemAlreadyExists { .. }));
    }

    #[tokio::test]
    async fn save_success_requires_matching_claim() {
        let layer = InMemoryPersistenceLayer::new();
        let claim = live_claim("k1");
        layer.save_in_progress(&claim).await.unwrap();

        // A stale claimant completing with a different lease is rejected.
        let stale = IdempotencyRecord::completed(
            "k1",
            now_seconds() + 60,
            Some(now_millis() + 999_999),
            None,
            json!("stale"),
        );
        let err = layer.save_success(&stale).await.unwrap_err();
        assert!(matches!(err, PersistenceError::ConditionFailed { .. }));

        // The claim holder's completion goes through.
        let done = IdempotencyRecord::completed(
            "k1",
            now_seconds() + 60,
            claim.in_progress_expiry_timestamp,
            None,
            json!("done"),
        );
        layer.save_success(&done).await.unwrap();
        let stored = layer.get_record("k1").await.unwrap();
        assert_eq!(stored.response(), Some(&json!("done")));
    }

    #[tokio::test]
    async fn save_success_on_absent_key_fails_condition() {
        let layer = InMemoryPersistenceLayer::new();
        let done = IdempotencyRecord::completed("gone", now_seconds() + 60, None, None, json!(1));
        let err = layer.save_success(&done).await.unwrap_err();
        assert!(matches!(err, PersistenceError::ConditionFailed { .. }));
    }

    #[tokio::test]
    async fn save_failure_releases_the_key() {
        let layer = InMemoryPersistenceLayer::new();
        layer.save_in_progress(&live_claim("k1")).await.unwrap();
        layer.save_failure("k1").await.unwrap();

        let err = layer.get_record("k1").await.unwrap_err();
        assert!(matches!(err, PersistenceError::ItemNotFound { .. }));

        // The key is immediately claimable again.
        layer.save_in_progress(&live_claim("k1")).await.unwrap();
    }

    #[tokio::test]
    async fn get_record_distinguishes_absent_keys() {
        let layer = InMemoryPersistenceLayer::new();
        match layer.get_record("missing").await.unwrap_err() {
            PersistenceError::ItemNotFound { key } => assert_eq!(key, "missing"),
            other => panic!("expected ItemNotFound, got {other:?}"),
        }
    }
}
