//! Persistence layer contract for idempotency records.
//!
//! The engine talks to its backing store exclusively through the
//! [`PersistenceLayer`] trait: an atomic conditional-write contract that any
//! store with optimistic concurrency (conditional puts, transactions,
//! compare-and-set) can satisfy. The crate ships one reference
//! implementation, [`InMemoryPersistenceLayer`], which doubles as the
//! executable model of the contract for tests and for authors of real
//! backends.
//!
//! This layer never retries: transient or permanent backend failures
//! propagate unmodified as [`PersistenceError::Backend`].

mod in_memory;

pub use in_memory::InMemoryPersistenceLayer;

use async_trait::async_trait;
use thiserror::Error;

use crate::record::IdempotencyRecord;

/// Errors produced by a persistence backend.
///
/// `ItemAlreadyExists` is an internal conflict signal consumed by the
/// orchestrator during claim resolution; it never reaches callers directly.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// A live (non-expired) record already exists for the key. Carries the
    /// existing record when the backend can return it with the conflict,
    /// saving the orchestrator a follow-up read.
    #[error("record already exists for idempotency key")]
    ItemAlreadyExists {
        /// The conflicting record, when the backend returned it.
        existing: Option<Box<IdempotencyRecord>>,
    },

    /// No record exists for the key.
    #[error("no record found for idempotency key {key}")]
    ItemNotFound {
        /// The key that was looked up.
        key: String,
    },

    /// A conditioned update failed because the stored record no longer
    /// matches the caller's claim.
    #[error("conditional write failed for idempotency key {key}: claim no longer held")]
    ConditionFailed {
        /// The key whose claim was lost.
        key: String,
    },

    /// Backend failure, transient or permanent. Never retried by this layer.
    #[error("persistence backend error: {message}")]
    Backend {
        /// Description of the failure.
        message: String,
        /// Underlying backend error, when available.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl PersistenceError {
    /// Creates a conflict error carrying the existing record.
    pub fn already_exists(existing: IdempotencyRecord) -> Self {
        Self::ItemAlreadyExists {
            existing: Some(Box::new(existing)),
        }
    }

    /// Creates a backend error from a message.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a backend error wrapping an underlying error.
    pub fn backend_with_source(
        message: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self::Backend {
            message: message.into(),
            source: Some(source),
        }
    }
}

/// Atomic conditional-write contract against an external store.
///
/// Implementations must be `Send + Sync`; every call is assumed to be
/// network-bound. For one key, the backend's conditional create is the sole
/// arbiter of which concurrent claim attempt wins; the engine relies on that
/// atomicity and nothing else.
#[async_trait]
pub trait PersistenceLayer: Send + Sync {
    /// Atomically creates an in-progress record for the key.
    ///
    /// Must succeed exactly when no live record exists: the key is absent,
    /// the existing record is past its overall expiry, or the existing
    /// record is a claim whose lease has lapsed. Otherwise fails with
    /// [`PersistenceError::ItemAlreadyExists`], carrying the existing record
    /// when the backend can return it.
    async fn save_in_progress(&self, record: &IdempotencyRecord) -> Result<(), PersistenceError>;

    /// Transitions the record for the key from in-progress to completed,
    /// storing the response data.
    ///
    /// The update must be conditioned on the stored record still holding
    /// the caller's claim (same in-progress lease timestamp), so a
    /// reclaimed record is never silently overwritten by a stale claimant;
    /// a lost claim fails with [`PersistenceError::ConditionFailed`].
    async fn save_success(&self, record: &IdempotencyRecord) -> Result<(), PersistenceError>;

    /// Deletes the record for the key, releasing it immediately instead of
    /// waiting for the lease to lapse.
    async fn save_failure(&self, idempotency_key: &str) -> Result<(), PersistenceError>;

    /// Fetches the current record for the key; fails with
    /// [`PersistenceError::ItemNotFound`] when absent.
    async fn get_record(&self, idempotency_key: &str)
        -> Result<IdempotencyRecord, PersistenceError>;
}
