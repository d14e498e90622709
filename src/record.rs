//! Idempotency record model.
//!
//! An [`IdempotencyRecord`] is the unit of state stored in the persistence
//! layer: one record per idempotency key, holding the claim status, the
//! stored response for completed operations, and the two expiry horizons
//! (overall record TTL in seconds, in-progress lease in milliseconds).

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Status of an idempotency record.
///
/// Only `InProgress` and `Completed` are ever stored; `Expired` is a derived
/// view returned by [`IdempotencyRecord::status`] once the record is past its
/// overall expiry timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordStatus {
    /// A claim is held; the wrapped operation may be executing.
    #[serde(rename = "INPROGRESS")]
    InProgress,
    /// The wrapped operation completed and its response is stored.
    #[serde(rename = "COMPLETED")]
    Completed,
    /// Derived view: the record is past its expiry timestamp and is
    /// logically absent. Never written to the store.
    #[serde(rename = "EXPIRED")]
    Expired,
}

impl RecordStatus {
    /// Returns true if this is the in-progress (claimed) status.
    pub fn is_in_progress(&self) -> bool {
        matches!(self, Self::InProgress)
    }

    /// Returns true if this is the completed status.
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// A single idempotency record as persisted in the backing store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// Storage key: `{scope}#{digest}` of the derived key material.
    pub idempotency_key: String,
    /// Stored status; read through [`status`](Self::status) to get the
    /// expiry-aware view.
    status: RecordStatus,
    /// Overall record TTL, epoch seconds.
    pub expiry_timestamp: u64,
    /// Claim lease bound, epoch milliseconds. A claim past this timestamp is
    /// presumed abandoned and may be reclaimed.
    pub in_progress_expiry_timestamp: Option<u64>,
    /// Hash of the validation payload, present only when payload validation
    /// is configured.
    pub payload_hash: Option<String>,
    /// Stored response, present only for completed records.
    pub response_data: Option<Value>,
}

impl IdempotencyRecord {
    /// Creates a new in-progress record representing a fresh claim.
    pub fn in_progress(
        idempotency_key: impl Into<String>,
        expiry_timestamp: u64,
        in_progress_expiry_timestamp: Option<u64>,
        payload_hash: Option<String>,
    ) -> Self {
        Self {
            idempotency_key: idempotency_key.into(),
            status: RecordStatus::InProgress,
            expiry_timestamp,
            in_progress_expiry_timestamp,
            payload_hash,
            response_data: None,
        }
    }

    /// Creates a completed record carrying the operation's response.
    ///
    /// The lease timestamp of the claim being completed is retained so the
    /// persistence layer can condition the update on the caller still
    /// holding that claim.
    pub fn completed(
        idempotency_key: impl Into<String>,
        expiry_timestamp: u64,
        in_progress_expiry_timestamp: Option<u64>,
        payload_hash: Option<String>,
        response_data: Value,
    ) -> Self {
        Self {
            idempotency_key: idempotency_key.into(),
            status: RecordStatus::Completed,
            expiry_timestamp,
            in_progress_expiry_timestamp,
            payload_hash,
            response_data: Some(response_data),
        }
    }

    /// Returns the expiry-aware status: the stored status, or
    /// [`RecordStatus::Expired`] once the record is past its overall TTL.
    pub fn status(&self) -> RecordStatus {
        if self.is_expired() {
            RecordStatus::Expired
        } else {
            self.status
        }
    }

    /// Returns the status exactly as stored, ignoring expiry.
    pub fn stored_status(&self) -> RecordStatus {
        self.status
    }

    /// Returns true if the record is past its overall expiry timestamp.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_seconds())
    }

    /// Expiry check against an explicit clock value (epoch seconds).
    pub fn is_expired_at(&self, now_seconds: u64) -> bool {
        now_seconds > self.expiry_timestamp
    }

    /// Returns true if this record holds a claim whose lease has lapsed and
    /// is therefore reclaimable.
    ///
    /// A claim without a lease timestamp is treated as live: the engine
    /// cannot prove it abandoned, so it is never reclaimed through this path.
    pub fn is_lease_expired(&self) -> bool {
        self.is_lease_expired_at(now_millis())
    }

    /// Lease check against an explicit clock value (epoch milliseconds).
    pub fn is_lease_expired_at(&self, now_millis: u64) -> bool {
        self.status.is_in_progress()
            && self
                .in_progress_expiry_timestamp
                .map(|lease| lease < now_millis)
                .unwrap_or(false)
    }

    /// Returns the stored response data, if any.
    pub fn response(&self) -> Option<&Value> {
        self.response_data.as_ref()
    }
}

/// Current time as epoch seconds.
pub fn now_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Current time as epoch milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
