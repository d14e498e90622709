//! Error types for the idempotency engine.
//!
//! [`IdempotencyError`] is the public taxonomy surfaced by
//! [`IdempotencyHandler::handle`](crate::handler::IdempotencyHandler::handle).
//! Claim races are resolved internally and never leak; everything else is
//! surfaced unchanged so idempotency stays transparent to the wrapped
//! operation's own success/error contract.

use thiserror::Error;

use crate::persistence::PersistenceError;
use crate::record::IdempotencyRecord;

/// Boxed error type produced by wrapped operations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The error taxonomy surfaced to callers of the engine.
#[derive(Debug, Error)]
pub enum IdempotencyError {
    /// A live concurrent claim exists for the key (execution mode only).
    /// Never retried internally.
    #[error("execution already in progress: {message}")]
    AlreadyInProgress {
        /// Description of the conflict.
        message: String,
        /// The live claim, when known.
        existing: Option<Box<IdempotencyRecord>>,
    },

    /// The payload hash does not match the stored record for this key:
    /// a key was reused for a different payload, which is a caller error.
    #[error("payload does not match stored record: {message}")]
    Validation {
        /// Description of the mismatch.
        message: String,
        /// The stored record that failed validation, when known.
        existing: Option<Box<IdempotencyRecord>>,
    },

    /// The key expression yielded no key material and the configuration
    /// requires one.
    #[error("no idempotency key found: {message}")]
    MissingIdempotencyKey {
        /// Description of what was evaluated.
        message: String,
    },

    /// State observed across persistence calls never converged: reclaim
    /// attempts were exhausted, or the claim was lost before the success
    /// write. Guards against infinite loops under clock skew or a wedged
    /// record.
    #[error("inconsistent idempotency state: {message}")]
    InconsistentState {
        /// Description of the inconsistency.
        message: String,
    },

    /// Backend failure, surfaced as-is. No partial state is assumed
    /// consistent.
    #[error("persistence layer error: {message}")]
    PersistenceLayer {
        /// Description of the failed call.
        message: String,
        /// The backend error.
        #[source]
        source: PersistenceError,
    },

    /// Payload or response (de)serialization failure.
    #[error("serialization error: {message}")]
    SerDes {
        /// Description of the failure.
        message: String,
    },

    /// The wrapped operation's own error, re-raised unchanged after
    /// best-effort cleanup of the claim.
    #[error("{source}")]
    Function {
        /// The original error from the wrapped operation.
        #[source]
        source: BoxError,
    },
}

impl IdempotencyError {
    /// Creates an `AlreadyInProgress` error carrying the live claim.
    pub fn already_in_progress(
        message: impl Into<String>,
        existing: Option<IdempotencyRecord>,
    ) -> Self {
        Self::AlreadyInProgress {
            message: message.into(),
            existing: existing.map(Box::new),
        }
    }

    /// Creates a `Validation` error carrying the stored record.
    pub fn validation(message: impl Into<String>, existing: Option<IdempotencyRecord>) -> Self {
        Self::Validation {
            message: message.into(),
            existing: existing.map(Box::new),
        }
    }

    /// Creates a `MissingIdempotencyKey` error.
    pub fn missing_key(message: impl Into<String>) -> Self {
        Self::MissingIdempotencyKey {
            message: message.into(),
        }
    }

    /// Creates an `InconsistentState` error.
    pub fn inconsistent_state(message: impl Into<String>) -> Self {
        Self::InconsistentState {
            message: message.into(),
        }
    }

    /// Creates a `PersistenceLayer` error from a failed backend call.
    pub fn persistence(message: impl Into<String>, source: PersistenceError) -> Self {
        Self::PersistenceLayer {
            message: message.into(),
            source,
        }
    }

    /// Creates a `SerDes` error.
    pub fn serdes(message: impl Into<String>) -> Self {
        Self::SerDes {
            message: message.into(),
        }
    }

    /// Returns true for errors caused by the caller reusing a key or
    /// racing a live claim, as opposed to engine or backend failures.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::AlreadyInProgress { .. }
                | Self::Validation { .. }
                | Self::MissingIdempotencyKey { .. }
        )
    }
}

impl From<serde_json::Error> for IdempotencyError {
    fn from(error: serde_json::Error) -> Self {
        Self::SerDes {
            message: error.to_string(),
        }
    }
}

impl From<BoxError> for IdempotencyError {
    fn from(source: BoxError) -> Self {
        Self::Function { source }
    }
}
