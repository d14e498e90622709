//! Idempotency orchestrator.
//!
//! [`IdempotencyHandler`] drives the claim/lease state machine: derive the
//! key, try the local-cache fast path, attempt a claim against the
//! persistence layer, resolve races against the record the conflict
//! carried, execute the wrapped operation at most once, and persist the
//! outcome.
//!
//! All state needed for the duration of one call (the derived key, the
//! validation hash, the claim lease) lives in a per-call value threaded
//! through the state machine, never on the handler itself: one handler
//! instance serves many - possibly overlapping - logical invocations over
//! its lifetime.

use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::cache::LocalCache;
use crate::config::IdempotencyConfig;
use crate::error::{BoxError, IdempotencyError};
use crate::key::KeyDeriver;
use crate::persistence::{PersistenceError, PersistenceLayer};
use crate::record::{now_millis, now_seconds, IdempotencyRecord, RecordStatus};

/// Maximum claim attempts for one call. The second attempt covers the
/// legitimate reclaim cases (expired record, lapsed lease, record deleted
/// between calls); anything beyond that is a wedged record or clock skew
/// and fails fatally rather than looping.
pub const MAX_CLAIM_ATTEMPTS: u32 = 2;

/// Margin subtracted from the execution-budget hint so the lease lapses
/// just before the runtime would kill the invocation holding it.
const LEASE_BUFFER_MS: u64 = 100;

/// Environment variable providing the default key scope.
const FUNCTION_NAME_ENV: &str = "AWS_LAMBDA_FUNCTION_NAME";

/// Per-call metadata supplied by the caller of [`IdempotencyHandler::handle`].
///
/// `remaining_time_ms` is the execution-budget hint: how long the current
/// invocation may still run before the runtime terminates it. When present
/// it bounds the claim lease so an abandoned claim cannot outlive the
/// physical execution that held it.
#[derive(Debug, Clone, Copy, Default)]
pub struct InvocationContext {
    /// Remaining execution budget in milliseconds, when known.
    pub remaining_time_ms: Option<u64>,
}

impl InvocationContext {
    /// Creates an empty context (no budget hint).
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a context carrying an execution-budget hint.
    pub fn with_remaining_time_ms(remaining_time_ms: u64) -> Self {
        Self {
            remaining_time_ms: Some(remaining_time_ms),
        }
    }
}

/// State scoped to a single `handle` call, threaded through the state
/// machine.
struct CallState {
    key: String,
    payload_hash: Option<String>,
    /// Lease the call holds (or adopted, in replay re-entry), epoch millis.
    lease: Option<u64>,
}

/// Outcome of resolving a claim conflict.
enum ConflictResolution {
    /// A valid completed record exists; return its stored response.
    ReturnStored(IdempotencyRecord),
    /// Proceed to execution (replay-mode re-entry into a live claim),
    /// adopting the stored claim's lease.
    Run { adopted_lease: Option<u64> },
    /// The record is reclaimable; retry the claim.
    Retry,
}

/// The idempotency state machine over a persistence layer.
pub struct IdempotencyHandler {
    store: Arc<dyn PersistenceLayer>,
    config: IdempotencyConfig,
    deriver: KeyDeriver,
    cache: LocalCache,
}

impl std::fmt::Debug for IdempotencyHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyHandler")
            .field("config", &self.config)
            .field("deriver", &self.deriver)
            .finish()
    }
}

impl IdempotencyHandler {
    /// Creates a handler whose key scope defaults to the function name from
    /// the environment, falling back to `"idempotency"`.
    pub fn new(store: Arc<dyn PersistenceLayer>, config: IdempotencyConfig) -> Self {
        let scope =
            std::env::var(FUNCTION_NAME_ENV).unwrap_or_else(|_| "idempotency".to_string());
        Self::with_scope(store, config, scope)
    }

    /// Creates a handler with an explicit key scope.
    pub fn with_scope(
        store: Arc<dyn PersistenceLayer>,
        config: IdempotencyConfig,
        scope: impl Into<String>,
    ) -> Self {
        let deriver = KeyDeriver::new(
            scope,
            config.event_key_expression.clone(),
            config.payload_validation_expression.clone(),
            config.hash_function,
            config.raise_on_no_idempotency_key,
            Arc::clone(&config.expression_evaluator),
        );
        let cache = LocalCache::new(config.effective_cache_capacity());
        Self {
            store,
            config,
            deriver,
            cache,
        }
    }

    /// The key scope of this handler.
    pub fn scope(&self) -> &str {
        self.deriver.scope()
    }

    /// The configuration of this handler.
    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    /// Runs `operation` idempotently for `payload`.
    ///
    /// A repeated call with the same derived key returns the stored result
    /// without re-executing the operation. Claim races are resolved
    /// internally; every other error surfaces unchanged: the operation's
    /// own error comes back as [`IdempotencyError::Function`] after the
    /// claim has been released, so a subsequent call is fresh.
    pub async fn handle<F, Fut, T>(
        &self,
        payload: &Value,
        invocation: InvocationContext,
        operation: F,
    ) -> Result<T, IdempotencyError>
    where
        F: FnOnce(Value) -> Fut,
        Fut: Future<Output = Result<T, BoxError>>,
        T: Serialize + DeserializeOwned,
    {
        if !self.config.enabled {
            return operation(payload.clone())
                .await
                .map_err(IdempotencyError::from);
        }

        let mut call = CallState {
            key: self.deriver.derive_key(payload)?,
            payload_hash: self.deriver.payload_hash(payload)?,
            lease: Some(self.lease_expiry(&invocation)),
        };

        // Fast path: a fresh completed record in the local cache answers the
        // call without touching the store. Replay mode always goes to the
        // store, since re-entry decisions depend on authoritative state.
        if !self.config.durable_mode.is_replay() {
            if let Some(record) = self.cache.get(&call.key) {
                self.validate_payload(&call, &record)?;
                tracing::debug!(key = %call.key, "returning locally cached response");
                return deserialize_response(&record);
            }
        }

        let mut attempts = 0u32;
        loop {
            if attempts >= MAX_CLAIM_ATTEMPTS {
                return Err(IdempotencyError::inconsistent_state(format!(
                    "claim attempts exhausted after {} tries for key {}",
                    MAX_CLAIM_ATTEMPTS, call.key
                )));
            }
            attempts += 1;

            let claim = IdempotencyRecord::in_progress(
                call.key.clone(),
                self.record_expiry(),
                call.lease,
                call.payload_hash.clone(),
            );
            match self.store.save_in_progress(&claim).await {
                Ok(()) => break,
                Err(PersistenceError::ItemAlreadyExists { existing }) => {
                    let existing = match existing {
                        Some(record) => *record,
                        None => match self.store.get_record(&call.key).await {
                            Ok(record) => record,
                            Err(PersistenceError::ItemNotFound { .. }) => {
                                // Deleted between the conflict and the read;
                                // the next attempt should win the key.
                                tracing::debug!(key = %call.key, "conflicting record vanished, retrying claim");
                                continue;
                            }
                            Err(err) => {
                                return Err(IdempotencyError::persistence(
                                    format!(
                                        "failed to fetch conflicting record for key {}",
                                        call.key
                                    ),
                                    err,
                                ))
                            }
                        },
                    };
                    match self.resolve_conflict(&call, existing)? {
                        ConflictResolution::ReturnStored(record) => {
                            self.cache.put(record.clone());
                            tracing::debug!(key = %call.key, "returning stored response");
                            return deserialize_response(&record);
                        }
                        ConflictResolution::Run { adopted_lease } => {
                            call.lease = adopted_lease;
                            break;
                        }
                        ConflictResolution::Retry => continue,
                    }
                }
                Err(err) => {
                    return Err(IdempotencyError::persistence(
                        format!("failed to save in-progress record for key {}", call.key),
                        err,
                    ))
                }
            }
        }

        self.execute(operation, payload, call).await
    }

    /// Decides what to do with the record a claim conflict carried.
    fn resolve_conflict(
        &self,
        call: &CallState,
        existing: IdempotencyRecord,
    ) -> Result<ConflictResolution, IdempotencyError> {
        match existing.status() {
            RecordStatus::Expired => {
                tracing::debug!(key = %call.key, "stored record expired, reclaiming");
                Ok(ConflictResolution::Retry)
            }
            RecordStatus::Completed => {
                self.validate_payload(call, &existing)?;
                Ok(ConflictResolution::ReturnStored(existing))
            }
            RecordStatus::InProgress => {
                if existing.is_lease_expired() {
                    tracing::debug!(key = %call.key, "stored claim lease lapsed, reclaiming");
                    return Ok(ConflictResolution::Retry);
                }
                if self.config.durable_mode.is_replay() {
                    // Intentional re-entry: a replayed step revisits its own
                    // claim. Adopt the stored lease so a successful outcome
                    // write matches it.
                    self.validate_payload(call, &existing)?;
                    tracing::debug!(key = %call.key, "replay re-entry into live claim");
                    return Ok(ConflictResolution::Run {
                        adopted_lease: existing.in_progress_expiry_timestamp,
                    });
                }
                Err(IdempotencyError::already_in_progress(
                    format!("execution already in progress for key {}", call.key),
                    Some(existing),
                ))
            }
        }
    }

    /// Runs the wrapped operation and persists its outcome.
    async fn execute<F, Fut, T>(
        &self,
        operation: F,
        payload: &Value,
        call: CallState,
    ) -> Result<T, IdempotencyError>
    where
        F: FnOnce(Value) -> Fut,
        Fut: Future<Output = Result<T, BoxError>>,
        T: Serialize + DeserializeOwned,
    {
        tracing::debug!(key = %call.key, "executing wrapped operation");
        match operation(payload.clone()).await {
            Ok(result) => {
                let response = serde_json::to_value(&result)?;
                let record = IdempotencyRecord::completed(
                    call.key.clone(),
                    self.record_expiry(),
                    call.lease,
                    call.payload_hash.clone(),
                    response,
                );
                match self.store.save_success(&record).await {
                    Ok(()) => {
                        self.cache.put(record);
                        Ok(result)
                    }
                    Err(PersistenceError::ConditionFailed { .. })
                        if self.config.durable_mode.is_replay() =>
                    {
                        // The other entrant into this claim recorded the
                        // outcome first; both executions produced the same
                        // replayed step, so our local result stands.
                        tracing::debug!(key = %call.key, "claim superseded during replay re-entry");
                        Ok(result)
                    }
                    Err(PersistenceError::ConditionFailed { key }) => {
                        Err(IdempotencyError::inconsistent_state(format!(
                            "claim for key {key} was lost before the result could be stored"
                        )))
                    }
                    Err(err) => Err(IdempotencyError::persistence(
                        format!("failed to save completed record for key {}", call.key),
                        err,
                    )),
                }
            }
            Err(source) => {
                // Release the key so a retry with the same payload is fresh.
                // A cleanup failure is reported on its own and never replaces
                // the operation's error.
                if let Err(cleanup) = self.store.save_failure(&call.key).await {
                    tracing::error!(
                        key = %call.key,
                        error = %cleanup,
                        "failed to delete idempotency record after wrapped operation error"
                    );
                }
                self.cache.remove(&call.key);
                Err(IdempotencyError::Function { source })
            }
        }
    }

    /// Validates the call's payload hash against a stored record. A no-op
    /// when payload validation is not configured.
    fn validate_payload(
        &self,
        call: &CallState,
        stored: &IdempotencyRecord,
    ) -> Result<(), IdempotencyError> {
        if let Some(expected) = &call.payload_hash {
            if stored.payload_hash.as_deref() != Some(expected.as_str()) {
                return Err(IdempotencyError::validation(
                    format!("payload does not match stored record for key {}", call.key),
                    Some(stored.clone()),
                ));
            }
        }
        Ok(())
    }

    /// Claim lease bound for this call: `now + min(configured ttl, budget -
    /// buffer)` when a budget hint is available, else `now + configured ttl`.
    fn lease_expiry(&self, invocation: &InvocationContext) -> u64 {
        let ttl_ms = self.config.in_progress_ttl.as_millis() as u64;
        let lease_ms = match invocation.remaining_time_ms {
            Some(budget) => ttl_ms.min(budget.saturating_sub(LEASE_BUFFER_MS)),
            None => ttl_ms,
        };
        now_millis() + lease_ms
    }

    /// Overall record expiry for records written by this call.
    fn record_expiry(&self) -> u64 {
        now_seconds() + self.config.expires_after.as_secs()
    }
}

/// Deserializes the stored response of a completed record.
fn deserialize_response<T: DeserializeOwned>(
    record: &IdempotencyRecord,
) -> Result<T, IdempotencyError> {
    let value = record.response().cloned().ok_or_else(|| {
        IdempotencyError::serdes(format!(
            "completed record for key {} has no response data",
            record.idempotency_key
        ))
    })?;
    serde_json::from_value(value).map_err(IdempotencyError::from)
}
