//! Shared test utilities for integration tests.
//!
//! Provides a recording persistence layer and helpers for building handlers
//! and records used across integration tests.

#![allow(dead_code)] // These utilities are used by other integration test files

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use lambda_idempotency::record::now_seconds;
use lambda_idempotency::{
    IdempotencyConfig, IdempotencyHandler, IdempotencyRecord, InMemoryPersistenceLayer,
    PersistenceError, PersistenceLayer,
};
use serde_json::Value;

// =============================================================================
// Recording Persistence Layer
// =============================================================================

/// The persistence-layer operations, recorded for verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    SaveInProgress { key: String },
    SaveSuccess { key: String },
    SaveFailure { key: String },
    GetRecord { key: String },
}

/// A persistence layer that records every call and can be told to fail.
///
/// Delegates to an [`InMemoryPersistenceLayer`] for real semantics, so tests
/// exercise the same conditional-write behavior as the bundled backend while
/// also being able to assert on the exact call sequence or inject backend
/// errors.
pub struct RecordingPersistenceLayer {
    inner: InMemoryPersistenceLayer,
    calls: Mutex<Vec<StoreCall>>,
    /// Pre-loaded errors returned (in order) before delegating to the inner
    /// store. `None` entries delegate normally.
    injected_errors: Mutex<Vec<Option<PersistenceError>>>,
}

impl RecordingPersistenceLayer {
    pub fn new() -> Self {
        Self {
            inner: InMemoryPersistenceLayer::new(),
            calls: Mutex::new(Vec::new()),
            injected_errors: Mutex::new(Vec::new()),
        }
    }

    /// Queues an error to be returned on the next store call.
    pub fn with_injected_error(self, error: PersistenceError) -> Self {
        self.injected_errors.lock().unwrap().push(Some(error));
        self
    }

    /// Queues a call that delegates normally (used to skip past calls before
    /// the one that should fail).
    pub fn with_passthrough(self) -> Self {
        self.injected_errors.lock().unwrap().push(None);
        self
    }

    /// Returns all calls made to this store.
    pub fn calls(&self) -> Vec<StoreCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of calls of a given kind.
    pub fn count(&self, matches: impl Fn(&StoreCall) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| matches(c)).count()
    }

    pub async fn seed(&self, record: IdempotencyRecord) {
        self.inner.seed(record).await;
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.is_empty().await
    }

    fn record_call(&self, call: StoreCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn next_injected_error(&self) -> Option<PersistenceError> {
        let mut errors = self.injected_errors.lock().unwrap();
        if errors.is_empty() {
            None
        } else {
            errors.remove(0)
        }
    }
}

impl Default for RecordingPersistenceLayer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PersistenceLayer for RecordingPersistenceLayer {
    async fn save_in_progress(&self, record: &IdempotencyRecord) -> Result<(), PersistenceError> {
        self.record_call(StoreCall::SaveInProgress {
            key: record.idempotency_key.clone(),
        });
        if let Some(err) = self.next_injected_error() {
            return Err(err);
        }
        self.inner.save_in_progress(record).await
    }

    async fn save_success(&self, record: &IdempotencyRecord) -> Result<(), PersistenceError> {
        self.record_call(StoreCall::SaveSuccess {
            key: record.idempotency_key.clone(),
        });
        if let Some(err) = self.next_injected_error() {
            return Err(err);
        }
        self.inner.save_success(record).await
    }

    async fn save_failure(&self, idempotency_key: &str) -> Result<(), PersistenceError> {
        self.record_call(StoreCall::SaveFailure {
            key: idempotency_key.to_string(),
        });
        if let Some(err) = self.next_injected_error() {
            return Err(err);
        }
        self.inner.save_failure(idempotency_key).await
    }

    async fn get_record(&self, idempotency_key: &str) -> Result<IdempotencyRecord, PersistenceError> {
        self.record_call(StoreCall::GetRecord {
            key: idempotency_key.to_string(),
        });
        if let Some(err) = self.next_injected_error() {
            return Err(err);
        }
        self.inner.get_record(idempotency_key).await
    }
}

// =============================================================================
// Test Helper Functions
// =============================================================================

/// Installs a tracing subscriber writing through the test capture, so engine
/// log output shows up under `--nocapture`. Safe to call from every test;
/// repeat installs are ignored.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Scope used by all integration-test handlers, so derived keys are stable.
pub const TEST_SCOPE: &str = "testFunction";

/// Builds a handler over a fresh recording store.
pub fn handler_with_config(
    config: IdempotencyConfig,
) -> (IdempotencyHandler, Arc<RecordingPersistenceLayer>) {
    let store = Arc::new(RecordingPersistenceLayer::new());
    let handler = IdempotencyHandler::with_scope(store.clone(), config, TEST_SCOPE);
    (handler, store)
}

/// Builds a handler over a caller-provided store.
pub fn handler_with_store(
    store: Arc<RecordingPersistenceLayer>,
    config: IdempotencyConfig,
) -> IdempotencyHandler {
    IdempotencyHandler::with_scope(store, config, TEST_SCOPE)
}

/// Derives the key the handler would derive for `payload` under the default
/// configuration (whole payload hashed), by running a throwaway handler.
pub async fn stored_key_for(payload: &Value) -> String {
    let (handler, store) = handler_with_config(IdempotencyConfig::default());
    let _: Value = handler
        .handle(
            payload,
            lambda_idempotency::InvocationContext::new(),
            |_| async { Ok(Value::Null) },
        )
        .await
        .expect("key derivation call");
    match store.calls().first().expect("at least one call") {
        StoreCall::SaveInProgress { key } => key.clone(),
        other => panic!("unexpected first call {other:?}"),
    }
}

/// A completed record with a given stored response, expiring in one hour.
pub fn completed_record(key: &str, response: Value) -> IdempotencyRecord {
    IdempotencyRecord::completed(key, now_seconds() + 3600, None, None, response)
}
