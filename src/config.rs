//! Configuration for the idempotency engine.
//!
//! [`IdempotencyConfig`] is immutable per handler instance; the only
//! per-call input is the execution-budget hint carried by
//! [`InvocationContext`](crate::handler::InvocationContext).

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::key::{ExpressionEvaluator, JsonPointerEvaluator};

/// Environment variable that disables the engine entirely, making
/// `handle` a plain pass-through to the wrapped operation.
pub const IDEMPOTENCY_DISABLED_ENV: &str = "IDEMPOTENCY_DISABLED";

/// Default overall record TTL: one hour.
pub const DEFAULT_EXPIRES_AFTER: Duration = Duration::from_secs(60 * 60);

/// Default in-progress lease bound, also the cap applied to execution-budget
/// hints.
pub const DEFAULT_IN_PROGRESS_TTL: Duration = Duration::from_secs(60);

/// Default local cache capacity.
pub const DEFAULT_LOCAL_CACHE_MAX_SIZE: u64 = 500;

/// Durable operating mode of the engine.
///
/// In `Execution` mode a live concurrent claim is a race error. In `Replay`
/// mode re-entry into an already-claimed step is expected (a workflow replay
/// revisiting a step) and tolerated, accepting at-least-once semantics for
/// that step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DurableMode {
    /// Normal operation: a live claim by another caller is an error.
    #[default]
    Execution,
    /// Workflow replay: re-entry into a live claim proceeds to execution.
    Replay,
}

impl DurableMode {
    /// Returns true in execution mode.
    pub fn is_execution(&self) -> bool {
        matches!(self, Self::Execution)
    }

    /// Returns true in replay mode.
    pub fn is_replay(&self) -> bool {
        matches!(self, Self::Replay)
    }
}

/// Content-hash function used for keys and validation hashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HashFunction {
    /// SHA-256 (default).
    #[default]
    Sha256,
    /// MD5, for parity with stores populated by older clients.
    Md5,
}

/// Declarative policy consumed by the orchestrator.
#[derive(Clone)]
pub struct IdempotencyConfig {
    /// Expression extracting the key material from the payload; the whole
    /// payload is hashed when unset.
    pub event_key_expression: Option<String>,
    /// Expression selecting the payload subset to validate against the
    /// stored record; payload validation is enabled exactly when set.
    pub payload_validation_expression: Option<String>,
    /// Overall record TTL.
    pub expires_after: Duration,
    /// In-progress lease bound; also caps the execution-budget hint.
    pub in_progress_ttl: Duration,
    /// Enables the local cache of completed records.
    pub use_local_cache: bool,
    /// Local cache capacity; 0 disables the cache even when
    /// `use_local_cache` is set.
    pub local_cache_max_size: u64,
    /// Hash function for keys and validation hashes.
    pub hash_function: HashFunction,
    /// Fail instead of falling back to whole-payload hashing when the key
    /// expression yields nothing.
    pub raise_on_no_idempotency_key: bool,
    /// Durable operating mode.
    pub durable_mode: DurableMode,
    /// Engine kill switch; when false, `handle` runs the wrapped operation
    /// directly.
    pub enabled: bool,
    /// Key-extraction expression evaluator.
    pub expression_evaluator: Arc<dyn ExpressionEvaluator>,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            event_key_expression: None,
            payload_validation_expression: None,
            expires_after: DEFAULT_EXPIRES_AFTER,
            in_progress_ttl: DEFAULT_IN_PROGRESS_TTL,
            use_local_cache: false,
            local_cache_max_size: DEFAULT_LOCAL_CACHE_MAX_SIZE,
            hash_function: HashFunction::default(),
            raise_on_no_idempotency_key: false,
            durable_mode: DurableMode::default(),
            enabled: true,
            expression_evaluator: Arc::new(JsonPointerEvaluator),
        }
    }
}

impl std::fmt::Debug for IdempotencyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyConfig")
            .field("event_key_expression", &self.event_key_expression)
            .field(
                "payload_validation_expression",
                &self.payload_validation_expression,
            )
            .field("expires_after", &self.expires_after)
            .field("in_progress_ttl", &self.in_progress_ttl)
            .field("use_local_cache", &self.use_local_cache)
            .field("local_cache_max_size", &self.local_cache_max_size)
            .field("hash_function", &self.hash_function)
            .field(
                "raise_on_no_idempotency_key",
                &self.raise_on_no_idempotency_key,
            )
            .field("durable_mode", &self.durable_mode)
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl IdempotencyConfig {
    /// Creates a config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a config with defaults, honoring the
    /// [`IDEMPOTENCY_DISABLED_ENV`] kill switch.
    pub fn from_env() -> Self {
        let disabled = std::env::var(IDEMPOTENCY_DISABLED_ENV)
            .map(|v| {
                let v = v.trim().to_ascii_lowercase();
                v == "1" || v == "true" || v == "yes"
            })
            .unwrap_or(false);
        Self {
            enabled: !disabled,
            ..Self::default()
        }
    }

    /// Sets the key-extraction expression.
    pub fn with_event_key_expression(mut self, expression: impl Into<String>) -> Self {
        self.event_key_expression = Some(expression.into());
        self
    }

    /// Sets the payload-validation expression, enabling validation.
    pub fn with_payload_validation_expression(mut self, expression: impl Into<String>) -> Self {
        self.payload_validation_expression = Some(expression.into());
        self
    }

    /// Sets the overall record TTL.
    pub fn with_expires_after(mut self, expires_after: Duration) -> Self {
        self.expires_after = expires_after;
        self
    }

    /// Sets the in-progress lease bound.
    pub fn with_in_progress_ttl(mut self, in_progress_ttl: Duration) -> Self {
        self.in_progress_ttl = in_progress_ttl;
        self
    }

    /// Enables the local cache with the given capacity.
    pub fn with_local_cache(mut self, max_size: u64) -> Self {
        self.use_local_cache = true;
        self.local_cache_max_size = max_size;
        self
    }

    /// Sets the hash function.
    pub fn with_hash_function(mut self, hash_function: HashFunction) -> Self {
        self.hash_function = hash_function;
        self
    }

    /// Requires key material: fail instead of falling back to whole-payload
    /// hashing.
    pub fn with_raise_on_no_idempotency_key(mut self) -> Self {
        self.raise_on_no_idempotency_key = true;
        self
    }

    /// Sets the durable operating mode.
    pub fn with_durable_mode(mut self, durable_mode: DurableMode) -> Self {
        self.durable_mode = durable_mode;
        self
    }

    /// Disables the engine: `handle` becomes a pass-through.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Replaces the expression evaluator.
    pub fn with_expression_evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.expression_evaluator = evaluator;
        self
    }

    /// Returns true when payload validation is configured.
    pub fn payload_validation_enabled(&self) -> bool {
        self.payload_validation_expression.is_some()
    }

    /// Effective local cache capacity: 0 when the cache is off.
    pub fn effective_cache_capacity(&self) -> u64 {
        if self.use_local_cache {
            self.local_cache_max_size
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_policy() {
        let config = IdempotencyConfig::default();
        assert!(config.enabled);
        assert!(config.event_key_expression.is_none());
        assert!(!config.payload_validation_enabled());
        assert_eq!(config.expires_after, Duration::from_secs(3600));
        assert_eq!(config.in_progress_ttl, Duration::from_secs(60));
        assert!(!config.use_local_cache);
        assert_eq!(config.local_cache_max_size, 500);
        assert_eq!(config.hash_function, HashFunction::Sha256);
        assert!(!config.raise_on_no_idempotency_key);
        assert!(config.durable_mode.is_execution());
    }

    #[test]
    fn cache_capacity_is_zero_when_disabled() {
        let config = IdempotencyConfig::default();
        assert_eq!(config.effective_cache_capacity(), 0);
        let config = config.with_local_cache(100);
        assert_eq!(config.effective_cache_capacity(), 100);
    }

    #[test]
    fn builder_methods_compose() {
        let config = IdempotencyConfig::new()
            .with_event_key_expression("order.id")
            .with_payload_validation_expression("amount")
            .with_expires_after(Duration::from_secs(10))
            .with_durable_mode(DurableMode::Replay)
            .with_raise_on_no_idempotency_key();
        assert_eq!(config.event_key_expression.as_deref(), Some("order.id"));
        assert!(config.payload_validation_enabled());
        assert_eq!(config.expires_after, Duration::from_secs(10));
        assert!(config.durable_mode.is_replay());
        assert!(config.raise_on_no_idempotency_key);
    }

    #[test]
    fn durable_mode_helpers() {
        assert!(DurableMode::Execution.is_execution());
        assert!(!DurableMode::Execution.is_replay());
        assert!(DurableMode::Replay.is_replay());
        assert_eq!(DurableMode::default(), DurableMode::Execution);
    }
}
