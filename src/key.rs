//! Key derivation and payload hashing.
//!
//! Turns an arbitrary JSON payload into a stable storage key
//! (`{scope}#{digest}`) and an optional validation hash. Object keys are
//! canonicalized (deep-sorted) before hashing so logically identical
//! payloads always hash identically regardless of field order.

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use md5::Md5;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::HashFunction;
use crate::error::IdempotencyError;

/// Black-box seam for key-extraction expressions: `(expression, payload) ->
/// value | none`. Implementations decide the expression language.
pub trait ExpressionEvaluator: Send + Sync {
    /// Evaluates `expression` against `payload`, returning the extracted
    /// value or `None` when the expression selects nothing.
    fn search(&self, expression: &str, payload: &Value) -> Option<Value>;
}

/// Default evaluator: JSON-pointer paths (`/order/id`), with dotted paths
/// (`order.id`) accepted as a convenience and rewritten to pointers.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonPointerEvaluator;

impl ExpressionEvaluator for JsonPointerEvaluator {
    fn search(&self, expression: &str, payload: &Value) -> Option<Value> {
        let pointer = if expression.starts_with('/') {
            expression.to_string()
        } else {
            format!("/{}", expression.replace('.', "/"))
        };
        match payload.pointer(&pointer) {
            Some(Value::Null) | None => None,
            Some(value) => Some(value.clone()),
        }
    }
}

/// Derives storage keys and validation hashes for one handler instance.
pub struct KeyDeriver {
    scope: String,
    key_expression: Option<String>,
    validation_expression: Option<String>,
    hash_function: HashFunction,
    raise_on_no_idempotency_key: bool,
    evaluator: Arc<dyn ExpressionEvaluator>,
}

impl std::fmt::Debug for KeyDeriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyDeriver")
            .field("scope", &self.scope)
            .field("key_expression", &self.key_expression)
            .field("validation_expression", &self.validation_expression)
            .field("hash_function", &self.hash_function)
            .field(
                "raise_on_no_idempotency_key",
                &self.raise_on_no_idempotency_key,
            )
            .finish()
    }
}

impl KeyDeriver {
    /// Creates a deriver scoped to `scope` (typically the function name).
    pub fn new(
        scope: impl Into<String>,
        key_expression: Option<String>,
        validation_expression: Option<String>,
        hash_function: HashFunction,
        raise_on_no_idempotency_key: bool,
        evaluator: Arc<dyn ExpressionEvaluator>,
    ) -> Self {
        Self {
            scope: scope.into(),
            key_expression,
            validation_expression,
            hash_function,
            raise_on_no_idempotency_key,
            evaluator,
        }
    }

    /// The scope prefix of every key this deriver produces.
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Derives the storage key for `payload`.
    ///
    /// When a key expression is configured, its extracted value is the key
    /// material. An expression that yields nothing either fails (when a key
    /// is required) or falls back to hashing the whole payload.
    pub fn derive_key(&self, payload: &Value) -> Result<String, IdempotencyError> {
        let material = match &self.key_expression {
            Some(expression) => self.evaluator.search(expression, payload),
            None => Some(payload.clone()),
        };

        let material = match material {
            Some(value) if !is_missing_key_material(&value) => value,
            _ => {
                if self.raise_on_no_idempotency_key {
                    return Err(IdempotencyError::missing_key(format!(
                        "no data found to create a hashed idempotency key, expression: {:?}",
                        self.key_expression
                    )));
                }
                tracing::warn!(
                    expression = ?self.key_expression,
                    "no value found for idempotency key, falling back to the whole payload"
                );
                payload.clone()
            }
        };

        Ok(format!("{}#{}", self.scope, self.digest(&material)?))
    }

    /// Hashes the validation payload, or returns `None` when payload
    /// validation is not configured.
    pub fn payload_hash(&self, payload: &Value) -> Result<Option<String>, IdempotencyError> {
        match &self.validation_expression {
            Some(expression) => {
                let extracted = self
                    .evaluator
                    .search(expression, payload)
                    .unwrap_or(Value::Null);
                Ok(Some(self.digest(&extracted)?))
            }
            None => Ok(None),
        }
    }

    fn digest(&self, material: &Value) -> Result<String, IdempotencyError> {
        let canonical = serde_json::to_string(&canonicalize(material))?;
        let digest = match self.hash_function {
            HashFunction::Sha256 => {
                let mut hasher = Sha256::new();
                hasher.update(canonical.as_bytes());
                URL_SAFE_NO_PAD.encode(hasher.finalize())
            }
            HashFunction::Md5 => {
                let mut hasher = Md5::new();
                hasher.update(canonical.as_bytes());
                URL_SAFE_NO_PAD.encode(hasher.finalize())
            }
        };
        Ok(digest)
    }
}

/// Rebuilds a JSON value with all object keys sorted, at every nesting
/// depth, so serialization order is independent of construction order.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key.clone(), canonicalize(value)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Key material is "missing" when it carries nothing to identify a call by:
/// null, an empty string, an empty container, or a container whose values
/// are all empty themselves.
fn is_missing_key_material(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
        Value::Array(items) => items.iter().all(is_missing_key_material),
        Value::Object(map) => map.values().all(is_missing_key_material),
    }
}
