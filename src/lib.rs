//! Idempotency engine for event-driven handlers.
//!
//! Makes a wrapped operation safe to retry: the first call with a given
//! payload executes and stores its result; repeated calls with the same
//! payload return the stored result without re-executing. A claim/lease
//! protocol over a pluggable persistence layer guarantees at-most-one
//! live execution per key, with leases bounding how long a crashed
//! claimant can block the key.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use lambda_idempotency::{
//!     IdempotencyConfig, IdempotencyHandler, InMemoryPersistenceLayer, InvocationContext,
//! };
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(InMemoryPersistenceLayer::new());
//! let config = IdempotencyConfig::from_env().with_event_key_expression("requestId");
//! let handler = IdempotencyHandler::new(store, config);
//!
//! let payload = json!({"requestId": "req-1", "amount": 25});
//! let receipt: String = handler
//!     .handle(&payload, InvocationContext::new(), |event| async move {
//!         // Runs at most once per requestId.
//!         Ok(format!("charged {}", event["amount"]))
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`IdempotencyHandler`] - the orchestrator: key derivation, claim
//!   loop, execution, outcome persistence.
//! - [`PersistenceLayer`] - the storage seam. Implementations provide
//!   atomic conditional writes; [`InMemoryPersistenceLayer`] is the
//!   bundled single-process implementation.
//! - [`IdempotencyRecord`] - the stored unit: key, status, expiry
//!   horizons, optional payload hash and response.
//! - [`IdempotencyConfig`] - tuning knobs: key/validation expressions,
//!   expiry windows, local cache, hash function, durable mode.

pub mod cache;
pub mod config;
pub mod error;
pub mod handler;
pub mod key;
pub mod persistence;
pub mod record;

pub use cache::LocalCache;
pub use config::{DurableMode, HashFunction, IdempotencyConfig};
pub use error::{BoxError, IdempotencyError};
pub use handler::{IdempotencyHandler, InvocationContext};
pub use key::{ExpressionEvaluator, JsonPointerEvaluator, KeyDeriver};
pub use persistence::{InMemoryPersistenceLayer, PersistenceError, PersistenceLayer};
pub use record::{IdempotencyRecord, RecordStatus};
