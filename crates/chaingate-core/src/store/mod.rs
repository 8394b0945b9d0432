//! Shared counting/caching store used for nonce records, rate-limit counters,
//! gas-price caches, reorg history and distributed locks.
//!
//! Two backends: [`MemoryStore`] (single instance, always available) and,
//! with the `redis` feature, `RedisStore` for multi-instance deployments.

#[cfg(any(test, feature = "test-util"))]
pub mod failing;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::GatewayError;
use crate::health::{ComponentHealth, HealthCheck};

#[cfg(any(test, feature = "test-util"))]
pub use failing::FailingStore;
pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

/// Errors returned by a store backend.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The backend cannot be reached (connection refused, dropped, timed out).
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The backend rejected or failed a command.
    #[error("store command failed: {0}")]
    Command(String),

    /// A stored value could not be encoded or decoded.
    #[error("store value encoding: {0}")]
    Encoding(String),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Encoding(e.to_string())
    }
}

/// Primitives the gateway needs from a shared store.
#[async_trait]
pub trait SharedStore: Send + Sync + 'static {
    /// Short backend name for logs and health output.
    fn backend(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Set a value, replacing any existing one, with an optional TTL.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Set only if absent. Returns `true` when the value was written.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Returns `true` if a key was removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Delete `key` only if it currently holds `expected` (compare-and-delete).
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError>;

    /// Atomically increment a counter, setting `ttl` when the counter is
    /// created. Returns the new count and the time left before expiry.
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<(u64, Duration), StoreError>;

    /// Push to the head of a list and trim it to `max_len` entries.
    async fn list_push_trim(&self, key: &str, value: &str, max_len: usize) -> Result<(), StoreError>;

    /// Up to `limit` list entries, newest first.
    async fn list_range(&self, key: &str, limit: usize) -> Result<Vec<String>, StoreError>;

    async fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

/// Health check that pings the store.
pub struct StoreHealth(pub Arc<dyn SharedStore>);

#[async_trait]
impl HealthCheck for StoreHealth {
    async fn check(&self) -> Result<ComponentHealth, GatewayError> {
        let started = std::time::Instant::now();
        match self.0.ping().await {
            Ok(()) => Ok(ComponentHealth::healthy().with_details(serde_json::json!({
                "backend": self.0.backend(),
                "latency_ms": started.elapsed().as_millis() as u64,
            }))),
            Err(e) => Ok(ComponentHealth::unhealthy(e.to_string())
                .with_details(serde_json::json!({ "backend": self.0.backend() }))),
        }
    }
}
