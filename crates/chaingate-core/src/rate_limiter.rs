//! Fixed-window rate limiter keyed by caller identity.
//!
//! Counters live in the shared store so every gateway instance sees the same
//! window. When the store cannot be reached the limiter keeps counting in an
//! in-process window map instead of rejecting traffic.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::health::{ComponentHealth, HealthCheck};
use crate::store::SharedStore;
use crate::task::{sleep_or_stop, TaskHandle};

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub window: Duration,
    /// Requests allowed per caller per window.
    pub max_requests: u64,
    /// How often expired in-process windows are evicted.
    pub sweep_interval: Duration,
    pub key_prefix: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_requests: 100,
            sweep_interval: Duration::from_secs(60),
            key_prefix: "ratelimit".into(),
        }
    }
}

/// Counter state after an increment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitInfo {
    pub count: u64,
    /// Negative once the caller is over quota.
    pub remaining: i64,
    pub reset_at: DateTime<Utc>,
}

impl RateLimitInfo {
    /// Whole seconds until the window resets, at least one.
    pub fn retry_after_seconds(&self) -> u64 {
        let millis = (self.reset_at - Utc::now()).num_milliseconds().max(0) as u64;
        millis.div_ceil(1000).max(1)
    }
}

struct LocalWindow {
    count: u64,
    window_start: Instant,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    store: Arc<dyn SharedStore>,
    local: Mutex<HashMap<String, LocalWindow>>,
    /// Set while the store is failing; cleared on the next store success.
    fallback_since: Mutex<Option<DateTime<Utc>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, store: Arc<dyn SharedStore>) -> Self {
        Self {
            config,
            store,
            local: Mutex::new(HashMap::new()),
            fallback_since: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn store_key(&self, key: &str) -> String {
        format!("{}:{}", self.config.key_prefix, key)
    }

    fn local(&self) -> MutexGuard<'_, HashMap<String, LocalWindow>> {
        self.local.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn info(&self, count: u64, ttl: Duration) -> RateLimitInfo {
        RateLimitInfo {
            count,
            remaining: self.config.max_requests as i64 - count as i64,
            reset_at: Utc::now() + chrono::Duration::milliseconds(ttl.as_millis() as i64),
        }
    }

    fn set_fallback(&self, active: bool) {
        let mut since = self.fallback_since.lock().unwrap_or_else(PoisonError::into_inner);
        match (active, since.is_some()) {
            (true, false) => {
                *since = Some(Utc::now());
                tracing::warn!("rate limiter store unavailable, counting in-process");
            }
            (false, true) => {
                *since = None;
                tracing::info!("rate limiter store recovered");
            }
            _ => {}
        }
    }

    /// Whether counts are currently kept in-process only.
    pub fn in_fallback(&self) -> bool {
        self.fallback_since
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn increment_local(&self, key: &str) -> RateLimitInfo {
        let window = self.config.window;
        let now = Instant::now();
        let mut local = self.local();
        let state = local.entry(key.to_string()).or_insert(LocalWindow {
            count: 0,
            window_start: now,
        });
        if now.duration_since(state.window_start) >= window {
            state.count = 0;
            state.window_start = now;
        }
        state.count = state.count.saturating_add(1);
        let ttl = window.saturating_sub(now.duration_since(state.window_start));
        let count = state.count;
        drop(local);
        self.info(count, ttl)
    }

    /// Count one request for `key`. Never fails.
    pub async fn increment_count(&self, key: &str) -> RateLimitInfo {
        match self
            .store
            .incr_with_expiry(&self.store_key(key), self.config.window)
            .await
        {
            Ok((count, ttl)) => {
                self.set_fallback(false);
                self.info(count, ttl)
            }
            Err(e) => {
                tracing::debug!(key, error = %e, "rate limit store increment failed");
                self.set_fallback(true);
                self.increment_local(key)
            }
        }
    }

    /// Count `n` requests and fail if the caller did not have `n` requests of
    /// quota left before the call.
    pub async fn consume(&self, key: &str, n: u64) -> Result<RateLimitInfo, GatewayError> {
        if n == 0 {
            return Ok(self.peek(key).await);
        }
        let mut info = self.increment_count(key).await;
        for _ in 1..n {
            info = self.increment_count(key).await;
        }
        if info.remaining < 0 {
            tracing::debug!(key, count = info.count, "rate limit exceeded");
            return Err(GatewayError::RateLimitExceeded {
                retry_after_seconds: info.retry_after_seconds(),
            });
        }
        Ok(info)
    }

    /// Current counter without incrementing. When read from the store the
    /// reset time is an upper bound.
    pub async fn peek(&self, key: &str) -> RateLimitInfo {
        match self.store.get(&self.store_key(key)).await {
            Ok(value) => {
                let count = value.and_then(|v| v.parse().ok()).unwrap_or(0);
                self.info(count, self.config.window)
            }
            Err(_) => {
                let window = self.config.window;
                let local = self.local();
                match local.get(key) {
                    Some(w) if w.window_start.elapsed() < window => {
                        self.info(w.count, window.saturating_sub(w.window_start.elapsed()))
                    }
                    _ => self.info(0, window),
                }
            }
        }
    }

    /// Forget the caller's current window.
    pub async fn reset(&self, key: &str) -> Result<(), GatewayError> {
        self.local().remove(key);
        self.store.delete(&self.store_key(key)).await?;
        Ok(())
    }

    /// Evict expired in-process windows. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let window = self.config.window;
        let mut local = self.local();
        let before = local.len();
        local.retain(|_, w| w.window_start.elapsed() < window);
        before - local.len()
    }

    /// Number of in-process windows currently held.
    pub fn local_windows(&self) -> usize {
        self.local().len()
    }

    /// Start the periodic sweep.
    pub fn start(self: &Arc<Self>) -> TaskHandle {
        let mut handle = TaskHandle::new("rate_limiter");
        let mut stop = handle.signal();
        let this = Arc::clone(self);
        handle.push(tokio::spawn(async move {
            while sleep_or_stop(&mut stop, this.config.sweep_interval).await {
                let removed = this.sweep();
                if removed > 0 {
                    tracing::debug!(removed, "swept expired rate limit windows");
                }
            }
        }));
        handle
    }
}

#[async_trait]
impl HealthCheck for RateLimiter {
    async fn check(&self) -> Result<ComponentHealth, GatewayError> {
        let since = *self.fallback_since.lock().unwrap_or_else(PoisonError::into_inner);
        let details = serde_json::json!({
            "backend": self.store.backend(),
            "local_windows": self.local_windows(),
            "max_requests": self.config.max_requests,
            "window_secs": self.config.window.as_secs(),
        });
        Ok(match since {
            Some(at) => ComponentHealth::degraded(format!("store unavailable since {at}, counting in-process"))
                .with_details(details),
            None => ComponentHealth::healthy().with_details(details),
        })
    }
}
