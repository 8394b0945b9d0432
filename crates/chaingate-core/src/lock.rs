//! Distributed locking over a [`SharedStore`].
//!
//! A lock is a key written with SET-NX and a random token; release only
//! deletes the key while it still holds the caller's token, so a holder whose
//! lease expired cannot release someone else's lock.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::store::{SharedStore, StoreError};

#[derive(Debug, Clone, Error)]
pub enum LockError {
    #[error("timed out acquiring lock '{key}'")]
    Timeout { key: String },

    #[error("lock backend unavailable: {0}")]
    Unavailable(String),

    /// The backend is reachable but failed the lock command.
    #[error("lock backend error: {0}")]
    Backend(String),
}

impl From<StoreError> for LockError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(msg) => LockError::Unavailable(msg),
            other => LockError::Backend(other.to_string()),
        }
    }
}

/// Proof of a held lock. Pass back to [`DistributedLock::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockGuard {
    pub key: String,
    pub token: String,
}

#[async_trait]
pub trait DistributedLock: Send + Sync + 'static {
    /// Acquire `key`, holding it for at most `lease`.
    async fn acquire(&self, key: &str, lease: Duration) -> Result<LockGuard, LockError>;

    /// Release a held lock. Releasing an expired or foreign lock is a no-op.
    async fn release(&self, guard: LockGuard) -> Result<(), LockError>;
}

/// [`DistributedLock`] built on SET-NX + compare-and-delete.
pub struct StoreLock {
    store: Arc<dyn SharedStore>,
    acquire_timeout: Duration,
    retry_interval: Duration,
}

impl StoreLock {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self {
            store,
            acquire_timeout: Duration::from_secs(5),
            retry_interval: Duration::from_millis(10),
        }
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }
}

#[async_trait]
impl DistributedLock for StoreLock {
    async fn acquire(&self, key: &str, lease: Duration) -> Result<LockGuard, LockError> {
        let token = Uuid::new_v4().to_string();
        let deadline = Instant::now() + self.acquire_timeout;
        loop {
            if self.store.set_nx(key, &token, lease).await? {
                tracing::trace!(key, "lock acquired");
                return Ok(LockGuard {
                    key: key.to_string(),
                    token,
                });
            }
            if Instant::now() >= deadline {
                return Err(LockError::Timeout { key: key.to_string() });
            }
            tokio::time::sleep(self.retry_interval).await;
        }
    }

    async fn release(&self, guard: LockGuard) -> Result<(), LockError> {
        let released = self.store.delete_if_equals(&guard.key, &guard.token).await?;
        if !released {
            tracing::warn!(key = %guard.key, "lock expired before release");
        }
        Ok(())
    }
}

/// Lock that always succeeds immediately. For callers that already serialize
/// access in-process and run a single instance.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLock;

#[async_trait]
impl DistributedLock for NoopLock {
    async fn acquire(&self, key: &str, _lease: Duration) -> Result<LockGuard, LockError> {
        Ok(LockGuard {
            key: key.to_string(),
            token: String::new(),
        })
    }

    async fn release(&self, _guard: LockGuard) -> Result<(), LockError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FailingStore, MemoryStore};

    fn lock(timeout_ms: u64) -> StoreLock {
        StoreLock::new(Arc::new(MemoryStore::new()))
            .with_acquire_timeout(Duration::from_millis(timeout_ms))
            .with_retry_interval(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn second_acquire_times_out_while_held() {
        let lock = lock(30);
        let guard = lock.acquire("k", Duration::from_secs(10)).await.unwrap();
        let err = lock.acquire("k", Duration::from_secs(10)).await.unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));
        lock.release(guard).await.unwrap();
        assert!(lock.acquire("k", Duration::from_secs(10)).await.is_ok());
    }

    #[tokio::test]
    async fn waiter_gets_lock_after_release() {
        let lock = Arc::new(lock(1_000));
        let guard = lock.acquire("k", Duration::from_secs(10)).await.unwrap();
        let l2 = lock.clone();
        let waiter = tokio::spawn(async move { l2.acquire("k", Duration::from_secs(10)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        lock.release(guard).await.unwrap();
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn stale_guard_does_not_release_new_holder() {
        let lock = lock(200);
        let stale = lock.acquire("k", Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _fresh = lock.acquire("k", Duration::from_secs(10)).await.unwrap();
        lock.release(stale).await.unwrap();
        let err = lock.acquire("k", Duration::from_secs(10)).await;
        assert!(matches!(err, Err(LockError::Timeout { .. })));
    }

    #[tokio::test]
    async fn only_unreachable_store_reports_unavailable() {
        let down = StoreLock::new(Arc::new(FailingStore::unreachable()));
        let err = down.acquire("k", Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, LockError::Unavailable(_)));

        let wrong_type = StoreLock::new(Arc::new(FailingStore::rejecting("WRONGTYPE")));
        let err = wrong_type.acquire("k", Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, LockError::Backend(ref m) if m.contains("WRONGTYPE")));
    }
}
