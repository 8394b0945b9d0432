//! Per-(chain, address) nonce allocation.
//!
//! Every mutation of a record happens while holding both an in-process
//! per-key mutex and the distributed lock for that key, so concurrent
//! allocations for one account return a contiguous, strictly increasing
//! sequence. Records live in the shared store and are mirrored locally so a
//! store outage degrades the tracker instead of failing it.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chaingate_core::{
    ComponentHealth, DistributedLock, GatewayError, HealthCheck, LockError, LockGuard, SharedStore,
};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{broadcast, OwnedMutexGuard};

use crate::reader::ChainReader;
use crate::types::NonceRecord;

#[derive(Debug, Clone)]
pub struct NonceConfig {
    /// Lease on the distributed lock for one operation.
    pub lock_ttl: Duration,
    /// Prefix for record and lock keys in the shared store.
    pub key_prefix: String,
}

impl Default for NonceConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(5),
            key_prefix: "nonce".into(),
        }
    }
}

/// Events published by the tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NonceEvent {
    #[serde(rename = "nonceReset")]
    Reset { chain_id: u64, address: String, nonce: u64 },
    #[serde(rename = "nonceConfirmed")]
    Confirmed { chain_id: u64, address: String, nonce: u64 },
    #[serde(rename = "nonceSynced")]
    Synced {
        chain_id: u64,
        address: String,
        old: u64,
        new: u64,
    },
    #[serde(rename = "nonceGapDetected")]
    GapDetected {
        chain_id: u64,
        address: String,
        from: u64,
        to: u64,
    },
}

type KeyLocks = Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>;

/// Holds one in-process key mutex. Dropping it forgets the key once no other
/// caller holds or waits on it.
struct LocalKey {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: KeyLocks,
}

impl Drop for LocalKey {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.get(&self.key).is_some_and(|m| Arc::strong_count(m) == 1) {
            locks.remove(&self.key);
        }
    }
}

/// Locks held for the duration of one record mutation.
struct HeldKey {
    _local: LocalKey,
    remote: Option<LockGuard>,
}

pub struct NonceTracker {
    config: NonceConfig,
    lock: Arc<dyn DistributedLock>,
    store: Arc<dyn SharedStore>,
    reader: Arc<dyn ChainReader>,
    key_locks: KeyLocks,
    mirror: Mutex<HashMap<String, NonceRecord>>,
    store_degraded: AtomicBool,
    events: broadcast::Sender<NonceEvent>,
}

/// Validate and lower-case an account address.
pub fn normalize_address(address: &str) -> Result<String, GatewayError> {
    let valid = address.len() == 42
        && address.starts_with("0x")
        && address[2..].chars().all(|c| c.is_ascii_hexdigit());
    if !valid {
        return Err(GatewayError::Validation(format!("invalid address: {address}")));
    }
    Ok(address.to_ascii_lowercase())
}

impl NonceTracker {
    pub fn new(
        config: NonceConfig,
        lock: Arc<dyn DistributedLock>,
        store: Arc<dyn SharedStore>,
        reader: Arc<dyn ChainReader>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            lock,
            store,
            reader,
            key_locks: Arc::new(Mutex::new(HashMap::new())),
            mirror: Mutex::new(HashMap::new()),
            store_degraded: AtomicBool::new(false),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NonceEvent> {
        self.events.subscribe()
    }

    fn record_key(&self, chain_id: u64, address: &str) -> String {
        format!("{}:{chain_id}:{address}", self.config.key_prefix)
    }

    fn lock_key(&self, chain_id: u64, address: &str) -> String {
        format!("{}:lock:{chain_id}:{address}", self.config.key_prefix)
    }

    fn emit(&self, event: NonceEvent) {
        tracing::debug!(?event, "nonce event");
        let _ = self.events.send(event);
    }

    fn nonce_error(chain_id: u64, address: &str, e: GatewayError) -> GatewayError {
        match e {
            GatewayError::UnsupportedChain { .. } | GatewayError::Validation(_) => e,
            other => GatewayError::Nonce {
                chain_id,
                address: address.to_string(),
                cause: other.to_string(),
            },
        }
    }

    async fn on_chain(&self, chain_id: u64, address: &str) -> Result<u64, GatewayError> {
        self.reader
            .transaction_count(chain_id, address)
            .await
            .map_err(|e| Self::nonce_error(chain_id, address, e))
    }

    async fn lock_local(&self, key: String) -> LocalKey {
        let mutex = {
            let mut locks = self.key_locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        let mut local = LocalKey {
            key,
            guard: None,
            locks: Arc::clone(&self.key_locks),
        };
        local.guard = Some(mutex.lock_owned().await);
        local
    }

    /// Number of keys with an in-process mutex currently held or awaited.
    pub fn active_keys(&self) -> usize {
        self.key_locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    async fn acquire(&self, chain_id: u64, address: &str) -> Result<HeldKey, GatewayError> {
        let local = self.lock_local(self.record_key(chain_id, address)).await;

        let lock_key = self.lock_key(chain_id, address);
        let remote = match self.lock.acquire(&lock_key, self.config.lock_ttl).await {
            Ok(guard) => Some(guard),
            Err(LockError::Unavailable(e)) => {
                tracing::warn!(chain_id, address, error = %e, "lock backend unreachable, allocating without distributed lock");
                None
            }
            Err(e) => return Err(GatewayError::Lock(e)),
        };
        Ok(HeldKey { _local: local, remote })
    }

    async fn release(&self, held: HeldKey) {
        if let Some(guard) = held.remote {
            if let Err(e) = self.lock.release(guard).await {
                tracing::warn!(error = %e, "failed to release nonce lock");
            }
        }
    }

    async fn load(&self, key: &str) -> Option<NonceRecord> {
        let mirrored = self
            .mirror
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied();
        match self.store.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str::<NonceRecord>(&raw) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!(key, error = %e, "discarding undecodable nonce record");
                    mirrored
                }
            },
            Ok(None) => mirrored,
            Err(e) => {
                self.store_degraded.store(true, Ordering::Relaxed);
                tracing::warn!(key, error = %e, "nonce store read failed, using local mirror");
                mirrored
            }
        }
    }

    async fn save(&self, key: &str, record: NonceRecord) {
        self.mirror
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), record);
        let encoded = match serde_json::to_string(&record) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(key, error = %e, "failed to encode nonce record");
                return;
            }
        };
        match self.store.set(key, &encoded, None).await {
            Ok(()) => self.store_degraded.store(false, Ordering::Relaxed),
            Err(e) => {
                self.store_degraded.store(true, Ordering::Relaxed);
                tracing::warn!(key, error = %e, "nonce store write failed, kept in local mirror");
            }
        }
    }

    /// Current cached record, if any.
    pub async fn record(&self, chain_id: u64, address: &str) -> Result<Option<NonceRecord>, GatewayError> {
        let address = normalize_address(address)?;
        Ok(self.load(&self.record_key(chain_id, &address)).await)
    }

    /// Allocate the next nonce for `address`.
    pub async fn get_nonce(&self, chain_id: u64, address: &str) -> Result<u64, GatewayError> {
        let address = normalize_address(address)?;
        let key = self.record_key(chain_id, &address);
        let held = self.acquire(chain_id, &address).await?;
        let result = async {
            let record = match self.load(&key).await {
                Some(record) => record,
                None => NonceRecord::seeded(self.on_chain(chain_id, &address).await?),
            };
            let nonce = record.confirmed.max(record.pending);
            self.save(
                &key,
                NonceRecord {
                    confirmed: record.confirmed,
                    pending: nonce + 1,
                    updated_at: Utc::now(),
                },
            )
            .await;
            Ok::<_, GatewayError>(nonce)
        }
        .await;
        self.release(held).await;
        if let Ok(nonce) = &result {
            tracing::debug!(chain_id, address = %address, nonce = *nonce, "nonce allocated");
        }
        result
    }

    /// Reserve one more nonce and return the new pending value.
    pub async fn increment_nonce(&self, chain_id: u64, address: &str) -> Result<u64, GatewayError> {
        let address = normalize_address(address)?;
        let key = self.record_key(chain_id, &address);
        let held = self.acquire(chain_id, &address).await?;
        let result = async {
            let mut record = match self.load(&key).await {
                Some(record) => record,
                None => NonceRecord::seeded(self.on_chain(chain_id, &address).await?),
            };
            record.pending += 1;
            record.updated_at = Utc::now();
            self.save(&key, record).await;
            Ok::<_, GatewayError>(record.pending)
        }
        .await;
        self.release(held).await;
        result
    }

    /// Overwrite the record with the on-chain count.
    pub async fn reset_nonce(&self, chain_id: u64, address: &str) -> Result<u64, GatewayError> {
        let address = normalize_address(address)?;
        let key = self.record_key(chain_id, &address);
        let held = self.acquire(chain_id, &address).await?;
        let result = async {
            let on_chain = self.on_chain(chain_id, &address).await?;
            self.save(&key, NonceRecord::seeded(on_chain)).await;
            Ok::<_, GatewayError>(on_chain)
        }
        .await;
        self.release(held).await;
        let nonce = result?;
        tracing::info!(chain_id, address = %address, nonce, "nonce reset from chain");
        self.emit(NonceEvent::Reset {
            chain_id,
            address,
            nonce,
        });
        Ok(nonce)
    }

    /// Record that the transaction with `nonce` was included.
    ///
    /// Only raises the floor, so the distributed lock is not taken; the
    /// in-process key mutex still orders it against local allocations.
    pub async fn confirm_nonce(&self, chain_id: u64, address: &str, nonce: u64) -> Result<(), GatewayError> {
        let address = normalize_address(address)?;
        let key = self.record_key(chain_id, &address);
        let _local = self.lock_local(key.clone()).await;

        let floor = nonce + 1;
        let mut record = self.load(&key).await.unwrap_or_else(|| NonceRecord::seeded(floor));
        record.confirmed = record.confirmed.max(floor);
        record.pending = record.pending.max(record.confirmed);
        record.updated_at = Utc::now();
        self.save(&key, record).await;
        self.emit(NonceEvent::Confirmed {
            chain_id,
            address,
            nonce,
        });
        Ok(())
    }

    /// Pull the record up to the on-chain count if the chain is ahead.
    /// Returns the pending value afterwards.
    pub async fn sync_nonce(&self, chain_id: u64, address: &str) -> Result<u64, GatewayError> {
        let address = normalize_address(address)?;
        let key = self.record_key(chain_id, &address);
        let held = self.acquire(chain_id, &address).await?;
        let result = async {
            let on_chain = self.on_chain(chain_id, &address).await?;
            let Some(mut record) = self.load(&key).await else {
                self.save(&key, NonceRecord::seeded(on_chain)).await;
                return Ok::<_, GatewayError>((on_chain, None));
            };
            if on_chain <= record.pending {
                return Ok((record.pending, None));
            }
            let old = record.pending;
            record.confirmed = record.confirmed.max(on_chain);
            record.pending = on_chain;
            record.updated_at = Utc::now();
            self.save(&key, record).await;
            Ok((on_chain, Some(old)))
        }
        .await;
        self.release(held).await;

        let (pending, synced_from) = result?;
        if let Some(old) = synced_from {
            tracing::info!(chain_id, address = %address, old, new = pending, "nonce synced to chain");
            self.emit(NonceEvent::Synced {
                chain_id,
                address,
                old,
                new: pending,
            });
        }
        Ok(pending)
    }

    /// Nonces handed out but not yet seen on-chain, as `on_chain..pending`.
    pub async fn detect_gap(&self, chain_id: u64, address: &str) -> Result<Range<u64>, GatewayError> {
        let address = normalize_address(address)?;
        let on_chain = self.on_chain(chain_id, &address).await?;
        let pending = self
            .load(&self.record_key(chain_id, &address))
            .await
            .map(|r| r.pending)
            .unwrap_or(on_chain);
        if pending <= on_chain {
            return Ok(on_chain..on_chain);
        }
        tracing::warn!(chain_id, address = %address, from = on_chain, to = pending, "nonce gap detected");
        self.emit(NonceEvent::GapDetected {
            chain_id,
            address,
            from: on_chain,
            to: pending,
        });
        Ok(on_chain..pending)
    }
}

#[async_trait]
impl HealthCheck for NonceTracker {
    async fn check(&self) -> Result<ComponentHealth, GatewayError> {
        let tracked = self.mirror.lock().unwrap_or_else(PoisonError::into_inner).len();
        let details = serde_json::json!({ "tracked": tracked, "backend": self.store.backend() });
        if self.store_degraded.load(Ordering::Relaxed) {
            return Ok(ComponentHealth::degraded("nonce store unreachable, using local mirror").with_details(details));
        }
        Ok(ComponentHealth::healthy().with_details(details))
    }
}
