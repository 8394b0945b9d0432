//! Reorg watcher: a per-chain block-hash cache and divergence detector.
//!
//! Each poll walks every height from the last processed block up to the
//! current head. A block whose parent hash disagrees with the cached hash one
//! height below marks a reorg; the depth is found by comparing older cached
//! hashes against freshly fetched ones until they agree.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chaingate_core::{ChainSpec, ComponentHealth, GatewayError, HealthCheck, SharedStore, TaskHandle};
use chaingate_core::task::sleep_or_stop;
use chrono::Utc;
use tokio::sync::broadcast;

use crate::reader::ChainReader;
use crate::types::{BlockRef, ReorgEvent};

const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ReorgConfig {
    /// Cached blocks per chain.
    pub cache_size: usize,
    /// Deepest reorg the depth walk will measure.
    pub max_depth: u64,
    /// Reorg events kept per chain.
    pub history_size: usize,
    /// Poll interval. `None` uses half the chain's block time.
    pub poll_interval: Option<Duration>,
    pub key_prefix: String,
}

impl Default for ReorgConfig {
    fn default() -> Self {
        Self {
            cache_size: 256,
            max_depth: 64,
            history_size: 100,
            poll_interval: None,
            key_prefix: "reorg".into(),
        }
    }
}

// ─── BlockCache ───────────────────────────────────────────────────────────────

/// Bounded map of recent blocks for one chain, keyed by height.
#[derive(Debug)]
pub struct BlockCache {
    blocks: BTreeMap<u64, BlockRef>,
    capacity: usize,
}

impl BlockCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            blocks: BTreeMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Insert a block, evicting the oldest heights past capacity.
    pub fn insert(&mut self, block: BlockRef) {
        self.blocks.insert(block.number, block);
        while self.blocks.len() > self.capacity {
            self.blocks.pop_first();
        }
    }

    pub fn get(&self, number: u64) -> Option<&BlockRef> {
        self.blocks.get(&number)
    }

    /// Drop the `count` highest cached blocks.
    pub fn evict_recent(&mut self, count: u64) {
        for _ in 0..count {
            if self.blocks.pop_last().is_none() {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn heights(&self) -> Vec<u64> {
        self.blocks.keys().copied().collect()
    }
}

struct ChainState {
    cache: BlockCache,
    last_known: Option<u64>,
}

// ─── ReorgWatcher ─────────────────────────────────────────────────────────────

pub struct ReorgWatcher {
    config: ReorgConfig,
    reader: Arc<dyn ChainReader>,
    store: Arc<dyn SharedStore>,
    /// Per-chain state. The async mutex keeps each chain's walk sequential.
    chains: Mutex<HashMap<u64, Arc<tokio::sync::Mutex<ChainState>>>>,
    history: Mutex<HashMap<u64, VecDeque<ReorgEvent>>>,
    progress: Mutex<HashMap<u64, u64>>,
    failures: Mutex<HashMap<u64, String>>,
    events: broadcast::Sender<ReorgEvent>,
}

impl ReorgWatcher {
    pub fn new(config: ReorgConfig, reader: Arc<dyn ChainReader>, store: Arc<dyn SharedStore>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            reader,
            store,
            chains: Mutex::new(HashMap::new()),
            history: Mutex::new(HashMap::new()),
            progress: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReorgEvent> {
        self.events.subscribe()
    }

    fn chain_state(&self, chain_id: u64) -> Arc<tokio::sync::Mutex<ChainState>> {
        let mut chains = self.chains.lock().unwrap_or_else(PoisonError::into_inner);
        let capacity = self.config.cache_size;
        Arc::clone(chains.entry(chain_id).or_insert_with(|| {
            Arc::new(tokio::sync::Mutex::new(ChainState {
                cache: BlockCache::new(capacity),
                last_known: None,
            }))
        }))
    }

    /// Highest height processed for `chain_id`.
    pub fn last_known(&self, chain_id: u64) -> Option<u64> {
        self.progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&chain_id)
            .copied()
    }

    /// Recorded reorgs for `chain_id`, newest first.
    pub fn history(&self, chain_id: u64) -> Vec<ReorgEvent> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&chain_id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Heights currently cached for `chain_id`.
    pub async fn cached_heights(&self, chain_id: u64) -> Vec<u64> {
        self.chain_state(chain_id).lock().await.cache.heights()
    }

    /// Run one detection pass. Returns the reorgs found.
    pub async fn poll_chain(&self, chain_id: u64) -> Result<Vec<ReorgEvent>, GatewayError> {
        let result = self.walk(chain_id).await;
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        match &result {
            Ok(_) => {
                failures.remove(&chain_id);
            }
            Err(e) => {
                failures.insert(chain_id, e.to_string());
            }
        }
        result
    }

    async fn walk(&self, chain_id: u64) -> Result<Vec<ReorgEvent>, GatewayError> {
        let state = self.chain_state(chain_id);
        let mut state = state.lock().await;
        let head = self.reader.block_number(chain_id).await?;
        let start = match state.last_known {
            Some(known) => known + 1,
            None => head,
        };

        let mut found = Vec::new();
        for height in start..=head {
            let Some(block) = self.reader.block(chain_id, height).await? else {
                tracing::debug!(chain_id, height, "block not yet available, retrying next poll");
                break;
            };

            let cached_parent = height.checked_sub(1).and_then(|h| state.cache.get(h)).cloned();
            if let Some(parent) = cached_parent {
                if !block.extends(&parent) {
                    let depth = self.measure_depth(chain_id, &state.cache, height).await?;
                    let event = ReorgEvent {
                        chain_id,
                        old_block_number: height - 1,
                        old_block_hash: parent.hash,
                        new_block_number: height,
                        new_block_hash: block.hash.clone(),
                        depth,
                        detected_at: Utc::now(),
                    };
                    tracing::warn!(chain_id, height, depth, "reorg detected");
                    state.cache.evict_recent(depth);
                    found.push(event);
                }
            }

            state.cache.insert(block);
            state.last_known = Some(height);
            self.progress
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(chain_id, height);
        }
        drop(state);

        for event in &found {
            self.record(event).await;
        }
        Ok(found)
    }

    /// Depth of a reorg first seen at `height`: 1 for the mismatched parent
    /// plus every older cached block whose hash is no longer canonical.
    async fn measure_depth(&self, chain_id: u64, cache: &BlockCache, height: u64) -> Result<u64, GatewayError> {
        let mut depth = 1;
        let mut check = height.checked_sub(2);
        while let Some(h) = check {
            if depth >= self.config.max_depth {
                break;
            }
            let Some(cached) = cache.get(h) else { break };
            let Some(canonical) = self.reader.block(chain_id, h).await? else { break };
            if canonical.hash == cached.hash {
                break;
            }
            depth += 1;
            check = h.checked_sub(1);
        }
        Ok(depth)
    }

    async fn record(&self, event: &ReorgEvent) {
        {
            let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
            let entries = history.entry(event.chain_id).or_default();
            entries.push_front(event.clone());
            entries.truncate(self.config.history_size);
        }
        let _ = self.events.send(event.clone());

        let encoded = match serde_json::to_string(event) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode reorg event");
                return;
            }
        };
        let prefix = &self.config.key_prefix;
        let history_key = format!("{prefix}:history:{}", event.chain_id);
        if let Err(e) = self
            .store
            .list_push_trim(&history_key, &encoded, self.config.history_size)
            .await
        {
            tracing::warn!(chain_id = event.chain_id, error = %e, "failed to persist reorg event");
        }
        let channel = format!("{prefix}:{}", event.chain_id);
        if let Err(e) = self.store.publish(&channel, &encoded).await {
            tracing::warn!(chain_id = event.chain_id, error = %e, "failed to publish reorg event");
        }
    }

    fn poll_interval(&self, spec: &ChainSpec) -> Duration {
        self.config
            .poll_interval
            .unwrap_or_else(|| spec.block_time() / 2)
            .max(MIN_POLL_INTERVAL)
    }

    /// Start one poll loop per chain.
    pub fn start(self: &Arc<Self>, chains: Vec<ChainSpec>) -> TaskHandle {
        let mut handle = TaskHandle::new("reorg_watcher");
        for spec in chains {
            let interval = self.poll_interval(&spec);
            let chain_id = spec.chain_id;
            let mut stop = handle.signal();
            let this = Arc::clone(self);
            handle.push(tokio::spawn(async move {
                tracing::debug!(chain_id, interval_ms = interval.as_millis() as u64, "reorg watcher started");
                loop {
                    if let Err(e) = this.poll_chain(chain_id).await {
                        tracing::warn!(chain_id, error = %e, "reorg poll failed");
                    }
                    if !sleep_or_stop(&mut stop, interval).await {
                        break;
                    }
                }
            }));
        }
        handle
    }
}

#[async_trait]
impl HealthCheck for ReorgWatcher {
    async fn check(&self) -> Result<ComponentHealth, GatewayError> {
        let failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let progress = self.progress.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let details = serde_json::json!({
            "last_known": progress,
            "failing": failures,
        });
        if failures.is_empty() {
            return Ok(ComponentHealth::healthy().with_details(details));
        }
        Ok(ComponentHealth::degraded(format!("{} chain(s) failing to poll", failures.len())).with_details(details))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::mock::MockChainReader;
    use chaingate_core::{HealthStatus, MemoryStore};

    fn watcher(reader: Arc<MockChainReader>, store: Arc<MemoryStore>) -> ReorgWatcher {
        ReorgWatcher::new(ReorgConfig::default(), reader, store)
    }

    /// Canonical chain `0xa{n}` from `from` to `to`.
    fn chain_a(reader: &MockChainReader, from: u64, to: u64) {
        for n in from..=to {
            reader.put_block(n, &format!("0xa{n}"), &format!("0xa{}", n - 1));
        }
    }

    #[test]
    fn cache_evicts_oldest_and_recent() {
        let mut cache = BlockCache::new(3);
        for n in 1..=5 {
            cache.insert(BlockRef {
                chain_id: 1,
                number: n,
                hash: format!("0x{n}"),
                parent_hash: String::new(),
                timestamp: 0,
                transactions: vec![],
            });
        }
        assert_eq!(cache.heights(), vec![3, 4, 5]);
        cache.evict_recent(2);
        assert_eq!(cache.heights(), vec![3]);
        cache.evict_recent(5);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn first_poll_starts_at_head() {
        let reader = Arc::new(MockChainReader::default());
        chain_a(&reader, 1, 10);
        let w = watcher(reader, Arc::new(MemoryStore::new()));
        assert!(w.poll_chain(1).await.unwrap().is_empty());
        assert_eq!(w.last_known(1), Some(10));
        assert_eq!(w.cached_heights(1).await, vec![10]);
    }

    #[tokio::test]
    async fn backfills_every_height() {
        let reader = Arc::new(MockChainReader::default());
        chain_a(&reader, 1, 3);
        let w = watcher(reader.clone(), Arc::new(MemoryStore::new()));
        w.poll_chain(1).await.unwrap();
        chain_a(&reader, 4, 7);
        assert!(w.poll_chain(1).await.unwrap().is_empty());
        assert_eq!(w.cached_heights(1).await, vec![3, 4, 5, 6, 7]);
        assert_eq!(w.last_known(1), Some(7));
    }

    #[tokio::test]
    async fn detects_single_reorg_and_evicts_invalidated_blocks() {
        let reader = Arc::new(MockChainReader::default());
        let store = Arc::new(MemoryStore::new());
        let mut published = store.subscribe();
        chain_a(&reader, 1, 3);
        let w = watcher(reader.clone(), store.clone());
        let mut events = w.subscribe();
        w.poll_chain(1).await.unwrap();
        chain_a(&reader, 4, 5);
        w.poll_chain(1).await.unwrap();

        // Blocks 4 and 5 are replaced by a fork off block 3.
        reader.put_block(4, "0xb4", "0xa3");
        reader.put_block(5, "0xb5", "0xb4");
        reader.put_block(6, "0xb6", "0xb5");

        let found = w.poll_chain(1).await.unwrap();
        assert_eq!(found.len(), 1);
        let event = &found[0];
        assert_eq!(event.depth, 2);
        assert_eq!(event.old_block_number, 5);
        assert_eq!(event.old_block_hash, "0xa5");
        assert_eq!(event.new_block_number, 6);
        assert_eq!(event.new_block_hash, "0xb6");
        assert_eq!(w.cached_heights(1).await, vec![3, 6]);

        assert_eq!(events.recv().await.unwrap().depth, 2);
        assert_eq!(w.history(1).len(), 1);
        let stored = store.list_range("reorg:history:1", 10).await.unwrap();
        assert_eq!(stored.len(), 1);
        let msg = published.recv().await.unwrap();
        assert_eq!(msg.channel, "reorg:1");

        // Following blocks extend the new branch quietly.
        reader.put_block(7, "0xb7", "0xb6");
        assert!(w.poll_chain(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn depth_is_capped() {
        let reader = Arc::new(MockChainReader::default());
        chain_a(&reader, 1, 1);
        let w = ReorgWatcher::new(
            ReorgConfig {
                max_depth: 2,
                ..ReorgConfig::default()
            },
            reader.clone(),
            Arc::new(MemoryStore::new()),
        );
        w.poll_chain(1).await.unwrap();
        chain_a(&reader, 2, 6);
        w.poll_chain(1).await.unwrap();
        for n in 2..=7 {
            reader.put_block(n, &format!("0xc{n}"), &format!("0xc{}", n - 1));
        }
        let found = w.poll_chain(1).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].depth, 2);
    }

    #[tokio::test]
    async fn failed_poll_degrades_health_and_keeps_progress() {
        let reader = Arc::new(MockChainReader::default());
        chain_a(&reader, 1, 2);
        let w = watcher(reader.clone(), Arc::new(MemoryStore::new()));
        w.poll_chain(1).await.unwrap();
        reader.set_failing(true);
        assert!(w.poll_chain(1).await.is_err());
        assert_eq!(w.check().await.unwrap().status, HealthStatus::Degraded);
        assert_eq!(w.last_known(1), Some(2));

        reader.set_failing(false);
        chain_a(&reader, 3, 3);
        w.poll_chain(1).await.unwrap();
        assert_eq!(w.last_known(1), Some(3));
        assert_eq!(w.check().await.unwrap().status, HealthStatus::Healthy);
    }
}
