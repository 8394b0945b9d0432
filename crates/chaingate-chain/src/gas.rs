//! Per-chain gas price estimation with a TTL cache and rolling history.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chaingate_core::task::sleep_or_stop;
use chaingate_core::{
    ChainSpec, ComponentHealth, GatewayError, HealthCheck, SharedStore, TaskHandle, TransportError,
};
use chrono::Utc;
use tokio::sync::broadcast;

use crate::reader::ChainReader;
use crate::types::{FeeData, GasEstimate};

#[derive(Debug, Clone)]
pub struct GasConfig {
    /// How long an estimate is served from cache. Also the refresh period.
    pub cache_ttl: Duration,
    /// Estimates kept per chain for averaging.
    pub history_size: usize,
    pub key_prefix: String,
}

impl Default for GasConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(15),
            history_size: 100,
            key_prefix: "gas".into(),
        }
    }
}

/// `value × tenths / 10` without overflowing.
fn scale_tenths(value: u128, tenths: u128) -> u128 {
    (value / 10)
        .saturating_mul(tenths)
        .saturating_add(value % 10 * tenths / 10)
}

/// `base + amount` scaled per tier. Fast and instant are kept at least one
/// wei above the tier below them.
fn ladder(base: u128, amount: u128, tenths: [u128; 3]) -> [u128; 4] {
    let [slow, fast, instant] = tenths;
    let standard = base.saturating_add(amount);
    let fast = base
        .saturating_add(scale_tenths(amount, fast))
        .max(standard.saturating_add(1));
    let instant = base
        .saturating_add(scale_tenths(amount, instant))
        .max(fast.saturating_add(1));
    [base.saturating_add(scale_tenths(amount, slow)), standard, fast, instant]
}

/// Build the four tiers from raw fee data.
///
/// Fee-market chains add a scaled priority fee to the base fee
/// (×0.8, ×1.0, ×1.5, ×2.0); legacy chains scale the gas price
/// (×0.9, ×1.0, ×1.2, ×1.5).
pub fn estimate_from(chain_id: u64, fee: FeeData) -> GasEstimate {
    let timestamp = Utc::now();
    match fee {
        FeeData::FeeMarket { base_fee, priority_fee } => {
            let [slow, standard, fast, instant] = ladder(base_fee, priority_fee, [8, 15, 20]);
            GasEstimate {
                chain_id,
                slow,
                standard,
                fast,
                instant,
                base_fee: Some(base_fee),
                max_priority_fee: Some(priority_fee),
                timestamp,
            }
        }
        FeeData::Legacy { gas_price } => {
            let [slow, standard, fast, instant] = ladder(0, gas_price, [9, 12, 15]);
            GasEstimate {
                chain_id,
                slow,
                standard,
                fast,
                instant,
                base_fee: None,
                max_priority_fee: None,
                timestamp,
            }
        }
    }
}

pub struct GasPriceOracle {
    config: GasConfig,
    chains: HashMap<u64, ChainSpec>,
    reader: Arc<dyn ChainReader>,
    store: Arc<dyn SharedStore>,
    latest: Mutex<HashMap<u64, GasEstimate>>,
    history: Mutex<HashMap<u64, VecDeque<GasEstimate>>>,
    failures: Mutex<HashMap<u64, String>>,
    events: broadcast::Sender<GasEstimate>,
}

impl GasPriceOracle {
    pub fn new(
        config: GasConfig,
        chains: Vec<ChainSpec>,
        reader: Arc<dyn ChainReader>,
        store: Arc<dyn SharedStore>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            chains: chains.into_iter().map(|c| (c.chain_id, c)).collect(),
            reader,
            store,
            latest: Mutex::new(HashMap::new()),
            history: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Receives every fresh estimate (`gasPriceUpdated`).
    pub fn subscribe(&self) -> broadcast::Receiver<GasEstimate> {
        self.events.subscribe()
    }

    fn spec(&self, chain_id: u64) -> Result<&ChainSpec, GatewayError> {
        self.chains
            .get(&chain_id)
            .ok_or(GatewayError::UnsupportedChain { chain_id })
    }

    fn cache_key(&self, chain_id: u64) -> String {
        format!("{}:price:{chain_id}", self.config.key_prefix)
    }

    fn history_key(&self, chain_id: u64) -> String {
        format!("{}:history:{chain_id}", self.config.key_prefix)
    }

    fn is_fresh(&self, estimate: &GasEstimate) -> bool {
        let age = Utc::now().signed_duration_since(estimate.timestamp);
        age.to_std().map(|age| age < self.config.cache_ttl).unwrap_or(true)
    }

    fn local_latest(&self, chain_id: u64) -> Option<GasEstimate> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&chain_id)
            .cloned()
    }

    async fn cached(&self, chain_id: u64) -> Option<GasEstimate> {
        match self.store.get(&self.cache_key(chain_id)).await {
            Ok(Some(raw)) => match serde_json::from_str::<GasEstimate>(&raw) {
                Ok(estimate) if self.is_fresh(&estimate) => return Some(estimate),
                Ok(_) => {}
                Err(e) => tracing::warn!(chain_id, error = %e, "discarding undecodable gas cache entry"),
            },
            Ok(None) => {}
            Err(e) => tracing::debug!(chain_id, error = %e, "gas cache read failed"),
        }
        self.local_latest(chain_id).filter(|e| self.is_fresh(e))
    }

    /// Cached estimate, refreshed when older than the TTL. When the refresh
    /// fails the last known estimate is returned stale if there is one.
    pub async fn get_gas_price(&self, chain_id: u64) -> Result<GasEstimate, GatewayError> {
        self.spec(chain_id)?;
        if let Some(estimate) = self.cached(chain_id).await {
            return Ok(estimate);
        }
        match self.refresh_gas_price(chain_id).await {
            Ok(estimate) => Ok(estimate),
            Err(e) => match self.local_latest(chain_id) {
                Some(stale) => {
                    tracing::warn!(chain_id, error = %e, "gas refresh failed, serving stale estimate");
                    Ok(stale)
                }
                None => Err(e),
            },
        }
    }

    /// Fetch fee data and publish a new estimate. On failure the cache is
    /// left untouched.
    pub async fn refresh_gas_price(&self, chain_id: u64) -> Result<GasEstimate, GatewayError> {
        let fee_market = self.spec(chain_id)?.is_fee_market();
        let fee = match self.reader.fee_data(chain_id, fee_market).await {
            Ok(fee) => fee,
            Err(e) => {
                self.failures
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(chain_id, e.to_string());
                return Err(match e {
                    GatewayError::Provider(_) | GatewayError::UnsupportedChain { .. } => e,
                    other => GatewayError::Provider(TransportError::Other(other.to_string())),
                });
            }
        };
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&chain_id);

        let estimate = estimate_from(chain_id, fee);
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(chain_id, estimate.clone());
        {
            let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
            let entries = history.entry(chain_id).or_default();
            entries.push_front(estimate.clone());
            entries.truncate(self.config.history_size);
        }

        match serde_json::to_string(&estimate) {
            Ok(encoded) => {
                if let Err(e) = self
                    .store
                    .set(&self.cache_key(chain_id), &encoded, Some(self.config.cache_ttl))
                    .await
                {
                    tracing::debug!(chain_id, error = %e, "gas cache write failed");
                }
                if let Err(e) = self
                    .store
                    .list_push_trim(&self.history_key(chain_id), &encoded, self.config.history_size)
                    .await
                {
                    tracing::debug!(chain_id, error = %e, "gas history write failed");
                }
            }
            Err(e) => tracing::error!(chain_id, error = %e, "failed to encode gas estimate"),
        }

        tracing::debug!(chain_id, standard = %estimate.standard, "gas price updated");
        let _ = self.events.send(estimate.clone());
        Ok(estimate)
    }

    /// Recent estimates for `chain_id`, newest first.
    pub async fn history(&self, chain_id: u64) -> Vec<GasEstimate> {
        let local: Vec<GasEstimate> = self
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&chain_id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default();
        if !local.is_empty() {
            return local;
        }
        // Another instance may have been doing the refreshing.
        match self.store.list_range(&self.history_key(chain_id), self.config.history_size).await {
            Ok(raw) => raw.iter().filter_map(|s| serde_json::from_str(s).ok()).collect(),
            Err(e) => {
                tracing::debug!(chain_id, error = %e, "gas history read failed");
                Vec::new()
            }
        }
    }

    /// Mean `standard` tier over estimates taken within the last `period`.
    pub async fn get_average_gas_price(&self, chain_id: u64, period: Duration) -> Result<Option<u128>, GatewayError> {
        self.spec(chain_id)?;
        // `None` when the window reaches past the representable range.
        let cutoff = chrono::Duration::from_std(period)
            .ok()
            .and_then(|window| Utc::now().checked_sub_signed(window));
        let recent: Vec<u128> = self
            .history(chain_id)
            .await
            .into_iter()
            .filter(|e| cutoff.map_or(true, |c| e.timestamp >= c))
            .map(|e| e.standard)
            .collect();
        if recent.is_empty() {
            return Ok(None);
        }
        Ok(Some(recent.iter().sum::<u128>() / recent.len() as u128))
    }

    async fn refresh_all(&self) {
        let refreshes = self.chains.keys().map(|&chain_id| async move {
            if let Err(e) = self.refresh_gas_price(chain_id).await {
                tracing::warn!(chain_id, error = %e, "gas refresh failed");
            }
        });
        futures::future::join_all(refreshes).await;
    }

    /// Refresh every chain now, then once per TTL.
    pub fn start(self: &Arc<Self>) -> TaskHandle {
        let mut handle = TaskHandle::new("gas_oracle");
        let mut stop = handle.signal();
        let this = Arc::clone(self);
        let period = self.config.cache_ttl.max(Duration::from_millis(100));
        handle.push(tokio::spawn(async move {
            loop {
                this.refresh_all().await;
                if !sleep_or_stop(&mut stop, period).await {
                    break;
                }
            }
        }));
        handle
    }
}

#[async_trait]
impl HealthCheck for GasPriceOracle {
    async fn check(&self) -> Result<ComponentHealth, GatewayError> {
        let failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let known = self.latest.lock().unwrap_or_else(PoisonError::into_inner).len();
        let details = serde_json::json!({ "chains": self.chains.len(), "estimates": known, "failing": failures });
        if failures.is_empty() {
            Ok(ComponentHealth::healthy().with_details(details))
        } else if known == 0 && failures.len() == self.chains.len() {
            Ok(ComponentHealth::unhealthy("no gas estimates available").with_details(details))
        } else {
            Ok(ComponentHealth::degraded(format!("{} chain(s) failing to refresh", failures.len())).with_details(details))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::mock::MockChainReader;
    use chaingate_core::{HealthStatus, MemoryStore};

    const GWEI: u128 = 1_000_000_000;

    fn oracle(reader: Arc<MockChainReader>, ttl: Duration) -> GasPriceOracle {
        GasPriceOracle::new(
            GasConfig {
                cache_ttl: ttl,
                ..GasConfig::default()
            },
            vec![ChainSpec::known(1), ChainSpec::known(56)],
            reader,
            Arc::new(MemoryStore::new()),
        )
    }

    #[test]
    fn fee_market_tiers() {
        let e = estimate_from(
            1,
            FeeData::FeeMarket {
                base_fee: 30 * GWEI,
                priority_fee: 2 * GWEI,
            },
        );
        assert_eq!(e.standard, 32 * GWEI);
        assert!(e.slow < e.standard && e.standard < e.fast && e.fast < e.instant);
        assert_eq!(e.slow, 30 * GWEI + 1_600_000_000);
        assert_eq!(e.instant, 34 * GWEI);
        assert_eq!(e.base_fee, Some(30 * GWEI));
    }

    #[test]
    fn legacy_tiers() {
        let e = estimate_from(56, FeeData::Legacy { gas_price: 10 * GWEI });
        assert_eq!(e.slow, 9 * GWEI);
        assert_eq!(e.standard, 10 * GWEI);
        assert_eq!(e.fast, 12 * GWEI);
        assert_eq!(e.instant, 15 * GWEI);
        assert!(e.base_fee.is_none());
    }

    #[test]
    fn tiny_fees_keep_tiers_apart() {
        let e = estimate_from(1, FeeData::FeeMarket { base_fee: 7, priority_fee: 1 });
        assert_eq!((e.slow, e.standard, e.fast, e.instant), (7, 8, 9, 10));

        let e = estimate_from(56, FeeData::Legacy { gas_price: 1 });
        assert_eq!((e.slow, e.standard, e.fast, e.instant), (0, 1, 2, 3));
    }

    #[test]
    fn huge_fees_saturate() {
        let e = estimate_from(
            1,
            FeeData::FeeMarket {
                base_fee: u128::MAX - 5,
                priority_fee: u128::MAX / 2,
            },
        );
        assert_eq!(e.standard, u128::MAX);
        assert_eq!(e.instant, u128::MAX);
        assert!(e.slow <= e.standard);

        let e = estimate_from(56, FeeData::Legacy { gas_price: u128::MAX });
        assert_eq!(e.slow, u128::MAX / 10 * 9 + u128::MAX % 10 * 9 / 10);
        assert_eq!(e.fast, u128::MAX);
    }

    #[tokio::test]
    async fn cached_within_ttl() {
        let reader = Arc::new(MockChainReader::default());
        reader.set_fees(FeeData::Legacy { gas_price: 100 });
        let o = oracle(reader.clone(), Duration::from_secs(60));
        let mut updates = o.subscribe();
        assert_eq!(o.get_gas_price(1).await.unwrap().standard, 100);
        assert_eq!(updates.recv().await.unwrap().standard, 100);

        reader.set_fees(FeeData::Legacy { gas_price: 200 });
        assert_eq!(o.get_gas_price(1).await.unwrap().standard, 100);
        assert_eq!(o.refresh_gas_price(1).await.unwrap().standard, 200);
        assert_eq!(o.history(1).await.len(), 2);
    }

    #[tokio::test]
    async fn refresh_failure_leaves_cache_and_serves_stale() {
        let reader = Arc::new(MockChainReader::default());
        reader.set_fees(FeeData::Legacy { gas_price: 100 });
        let o = oracle(reader.clone(), Duration::from_millis(20));
        o.get_gas_price(1).await.unwrap();

        reader.set_failing(true);
        assert!(matches!(o.refresh_gas_price(1).await, Err(GatewayError::Provider(_))));
        tokio::time::sleep(Duration::from_millis(30)).await;
        let stale = o.get_gas_price(1).await.unwrap();
        assert_eq!(stale.standard, 100);
        assert_eq!(o.history(1).await.len(), 1);
        assert_eq!(o.check().await.unwrap().status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn no_data_at_all_is_an_error() {
        let reader = Arc::new(MockChainReader::default());
        reader.set_failing(true);
        let o = oracle(reader, Duration::from_secs(1));
        assert!(o.get_gas_price(1).await.is_err());
        assert!(matches!(
            o.get_gas_price(5).await,
            Err(GatewayError::UnsupportedChain { chain_id: 5 })
        ));
    }

    #[tokio::test]
    async fn average_over_window() {
        let reader = Arc::new(MockChainReader::default());
        let o = oracle(reader.clone(), Duration::from_secs(60));
        assert_eq!(o.get_average_gas_price(1, Duration::from_secs(60)).await.unwrap(), None);
        for price in [100, 200, 300] {
            reader.set_fees(FeeData::Legacy { gas_price: price });
            o.refresh_gas_price(1).await.unwrap();
        }
        assert_eq!(
            o.get_average_gas_price(1, Duration::from_secs(60)).await.unwrap(),
            Some(200)
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(o.get_average_gas_price(1, Duration::from_millis(10)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn background_loop_refreshes_at_start() {
        let reader = Arc::new(MockChainReader::default());
        reader.set_fees(FeeData::Legacy { gas_price: 7 });
        let o = Arc::new(oracle(reader, Duration::from_secs(60)));
        let mut updates = o.subscribe();
        let handle = o.start();
        let first = updates.recv().await.unwrap();
        assert_eq!(first.standard, 7);
        handle.shutdown().await;
    }
}
