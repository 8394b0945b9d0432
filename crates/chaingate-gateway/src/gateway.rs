//! The gateway: composition root and caller-facing operations.
//!
//! Startup order: shared store and endpoint source, provider pool (load +
//! health probes), gas oracle, reorg watcher, rate limiter sweep, health
//! aggregator. Shutdown closes WebSocket connections first, then stops the
//! background loops in exactly the reverse order.

use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chaingate_chain::{
    GasEstimate, GasPriceOracle, NonceTracker, PoolChainReader, ReorgWatcher,
};
use chaingate_core::{
    ChainSpec, DistributedLock, Endpoint, EndpointSource, GatewayError, HealthAggregator, HealthCheck,
    HealthReport, JsonRpcResponse, MemoryEndpointSource, MemoryStore, NoopLock, ProviderPool, RateLimitInfo,
    RateLimiter, RpcId, SharedStore, StoreHealth, StoreLock, TaskHandle, TransportFactory,
};
use chaingate_http::HttpTransportFactory;
use chaingate_ws::{SubscriptionConfig, SubscriptionHub, SubscriptionRecord};
use serde_json::{json, Value};

use crate::config::{GatewayConfig, LockBackend, StoreBackend};

/// Caller key used when a request carries no caller id.
pub const ANONYMOUS_CALLER: &str = "anonymous";

/// Connect the store named in `config`.
pub async fn connect_store(config: &GatewayConfig) -> Result<Arc<dyn SharedStore>, GatewayError> {
    match config.store.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        #[cfg(feature = "redis")]
        StoreBackend::Redis => {
            let url = config
                .store
                .url
                .as_deref()
                .ok_or_else(|| GatewayError::Config("redis store requires a url".into()))?;
            let store = chaingate_core::store::RedisStore::connect(url).await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis"))]
        StoreBackend::Redis => Err(GatewayError::Config(
            "redis store configured but chaingate was built without the `redis` feature".into(),
        )),
    }
}

// ─── Builder ──────────────────────────────────────────────────────────────────

/// Assembles a [`Gateway`]. Anything not supplied is built from the config.
pub struct GatewayBuilder {
    config: GatewayConfig,
    store: Option<Arc<dyn SharedStore>>,
    factory: Option<Arc<dyn TransportFactory>>,
    source: Option<(Arc<dyn EndpointSource>, Arc<dyn HealthCheck>)>,
}

impl GatewayBuilder {
    pub fn store(mut self, store: Arc<dyn SharedStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Use an external configuration collaborator instead of the endpoints
    /// listed in the config file.
    pub fn endpoint_source<S>(mut self, source: Arc<S>) -> Self
    where
        S: EndpointSource + HealthCheck,
    {
        let health: Arc<dyn HealthCheck> = source.clone();
        self.source = Some((source, health));
        self
    }

    pub async fn build(self) -> Result<Gateway, GatewayError> {
        let config = self.config;
        config.validate()?;

        let store = match self.store {
            Some(store) => store,
            None => connect_store(&config).await?,
        };
        let factory = self
            .factory
            .unwrap_or_else(|| Arc::new(HttpTransportFactory::default()));
        let (source, source_health) = match self.source {
            Some(pair) => pair,
            None => {
                let source = Arc::new(MemoryEndpointSource::new(config.endpoints.clone()));
                let health: Arc<dyn HealthCheck> = source.clone();
                (source as Arc<dyn EndpointSource>, health)
            }
        };

        let chains = config.chain_specs();
        let pool = Arc::new(ProviderPool::new(config.pool.to_pool_config(), factory));
        for spec in &chains {
            pool.register_chain(spec.clone());
        }

        let reader = Arc::new(PoolChainReader::new(Arc::clone(&pool)));
        let lock: Arc<dyn DistributedLock> = match config.nonce.lock {
            LockBackend::Store => Arc::new(
                StoreLock::new(Arc::clone(&store)).with_acquire_timeout(config.nonce.acquire_timeout()),
            ),
            LockBackend::None => Arc::new(NoopLock),
        };
        let nonce = Arc::new(NonceTracker::new(
            config.nonce.to_nonce_config(),
            lock,
            Arc::clone(&store),
            reader.clone(),
        ));
        let gas = Arc::new(GasPriceOracle::new(
            config.gas.to_gas_config(),
            chains.clone(),
            reader.clone(),
            Arc::clone(&store),
        ));
        let reorg = Arc::new(ReorgWatcher::new(
            config.reorg.to_reorg_config(),
            reader,
            Arc::clone(&store),
        ));
        let rate_limiter = Arc::new(RateLimiter::new(
            config.rate_limit.to_rate_limit_config(),
            Arc::clone(&store),
        ));
        let hub = SubscriptionHub::new(Arc::clone(&pool), config.subscriptions.to_hub_config());

        let health = Arc::new(HealthAggregator::new(config.health.to_health_config()));
        health.register("provider_pool", pool.clone());
        health.register("nonce_tracker", nonce.clone());
        health.register("reorg_watcher", reorg.clone());
        health.register("gas_oracle", gas.clone());
        health.register("rate_limiter", rate_limiter.clone());
        health.register("subscription_hub", hub.clone());
        health.register("store", Arc::new(StoreHealth(Arc::clone(&store))));
        health.register("endpoint_source", source_health);

        Ok(Gateway {
            config,
            chains,
            store,
            source,
            pool,
            nonce,
            gas,
            reorg,
            rate_limiter,
            hub,
            health,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        })
    }
}

// ─── Gateway ──────────────────────────────────────────────────────────────────

pub struct Gateway {
    config: GatewayConfig,
    chains: Vec<ChainSpec>,
    store: Arc<dyn SharedStore>,
    source: Arc<dyn EndpointSource>,
    pool: Arc<ProviderPool>,
    nonce: Arc<NonceTracker>,
    gas: Arc<GasPriceOracle>,
    reorg: Arc<ReorgWatcher>,
    rate_limiter: Arc<RateLimiter>,
    hub: Arc<SubscriptionHub>,
    health: Arc<HealthAggregator>,
    /// Background loops in start order.
    tasks: Mutex<Vec<TaskHandle>>,
    started: AtomicBool,
    /// Shutdown closes the subscription hub for good.
    stopped: AtomicBool,
    next_id: AtomicU64,
}

impl Gateway {
    pub fn builder(config: GatewayConfig) -> GatewayBuilder {
        GatewayBuilder {
            config,
            store: None,
            factory: None,
            source: None,
        }
    }

    /// Build with HTTP transports and the store named in `config`.
    pub async fn connect(config: GatewayConfig) -> Result<Self, GatewayError> {
        Self::builder(config).build().await
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn chains(&self) -> &[ChainSpec] {
        &self.chains
    }

    pub fn pool(&self) -> &Arc<ProviderPool> {
        &self.pool
    }

    pub fn nonce_tracker(&self) -> &Arc<NonceTracker> {
        &self.nonce
    }

    pub fn gas_oracle(&self) -> &Arc<GasPriceOracle> {
        &self.gas
    }

    pub fn reorg_watcher(&self) -> &Arc<ReorgWatcher> {
        &self.reorg
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn subscription_hub(&self) -> &Arc<SubscriptionHub> {
        &self.hub
    }

    pub fn health(&self) -> &Arc<HealthAggregator> {
        &self.health
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn push_task(&self, handle: TaskHandle) {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner).push(handle);
    }

    /// Load endpoints and start every background loop.
    pub async fn start(&self) -> Result<(), GatewayError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(GatewayError::Config("gateway was shut down and cannot be restarted".into()));
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Err(e) = self.store.ping().await {
            tracing::warn!(backend = self.store.backend(), error = %e, "shared store unreachable at startup, continuing degraded");
        }

        let loaded = match self.pool.initialize(self.source.as_ref()).await {
            Ok(n) => n,
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        self.push_task(self.pool.start_probes());
        self.push_task(self.gas.start());
        self.push_task(self.reorg.start(self.chains.clone()));
        self.push_task(self.rate_limiter.start());
        self.push_task(self.health.start());

        tracing::info!(
            chains = self.chains.len(),
            endpoints = loaded,
            store = self.store.backend(),
            "gateway started"
        );
        Ok(())
    }

    /// Close WebSocket connections, then stop background loops in reverse
    /// start order. In-flight calls finish.
    pub async fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.hub.shutdown();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in tasks.into_iter().rev() {
            handle.shutdown().await;
        }
        self.started.store(false, Ordering::SeqCst);
        tracing::info!("gateway stopped");
    }

    fn ensure_chain(&self, chain_id: u64) -> Result<(), GatewayError> {
        if self.pool.is_supported(chain_id) {
            Ok(())
        } else {
            Err(GatewayError::UnsupportedChain { chain_id })
        }
    }

    /// Forward a JSON-RPC call. Never fails: every error becomes an error
    /// envelope, and errors returned by the node pass through unchanged.
    pub async fn execute_rpc(
        &self,
        chain_id: u64,
        method: &str,
        params: Vec<Value>,
        caller_id: Option<&str>,
    ) -> JsonRpcResponse {
        let id = RpcId::number(self.next_id.fetch_add(1, Ordering::Relaxed));
        match self.forward(chain_id, method, params, caller_id).await {
            Ok(mut resp) => {
                resp.id = id;
                resp
            }
            Err(e) => {
                let data = match &e {
                    GatewayError::RateLimitExceeded { retry_after_seconds } => {
                        Some(json!({ "retryAfterSeconds": retry_after_seconds }))
                    }
                    _ => None,
                };
                tracing::debug!(chain_id, method, error = %e, "rpc call rejected");
                JsonRpcResponse::failure(id, e.rpc_code(), e.to_string(), data)
            }
        }
    }

    async fn forward(
        &self,
        chain_id: u64,
        method: &str,
        params: Vec<Value>,
        caller_id: Option<&str>,
    ) -> Result<JsonRpcResponse, GatewayError> {
        self.check_rate_limit(caller_id).await?;
        if method.trim().is_empty() {
            return Err(GatewayError::Validation("method must not be empty".into()));
        }
        self.ensure_chain(chain_id)?;
        self.pool.execute_request(chain_id, method, params).await
    }

    pub async fn get_gas_price(&self, chain_id: u64) -> Result<GasEstimate, GatewayError> {
        self.ensure_chain(chain_id)?;
        self.gas.get_gas_price(chain_id).await
    }

    pub async fn get_nonce(&self, chain_id: u64, address: &str) -> Result<u64, GatewayError> {
        self.ensure_chain(chain_id)?;
        self.nonce.get_nonce(chain_id, address).await
    }

    pub async fn increment_nonce(&self, chain_id: u64, address: &str) -> Result<u64, GatewayError> {
        self.ensure_chain(chain_id)?;
        self.nonce.increment_nonce(chain_id, address).await
    }

    pub async fn reset_nonce(&self, chain_id: u64, address: &str) -> Result<u64, GatewayError> {
        self.ensure_chain(chain_id)?;
        self.nonce.reset_nonce(chain_id, address).await
    }

    pub async fn sync_nonce(&self, chain_id: u64, address: &str) -> Result<u64, GatewayError> {
        self.ensure_chain(chain_id)?;
        self.nonce.sync_nonce(chain_id, address).await
    }

    pub async fn confirm_nonce(&self, chain_id: u64, address: &str, nonce: u64) -> Result<(), GatewayError> {
        self.ensure_chain(chain_id)?;
        self.nonce.confirm_nonce(chain_id, address, nonce).await
    }

    pub async fn detect_nonce_gap(&self, chain_id: u64, address: &str) -> Result<Range<u64>, GatewayError> {
        self.ensure_chain(chain_id)?;
        self.nonce.detect_gap(chain_id, address).await
    }

    pub async fn subscribe(&self, config: SubscriptionConfig) -> Result<SubscriptionRecord, GatewayError> {
        self.ensure_chain(config.chain_id)?;
        self.hub.subscribe(config).await
    }

    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<bool, GatewayError> {
        self.hub.unsubscribe(subscription_id).await
    }

    /// Count one request against `caller_id`'s window.
    pub async fn check_rate_limit(&self, caller_id: Option<&str>) -> Result<RateLimitInfo, GatewayError> {
        let caller = caller_id.filter(|c| !c.is_empty()).unwrap_or(ANONYMOUS_CALLER);
        self.rate_limiter.consume(caller, 1).await
    }

    /// Run every health check now.
    pub async fn get_health(&self) -> HealthReport {
        self.health.check_all().await
    }

    /// Register a provider with the endpoint source and the pool.
    pub async fn add_provider(&self, endpoint: Endpoint) -> Result<bool, GatewayError> {
        self.ensure_chain(endpoint.chain_id)?;
        if endpoint.resolved_http_url().is_none() {
            return Err(GatewayError::Validation(format!(
                "endpoint '{}' has no HTTP URL",
                endpoint.id
            )));
        }
        self.source.add_provider(endpoint.clone()).await?;
        self.pool.add_endpoint(endpoint)
    }

    /// Remove a provider everywhere. Returns `true` if either side knew it.
    pub async fn remove_provider(&self, endpoint_id: &str) -> Result<bool, GatewayError> {
        let from_source = self.source.remove_provider(endpoint_id).await?.is_some();
        let from_pool = self.pool.remove_endpoint(endpoint_id);
        Ok(from_source || from_pool)
    }
}
