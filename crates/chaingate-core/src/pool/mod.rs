//! Per-chain provider pool with priority failover, weighted load balancing,
//! circuit breakers and periodic health probing.

pub mod selection;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::endpoint::{CallOutcome, ChainSpec, Endpoint, EndpointHealth};
use crate::error::{GatewayError, TransportError};
use crate::health::{ComponentHealth, HealthCheck, HealthStatus};
use crate::policy::{CircuitBreaker, CircuitBreakerConfig, CircuitState, RetryConfig, RetryPolicy};
use crate::request::{JsonRpcRequest, JsonRpcResponse, RpcParam};
use crate::source::EndpointSource;
use crate::task::{sleep_or_stop, TaskHandle};
use crate::transport::{RpcTransport, TransportFactory};

pub use selection::{select_for_load_balancing, weighted_index, RandomSource, SequenceRandom, ThreadRandom};

const MIN_PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// Configuration for the provider pool.
#[derive(Debug, Clone)]
pub struct ProviderPoolConfig {
    /// Circuit breaker config applied to every endpoint.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Backoff between retries against the same endpoint. The retry count
    /// comes from each endpoint's `max_retries`.
    pub retry: RetryConfig,
    /// Health probe interval. `None` uses the chain's block time.
    pub probe_interval: Option<Duration>,
    /// When no endpoint is eligible, try the most preferred one anyway.
    pub fallback_to_unhealthy: bool,
}

impl Default for ProviderPoolConfig {
    fn default() -> Self {
        Self {
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig {
                initial_backoff: Duration::from_millis(50),
                max_backoff: Duration::from_secs(2),
                ..RetryConfig::default()
            },
            probe_interval: None,
            fallback_to_unhealthy: true,
        }
    }
}

/// Events published by the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    HealthChanged {
        chain_id: u64,
        endpoint_id: String,
        old: HealthStatus,
        new: HealthStatus,
    },
}

/// Snapshot of one endpoint for health output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointStatus {
    pub endpoint_id: String,
    pub kind: String,
    pub priority: u32,
    pub weight: u32,
    pub circuit: CircuitState,
    #[serde(flatten)]
    pub health: EndpointHealth,
}

struct EndpointSlot {
    endpoint: Endpoint,
    transport: Arc<dyn RpcTransport>,
    health: Mutex<EndpointHealth>,
    circuit: CircuitBreaker,
}

impl EndpointSlot {
    fn status(&self) -> HealthStatus {
        self.health.lock().unwrap_or_else(PoisonError::into_inner).status
    }
}

struct ChainEntry {
    spec: ChainSpec,
    /// Sorted by priority ascending, then weight descending.
    slots: Vec<Arc<EndpointSlot>>,
}

/// Upstream providers for every supported chain.
pub struct ProviderPool {
    config: ProviderPoolConfig,
    retry: RetryPolicy,
    factory: Arc<dyn TransportFactory>,
    rng: Arc<dyn RandomSource>,
    chains: RwLock<HashMap<u64, ChainEntry>>,
    events: broadcast::Sender<PoolEvent>,
    next_id: AtomicU64,
}

impl ProviderPool {
    pub fn new(config: ProviderPoolConfig, factory: Arc<dyn TransportFactory>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            retry: RetryPolicy::new(config.retry.clone()),
            config,
            factory,
            rng: Arc::new(ThreadRandom),
            chains: RwLock::new(HashMap::new()),
            events,
            next_id: AtomicU64::new(1),
        }
    }

    /// Replace the random source used for weighted selection.
    pub fn with_random_source(mut self, rng: Arc<dyn RandomSource>) -> Self {
        self.rng = rng;
        self
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Declare a chain as supported. Re-registering updates its spec and
    /// keeps its endpoints.
    pub fn register_chain(&self, spec: ChainSpec) {
        let mut chains = self.chains.write().unwrap_or_else(PoisonError::into_inner);
        match chains.get_mut(&spec.chain_id) {
            Some(entry) => entry.spec = spec,
            None => {
                tracing::debug!(chain_id = spec.chain_id, name = %spec.display_name(), "chain registered");
                chains.insert(spec.chain_id, ChainEntry { spec, slots: Vec::new() });
            }
        }
    }

    /// Load every endpoint from `source`. Endpoints on unregistered chains
    /// are skipped with a warning. Returns the number of endpoints added.
    pub async fn initialize(&self, source: &dyn EndpointSource) -> Result<usize, GatewayError> {
        let mut added = 0;
        for endpoint in source.find_all().await? {
            if !self.is_supported(endpoint.chain_id) {
                tracing::warn!(
                    endpoint = %endpoint.id,
                    chain_id = endpoint.chain_id,
                    "skipping endpoint for unconfigured chain"
                );
                continue;
            }
            if self.add_endpoint(endpoint)? {
                added += 1;
            }
        }
        tracing::info!(endpoints = added, chains = self.chain_ids().len(), "provider pool initialized");
        Ok(added)
    }

    /// Add or replace an endpoint. Inactive endpoints are ignored and return
    /// `Ok(false)`.
    pub fn add_endpoint(&self, endpoint: Endpoint) -> Result<bool, GatewayError> {
        if !self.is_supported(endpoint.chain_id) {
            return Err(GatewayError::UnsupportedChain {
                chain_id: endpoint.chain_id,
            });
        }
        if !endpoint.active {
            tracing::debug!(endpoint = %endpoint.id, "ignoring inactive endpoint");
            return Ok(false);
        }
        let transport = self.factory.create(&endpoint)?;
        let slot = Arc::new(EndpointSlot {
            transport,
            health: Mutex::new(EndpointHealth::default()),
            circuit: CircuitBreaker::new(self.config.circuit_breaker.clone()),
            endpoint,
        });

        // Ids are unique across chains.
        self.remove_endpoint(&slot.endpoint.id);

        let mut chains = self.chains.write().unwrap_or_else(PoisonError::into_inner);
        let entry = chains
            .get_mut(&slot.endpoint.chain_id)
            .ok_or(GatewayError::UnsupportedChain {
                chain_id: slot.endpoint.chain_id,
            })?;
        tracing::info!(
            chain_id = slot.endpoint.chain_id,
            endpoint = %slot.endpoint.id,
            url = %slot.transport.url(),
            priority = slot.endpoint.priority,
            "endpoint added"
        );
        entry.slots.push(slot);
        entry.slots.sort_by(|a, b| {
            a.endpoint
                .priority
                .cmp(&b.endpoint.priority)
                .then(b.endpoint.weight.cmp(&a.endpoint.weight))
        });
        Ok(true)
    }

    /// Remove an endpoint by id. Returns `true` if it was present.
    pub fn remove_endpoint(&self, endpoint_id: &str) -> bool {
        let mut chains = self.chains.write().unwrap_or_else(PoisonError::into_inner);
        for entry in chains.values_mut() {
            let before = entry.slots.len();
            entry.slots.retain(|s| s.endpoint.id != endpoint_id);
            if entry.slots.len() != before {
                tracing::info!(chain_id = entry.spec.chain_id, endpoint = endpoint_id, "endpoint removed");
                return true;
            }
        }
        false
    }

    pub fn is_supported(&self, chain_id: u64) -> bool {
        self.chains
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&chain_id)
    }

    pub fn chain_spec(&self, chain_id: u64) -> Option<ChainSpec> {
        self.chains
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&chain_id)
            .map(|e| e.spec.clone())
    }

    /// Specs of every supported chain, ordered by chain id.
    pub fn supported_chains(&self) -> Vec<ChainSpec> {
        let chains = self.chains.read().unwrap_or_else(PoisonError::into_inner);
        let mut specs: Vec<ChainSpec> = chains.values().map(|e| e.spec.clone()).collect();
        specs.sort_by_key(|s| s.chain_id);
        specs
    }

    pub fn chain_ids(&self) -> Vec<u64> {
        self.supported_chains().into_iter().map(|s| s.chain_id).collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    fn slots(&self, chain_id: u64) -> Result<Vec<Arc<EndpointSlot>>, GatewayError> {
        self.chains
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&chain_id)
            .map(|e| e.slots.clone())
            .ok_or(GatewayError::UnsupportedChain { chain_id })
    }

    /// Health and breaker state of every endpoint on `chain_id`, in
    /// preference order.
    pub fn endpoint_health(&self, chain_id: u64) -> Result<Vec<EndpointStatus>, GatewayError> {
        Ok(self
            .slots(chain_id)?
            .iter()
            .map(|s| EndpointStatus {
                endpoint_id: s.endpoint.id.clone(),
                kind: s.endpoint.kind.to_string(),
                priority: s.endpoint.priority,
                weight: s.endpoint.weight,
                circuit: s.circuit.state(),
                health: s.health.lock().unwrap_or_else(PoisonError::into_inner).clone(),
            })
            .collect())
    }

    /// Endpoints eligible for a request, healthy first then by priority.
    /// Falls back to the most preferred endpoint when nothing is eligible.
    fn candidates(&self, chain_id: u64) -> Result<Vec<Arc<EndpointSlot>>, GatewayError> {
        let slots = self.slots(chain_id)?;
        let mut eligible: Vec<(HealthStatus, Arc<EndpointSlot>)> = slots
            .iter()
            .map(|s| (s.status(), Arc::clone(s)))
            .filter(|(status, s)| *status != HealthStatus::Unhealthy && s.circuit.would_allow())
            .collect();
        // Stable: priority order is kept within each status.
        eligible.sort_by_key(|(status, _)| *status);

        if eligible.is_empty() && self.config.fallback_to_unhealthy {
            if let Some(first) = slots.first() {
                tracing::warn!(
                    chain_id,
                    endpoint = %first.endpoint.id,
                    "no eligible endpoints, falling back to most preferred"
                );
                return Ok(vec![Arc::clone(first)]);
            }
        }
        Ok(eligible.into_iter().map(|(_, s)| s).collect())
    }

    fn record(&self, chain_id: u64, slot: &EndpointSlot, outcome: CallOutcome) {
        let change = slot
            .health
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record_outcome(outcome);
        if let Some((old, new)) = change {
            tracing::info!(
                chain_id,
                endpoint = %slot.endpoint.id,
                %old,
                %new,
                "endpoint health changed"
            );
            let _ = self.events.send(PoolEvent::HealthChanged {
                chain_id,
                endpoint_id: slot.endpoint.id.clone(),
                old,
                new,
            });
        }
    }

    async fn send_once(&self, slot: &EndpointSlot, method: &str, params: Vec<RpcParam>) -> Result<JsonRpcResponse, TransportError> {
        let req = JsonRpcRequest::new(self.next_id(), method, params);
        let timeout = slot.endpoint.timeout();
        match tokio::time::timeout(timeout, slot.transport.send(req)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout {
                ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Try `slots` in order, retrying each up to its `max_retries`.
    async fn dispatch(
        &self,
        chain_id: u64,
        slots: Vec<Arc<EndpointSlot>>,
        method: &str,
        params: Vec<RpcParam>,
    ) -> Result<JsonRpcResponse, GatewayError> {
        if slots.is_empty() {
            return Err(GatewayError::AllProvidersFailed {
                chain_id,
                last_error: "no endpoints available".into(),
            });
        }

        let mut last_error = String::new();
        for slot in slots {
            let attempts = slot.endpoint.max_retries.saturating_add(1);
            for attempt in 0..attempts {
                if attempt > 0 {
                    tokio::time::sleep(self.retry.backoff(attempt)).await;
                }
                if !slot.circuit.allow() {
                    last_error = TransportError::CircuitOpen {
                        provider: slot.endpoint.id.clone(),
                    }
                    .to_string();
                    break;
                }

                let started = Instant::now();
                match self.send_once(&slot, method, params.clone()).await {
                    Ok(resp) => {
                        slot.circuit.on_success();
                        self.record(
                            chain_id,
                            &slot,
                            CallOutcome::Success {
                                latency: started.elapsed(),
                                height: None,
                            },
                        );
                        return Ok(resp);
                    }
                    Err(e) => {
                        slot.circuit.on_failure();
                        self.record(chain_id, &slot, CallOutcome::Failure);
                        tracing::warn!(
                            chain_id,
                            endpoint = %slot.endpoint.id,
                            method,
                            attempt = attempt + 1,
                            error = %e,
                            "upstream call failed"
                        );
                        let retryable = e.is_retryable();
                        last_error = e.to_string();
                        if !retryable {
                            break;
                        }
                    }
                }
            }
        }

        tracing::error!(chain_id, method, error = %last_error, "all providers failed");
        Err(GatewayError::AllProvidersFailed { chain_id, last_error })
    }

    /// Send a request with priority failover across the chain's endpoints.
    pub async fn execute_request(
        &self,
        chain_id: u64,
        method: &str,
        params: Vec<RpcParam>,
    ) -> Result<JsonRpcResponse, GatewayError> {
        let candidates = self.candidates(chain_id)?;
        self.dispatch(chain_id, candidates, method, params).await
    }

    /// Like [`execute_request`](Self::execute_request), but the first
    /// endpoint is chosen by weighted random selection.
    pub async fn execute_balanced(
        &self,
        chain_id: u64,
        method: &str,
        params: Vec<RpcParam>,
    ) -> Result<JsonRpcResponse, GatewayError> {
        let mut candidates = self.candidates(chain_id)?;
        let weights: Vec<u64> = candidates.iter().map(|s| s.endpoint.weight as u64).collect();
        if let Some(idx) = weighted_index(&weights, self.rng.next_f64()) {
            let chosen = candidates.remove(idx);
            candidates.insert(0, chosen);
        }
        self.dispatch(chain_id, candidates, method, params).await
    }

    /// Pick an endpoint with a WebSocket URL, avoiding `exclude` when another
    /// choice exists.
    pub fn select_ws_endpoint(&self, chain_id: u64, exclude: &[String]) -> Result<Option<Endpoint>, GatewayError> {
        let with_ws: Vec<Arc<EndpointSlot>> = self
            .slots(chain_id)?
            .into_iter()
            .filter(|s| s.endpoint.resolved_ws_url().is_some())
            .collect();

        let preferred: Vec<Endpoint> = with_ws
            .iter()
            .filter(|s| {
                !exclude.contains(&s.endpoint.id)
                    && s.status() != HealthStatus::Unhealthy
                    && s.circuit.would_allow()
            })
            .map(|s| s.endpoint.clone())
            .collect();
        if let Some(ep) = select_for_load_balancing(&preferred, self.rng.as_ref()) {
            return Ok(Some(ep.clone()));
        }

        let any: Vec<Endpoint> = with_ws.iter().map(|s| s.endpoint.clone()).collect();
        let rest: Vec<Endpoint> = any.iter().filter(|e| !exclude.contains(&e.id)).cloned().collect();
        let pool = if rest.is_empty() { any } else { rest };
        Ok(pool.first().cloned())
    }

    /// Probe every endpoint on `chain_id` once with `eth_blockNumber`.
    pub async fn probe_chain(&self, chain_id: u64) -> Result<(), GatewayError> {
        let slots = self.slots(chain_id)?;
        let probes = slots.iter().map(|slot| self.probe_slot(chain_id, slot));
        futures::future::join_all(probes).await;
        Ok(())
    }

    async fn probe_slot(&self, chain_id: u64, slot: &EndpointSlot) {
        // Probes always run so health recovers, but only a probe the breaker
        // admitted may report to it.
        let admitted = slot.circuit.allow();
        let started = Instant::now();
        let outcome = match self.send_once(slot, "eth_blockNumber", vec![]).await {
            Ok(resp) => match resp.into_result().map(|v| parse_quantity(&v)) {
                Ok(Some(height)) => CallOutcome::Success {
                    latency: started.elapsed(),
                    height: Some(height),
                },
                Ok(None) => {
                    tracing::debug!(chain_id, endpoint = %slot.endpoint.id, "probe returned a non-numeric height");
                    CallOutcome::Failure
                }
                Err(e) => {
                    tracing::debug!(chain_id, endpoint = %slot.endpoint.id, error = %e, "probe rejected by node");
                    CallOutcome::Failure
                }
            },
            Err(e) => {
                tracing::debug!(chain_id, endpoint = %slot.endpoint.id, error = %e, "probe failed");
                CallOutcome::Failure
            }
        };
        if admitted {
            match outcome {
                CallOutcome::Success { .. } => slot.circuit.on_success(),
                CallOutcome::Failure => slot.circuit.on_failure(),
            }
        }
        self.record(chain_id, slot, outcome);
    }

    /// Start one probe loop per registered chain.
    pub fn start_probes(self: &Arc<Self>) -> TaskHandle {
        let mut handle = TaskHandle::new("provider_pool");
        for spec in self.supported_chains() {
            let interval = self
                .config
                .probe_interval
                .unwrap_or_else(|| spec.block_time())
                .max(MIN_PROBE_INTERVAL);
            let mut stop = handle.signal();
            let this = Arc::clone(self);
            let chain_id = spec.chain_id;
            handle.push(tokio::spawn(async move {
                tracing::debug!(chain_id, interval_ms = interval.as_millis() as u64, "health probes started");
                loop {
                    if let Err(e) = this.probe_chain(chain_id).await {
                        tracing::warn!(chain_id, error = %e, "health probe skipped");
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

/// Parse a `0x`-prefixed hex quantity.
pub fn parse_quantity(value: &Value) -> Option<u64> {
    let s = value.as_str()?;
    u64::from_str_radix(s.strip_prefix("0x")?, 16).ok()
}

#[async_trait]
impl HealthCheck for ProviderPool {
    async fn check(&self) -> Result<ComponentHealth, GatewayError> {
        let mut worst = HealthStatus::Healthy;
        let mut details = serde_json::Map::new();
        let chain_ids = self.chain_ids();
        if chain_ids.is_empty() {
            return Ok(ComponentHealth::unhealthy("no chains configured"));
        }
        for chain_id in chain_ids {
            let endpoints = self.endpoint_health(chain_id)?;
            let usable = endpoints
                .iter()
                .filter(|e| e.health.status != HealthStatus::Unhealthy && e.circuit != CircuitState::Open)
                .count();
            let all_healthy = endpoints
                .iter()
                .all(|e| e.health.status == HealthStatus::Healthy && e.circuit == CircuitState::Closed);
            let status = if usable == 0 {
                HealthStatus::Unhealthy
            } else if all_healthy {
                HealthStatus::Healthy
            } else {
                HealthStatus::Degraded
            };
            worst = worst.max(status);
            details.insert(
                chain_id.to_string(),
                serde_json::json!({
                    "status": status,
                    "usable": usable,
                    "total": endpoints.len(),
                    "endpoints": endpoints,
                }),
            );
        }
        let health = match worst {
            HealthStatus::Healthy => ComponentHealth::healthy(),
            HealthStatus::Degraded => ComponentHealth::degraded("some endpoints are failing"),
            HealthStatus::Unhealthy => ComponentHealth::unhealthy("a chain has no usable endpoints"),
        };
        Ok(health.with_details(Value::Object(details)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemoryEndpointSource;
    use std::sync::atomic::AtomicUsize;

    /// Transport that returns a fixed result or fails, counting calls.
    struct MockTransport {
        url: String,
        result: Option<Value>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RpcTransport for MockTransport {
        async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.result {
                Some(v) => Ok(JsonRpcResponse::success(req.id, v.clone())),
                None => Err(TransportError::Http("mock error".into())),
            }
        }
        fn url(&self) -> &str {
            &self.url
        }
    }

    /// Builds transports from the endpoint URL: `ok:<result>` or `fail`.
    #[derive(Default)]
    struct MockFactory {
        created: Mutex<HashMap<String, Arc<MockTransport>>>,
    }

    impl MockFactory {
        fn calls(&self, id: &str) -> usize {
            self.created.lock().unwrap()[id].calls.load(Ordering::SeqCst)
        }
    }

    impl TransportFactory for MockFactory {
        fn create(&self, endpoint: &Endpoint) -> Result<Arc<dyn RpcTransport>, TransportError> {
            let result = endpoint
                .http_url
                .strip_prefix("ok:")
                .map(|r| Value::String(r.to_string()));
            let t = Arc::new(MockTransport {
                url: endpoint.http_url.clone(),
                result,
                calls: AtomicUsize::new(0),
            });
            self.created.lock().unwrap().insert(endpoint.id.clone(), t.clone());
            Ok(t)
        }
    }

    fn pool_with(factory: Arc<MockFactory>, config: ProviderPoolConfig) -> ProviderPool {
        let pool = ProviderPool::new(config, factory);
        pool.register_chain(ChainSpec::known(1));
        pool
    }

    fn fast_config() -> ProviderPoolConfig {
        ProviderPoolConfig {
            retry: RetryConfig {
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
                jitter_fraction: 0.0,
                ..RetryConfig::default()
            },
            ..ProviderPoolConfig::default()
        }
    }

    fn ep(id: &str, url: &str, priority: u32) -> Endpoint {
        Endpoint::new(id, 1, url).with_priority(priority)
    }

    #[tokio::test]
    async fn fails_over_to_third_endpoint() {
        let factory = Arc::new(MockFactory::default());
        let pool = pool_with(factory.clone(), fast_config());
        pool.add_endpoint(ep("a", "fail", 1)).unwrap();
        pool.add_endpoint(ep("b", "fail", 2)).unwrap();
        pool.add_endpoint(ep("c", "ok:0x10", 3)).unwrap();

        let resp = pool.execute_request(1, "eth_blockNumber", vec![]).await.unwrap();
        assert_eq!(resp.result, Some(Value::String("0x10".into())));
        // One retry per endpoint by default.
        assert_eq!(factory.calls("a"), 2);
        assert_eq!(factory.calls("b"), 2);
        assert_eq!(factory.calls("c"), 1);
    }

    #[tokio::test]
    async fn all_failing_yields_single_error() {
        let factory = Arc::new(MockFactory::default());
        let pool = pool_with(factory, fast_config());
        for (id, p) in [("a", 1), ("b", 2), ("c", 3)] {
            pool.add_endpoint(ep(id, "fail", p)).unwrap();
        }
        match pool.execute_request(1, "eth_chainId", vec![]).await {
            Err(GatewayError::AllProvidersFailed { chain_id, last_error }) => {
                assert_eq!(chain_id, 1);
                assert!(last_error.contains("mock error"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_chain_is_rejected() {
        let pool = pool_with(Arc::new(MockFactory::default()), fast_config());
        let err = pool.execute_request(999, "eth_chainId", vec![]).await.unwrap_err();
        assert!(matches!(err, GatewayError::UnsupportedChain { chain_id: 999 }));
        assert!(pool.add_endpoint(Endpoint::new("x", 999, "ok:1")).is_err());
    }

    #[tokio::test]
    async fn unhealthy_endpoints_are_skipped() {
        let factory = Arc::new(MockFactory::default());
        let pool = pool_with(factory.clone(), fast_config());
        pool.add_endpoint(ep("a", "fail", 1).with_max_retries(2)).unwrap();
        pool.add_endpoint(ep("b", "ok:0x1", 2)).unwrap();

        // Three failures on `a` mark it unhealthy.
        pool.execute_request(1, "eth_chainId", vec![]).await.unwrap();
        assert_eq!(factory.calls("a"), 3);
        let health = pool.endpoint_health(1).unwrap();
        assert_eq!(health[0].health.status, HealthStatus::Unhealthy);

        pool.execute_request(1, "eth_chainId", vec![]).await.unwrap();
        assert_eq!(factory.calls("a"), 3);
        assert_eq!(factory.calls("b"), 2);
    }

    #[tokio::test]
    async fn falls_back_to_most_preferred_when_nothing_is_eligible() {
        let factory = Arc::new(MockFactory::default());
        let pool = pool_with(
            factory.clone(),
            ProviderPoolConfig {
                circuit_breaker: CircuitBreakerConfig {
                    failure_threshold: 10,
                    reset_timeout: Duration::from_secs(60),
                },
                ..fast_config()
            },
        );
        pool.add_endpoint(ep("a", "fail", 1).with_max_retries(2)).unwrap();
        pool.execute_request(1, "eth_chainId", vec![]).await.unwrap_err();
        assert_eq!(factory.calls("a"), 3);

        // Unhealthy now, but still tried as the fallback.
        pool.execute_request(1, "eth_chainId", vec![]).await.unwrap_err();
        assert_eq!(factory.calls("a"), 6);
    }

    #[tokio::test]
    async fn fallback_can_be_disabled() {
        let factory = Arc::new(MockFactory::default());
        let pool = pool_with(
            factory.clone(),
            ProviderPoolConfig {
                fallback_to_unhealthy: false,
                ..fast_config()
            },
        );
        pool.add_endpoint(ep("a", "fail", 1).with_max_retries(2)).unwrap();
        pool.execute_request(1, "eth_chainId", vec![]).await.unwrap_err();
        let err = pool.execute_request(1, "eth_chainId", vec![]).await.unwrap_err();
        assert!(matches!(err, GatewayError::AllProvidersFailed { .. }));
        assert_eq!(factory.calls("a"), 3);
    }

    #[tokio::test]
    async fn open_breaker_short_circuits_fallback() {
        let factory = Arc::new(MockFactory::default());
        let pool = pool_with(
            factory.clone(),
            ProviderPoolConfig {
                circuit_breaker: CircuitBreakerConfig {
                    failure_threshold: 2,
                    reset_timeout: Duration::from_secs(60),
                },
                ..fast_config()
            },
        );
        pool.add_endpoint(ep("a", "fail", 1).with_max_retries(5)).unwrap();
        pool.execute_request(1, "eth_chainId", vec![]).await.unwrap_err();
        // Breaker opened after two failures and stopped the retries.
        assert_eq!(factory.calls("a"), 2);

        match pool.execute_request(1, "eth_chainId", vec![]).await {
            Err(GatewayError::AllProvidersFailed { last_error, .. }) => {
                assert!(last_error.contains("Circuit breaker open"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(factory.calls("a"), 2);
    }

    #[tokio::test]
    async fn health_changes_are_published() {
        let factory = Arc::new(MockFactory::default());
        let pool = pool_with(factory, fast_config());
        let mut rx = pool.subscribe();
        pool.add_endpoint(ep("a", "fail", 1).with_max_retries(0)).unwrap();
        pool.add_endpoint(ep("b", "ok:0x1", 2)).unwrap();
        pool.execute_request(1, "eth_chainId", vec![]).await.unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            PoolEvent::HealthChanged {
                chain_id: 1,
                endpoint_id: "a".into(),
                old: HealthStatus::Healthy,
                new: HealthStatus::Degraded,
            }
        );
    }

    #[tokio::test]
    async fn balanced_requests_start_from_weighted_choice() {
        let factory = Arc::new(MockFactory::default());
        let pool = ProviderPool::new(fast_config(), factory.clone())
            .with_random_source(Arc::new(SequenceRandom::new(vec![0.9])));
        pool.register_chain(ChainSpec::known(1));
        pool.add_endpoint(ep("a", "ok:0xa", 1).with_weight(1)).unwrap();
        pool.add_endpoint(ep("b", "ok:0xb", 1).with_weight(1)).unwrap();

        let resp = pool.execute_balanced(1, "eth_blockNumber", vec![]).await.unwrap();
        assert_eq!(resp.result, Some(Value::String("0xb".into())));
        assert_eq!(factory.calls("a"), 0);
    }

    #[tokio::test]
    async fn probes_record_height_and_recover_health() {
        let factory = Arc::new(MockFactory::default());
        let pool = pool_with(factory, fast_config());
        pool.add_endpoint(ep("a", "ok:0x2a", 1)).unwrap();
        pool.probe_chain(1).await.unwrap();
        let health = pool.endpoint_health(1).unwrap();
        assert_eq!(health[0].health.last_height, Some(42));
        assert_eq!(health[0].health.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn endpoints_sorted_by_priority_then_weight() {
        let pool = pool_with(Arc::new(MockFactory::default()), fast_config());
        pool.add_endpoint(ep("low", "ok:1", 5)).unwrap();
        pool.add_endpoint(ep("light", "ok:1", 1).with_weight(1)).unwrap();
        pool.add_endpoint(ep("heavy", "ok:1", 1).with_weight(10)).unwrap();
        let order: Vec<String> = pool
            .endpoint_health(1)
            .unwrap()
            .into_iter()
            .map(|s| s.endpoint_id)
            .collect();
        assert_eq!(order, vec!["heavy", "light", "low"]);
    }

    #[tokio::test]
    async fn initialize_skips_inactive_and_unknown_chains() {
        let pool = pool_with(Arc::new(MockFactory::default()), fast_config());
        let mut inactive = ep("off", "ok:1", 1);
        inactive.active = false;
        let source = MemoryEndpointSource::new(vec![
            ep("a", "ok:1", 1),
            inactive,
            Endpoint::new("other", 56, "ok:1"),
        ]);
        assert_eq!(pool.initialize(&source).await.unwrap(), 1);
        assert!(pool.remove_endpoint("a"));
        assert!(!pool.remove_endpoint("a"));
    }

    #[tokio::test]
    async fn ws_selection_prefers_non_excluded() {
        let pool = pool_with(Arc::new(MockFactory::default()), fast_config());
        pool.add_endpoint(ep("a", "ok:1", 1).with_ws_url("ws://a")).unwrap();
        pool.add_endpoint(ep("b", "ok:1", 2).with_ws_url("ws://b")).unwrap();
        pool.add_endpoint(ep("c", "ok:1", 3)).unwrap();

        let chosen = pool.select_ws_endpoint(1, &["a".to_string()]).unwrap().unwrap();
        assert_eq!(chosen.id, "b");
        let chosen = pool
            .select_ws_endpoint(1, &["a".to_string(), "b".to_string()])
            .unwrap()
            .unwrap();
        assert!(chosen.id == "a" || chosen.id == "b");
    }

    #[test]
    fn quantity_parsing() {
        assert_eq!(parse_quantity(&Value::String("0x10".into())), Some(16));
        assert_eq!(parse_quantity(&Value::String("16".into())), None);
        assert_eq!(parse_quantity(&Value::Null), None);
    }
}
