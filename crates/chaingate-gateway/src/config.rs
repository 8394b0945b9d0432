//! Gateway configuration, loaded from YAML.
//!
//! ```yaml
//! chains:
//!   - chain_id: 1
//!   - chain_id: 137
//!     block_time_ms: 2000
//! endpoints:
//!   - id: eth-alchemy
//!     chain_id: 1
//!     kind: alchemy
//!     api_key: "..."
//!     priority: 1
//!   - id: eth-public
//!     chain_id: 1
//!     http_url: https://cloudflare-eth.com
//!     priority: 10
//! rate_limit:
//!   max_requests: 300
//! store:
//!   backend: redis
//!   url: redis://127.0.0.1:6379
//! ```
//!
//! Every section is optional. `CHAINGATE_STORE_URL` and
//! `CHAINGATE_LOG_LEVEL` override the file.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use chaingate_chain::{GasConfig, NonceConfig, ReorgConfig};
use chaingate_core::policy::{CircuitBreakerConfig, RetryConfig};
use chaingate_core::{ChainSpec, Endpoint, GatewayError, HealthConfig, ProviderPoolConfig, RateLimitConfig};
use chaingate_ws::HubConfig;
use serde::{Deserialize, Serialize};

use crate::telemetry::LogConfig;

pub const ENV_STORE_URL: &str = "CHAINGATE_STORE_URL";
pub const ENV_LOG_LEVEL: &str = "CHAINGATE_LOG_LEVEL";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub chains: Vec<ChainSpec>,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    #[serde(default)]
    pub pool: PoolSection,
    #[serde(default)]
    pub nonce: NonceSection,
    #[serde(default)]
    pub gas: GasSection,
    #[serde(default)]
    pub reorg: ReorgSection,
    #[serde(default)]
    pub rate_limit: RateLimitSection,
    #[serde(default)]
    pub health: HealthSection,
    #[serde(default)]
    pub subscriptions: SubscriptionSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub logging: LogConfig,
}

// ─── Sections ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSection {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
    /// Unset probes each chain once per block time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_interval_ms: Option<u64>,
    #[serde(default = "default_retry_initial_ms")]
    pub retry_initial_backoff_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_backoff_ms: u64,
    #[serde(default = "bool_true")]
    pub fallback_to_unhealthy: bool,
}

fn default_failure_threshold() -> u32 { 5 }
fn default_reset_timeout_ms() -> u64 { 30_000 }
fn default_retry_initial_ms() -> u64 { 50 }
fn default_retry_max_ms() -> u64 { 2_000 }
fn bool_true() -> bool { true }

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
            probe_interval_ms: None,
            retry_initial_backoff_ms: default_retry_initial_ms(),
            retry_max_backoff_ms: default_retry_max_ms(),
            fallback_to_unhealthy: true,
        }
    }
}

impl PoolSection {
    pub fn to_pool_config(&self) -> ProviderPoolConfig {
        ProviderPoolConfig {
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: self.failure_threshold,
                reset_timeout: Duration::from_millis(self.reset_timeout_ms),
            },
            retry: RetryConfig {
                initial_backoff: Duration::from_millis(self.retry_initial_backoff_ms),
                max_backoff: Duration::from_millis(self.retry_max_backoff_ms),
                ..RetryConfig::default()
            },
            probe_interval: self.probe_interval_ms.map(Duration::from_millis),
            fallback_to_unhealthy: self.fallback_to_unhealthy,
        }
    }
}

/// Which distributed lock guards nonce allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockBackend {
    /// SET-NX lock in the shared store.
    #[default]
    Store,
    /// In-process serialization only. Single instance deployments.
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NonceSection {
    #[serde(default)]
    pub lock: LockBackend,
    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: u64,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

fn default_lock_ttl_ms() -> u64 { 5_000 }
fn default_acquire_timeout_ms() -> u64 { 5_000 }

impl Default for NonceSection {
    fn default() -> Self {
        Self {
            lock: LockBackend::Store,
            lock_ttl_ms: default_lock_ttl_ms(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

impl NonceSection {
    pub fn to_nonce_config(&self) -> NonceConfig {
        NonceConfig {
            lock_ttl: Duration::from_millis(self.lock_ttl_ms),
            ..NonceConfig::default()
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GasSection {
    #[serde(default = "default_gas_ttl_ms")]
    pub cache_ttl_ms: u64,
    #[serde(default = "default_history_size")]
    pub history_size: usize,
}

fn default_gas_ttl_ms() -> u64 { 15_000 }
fn default_history_size() -> usize { 100 }

impl Default for GasSection {
    fn default() -> Self {
        Self {
            cache_ttl_ms: default_gas_ttl_ms(),
            history_size: default_history_size(),
        }
    }
}

impl GasSection {
    pub fn to_gas_config(&self) -> GasConfig {
        GasConfig {
            cache_ttl: Duration::from_millis(self.cache_ttl_ms),
            history_size: self.history_size,
            ..GasConfig::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReorgSection {
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
    #[serde(default = "default_max_depth")]
    pub max_depth: u64,
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    /// Unset polls at half the block time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
}

fn default_cache_size() -> usize { 256 }
fn default_max_depth() -> u64 { 64 }

impl Default for ReorgSection {
    fn default() -> Self {
        Self {
            cache_size: default_cache_size(),
            max_depth: default_max_depth(),
            history_size: default_history_size(),
            poll_interval_ms: None,
        }
    }
}

impl ReorgSection {
    pub fn to_reorg_config(&self) -> ReorgConfig {
        ReorgConfig {
            cache_size: self.cache_size,
            max_depth: self.max_depth,
            history_size: self.history_size,
            poll_interval: self.poll_interval_ms.map(Duration::from_millis),
            ..ReorgConfig::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSection {
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_max_requests")]
    pub max_requests: u64,
    #[serde(default = "default_sweep_ms")]
    pub sweep_interval_ms: u64,
}

fn default_window_ms() -> u64 { 60_000 }
fn default_max_requests() -> u64 { 100 }
fn default_sweep_ms() -> u64 { 60_000 }

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            max_requests: default_max_requests(),
            sweep_interval_ms: default_sweep_ms(),
        }
    }
}

impl RateLimitSection {
    pub fn to_rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            window: Duration::from_millis(self.window_ms),
            max_requests: self.max_requests,
            sweep_interval: Duration::from_millis(self.sweep_interval_ms),
            ..RateLimitConfig::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSection {
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_check_timeout_ms")]
    pub check_timeout_ms: u64,
}

fn default_health_interval_ms() -> u64 { 30_000 }
fn default_check_timeout_ms() -> u64 { 5_000 }

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            interval_ms: default_health_interval_ms(),
            check_timeout_ms: default_check_timeout_ms(),
        }
    }
}

impl HealthSection {
    pub fn to_health_config(&self) -> HealthConfig {
        HealthConfig {
            interval: Duration::from_millis(self.interval_ms),
            check_timeout: Duration::from_millis(self.check_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionSection {
    #[serde(default = "default_ws_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_ws_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_resubscribe_attempts")]
    pub resubscribe_attempts: u32,
    #[serde(default = "default_resubscribe_max_ms")]
    pub resubscribe_max_backoff_ms: u64,
}

fn default_ws_timeout_ms() -> u64 { 10_000 }
fn default_resubscribe_attempts() -> u32 { 10 }
fn default_resubscribe_max_ms() -> u64 { 60_000 }

impl Default for SubscriptionSection {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_ws_timeout_ms(),
            request_timeout_ms: default_ws_timeout_ms(),
            resubscribe_attempts: default_resubscribe_attempts(),
            resubscribe_max_backoff_ms: default_resubscribe_max_ms(),
        }
    }
}

impl SubscriptionSection {
    pub fn to_hub_config(&self) -> HubConfig {
        let defaults = HubConfig::default();
        HubConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            resubscribe: RetryConfig {
                max_retries: self.resubscribe_attempts,
                max_backoff: Duration::from_millis(self.resubscribe_max_backoff_ms),
                ..defaults.resubscribe
            },
            ..defaults
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSection {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

// ─── Loading ──────────────────────────────────────────────────────────────────

impl GatewayConfig {
    /// Parse YAML without applying environment overrides or validating.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, GatewayError> {
        serde_yaml::from_str(yaml).map_err(|e| GatewayError::Config(format!("invalid YAML: {e}")))
    }

    /// Read `path`, apply environment overrides and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, GatewayError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::Config(format!("cannot read {}: {e}", path.display())))?;
        let mut config = Self::from_yaml_str(&yaml)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from `lookup` (normally the process environment).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_STORE_URL).filter(|u| !u.is_empty()) {
            if url.starts_with("redis://") || url.starts_with("rediss://") {
                self.store.backend = StoreBackend::Redis;
            }
            self.store.url = Some(url);
        }
        if let Some(level) = lookup(ENV_LOG_LEVEL).filter(|l| !l.is_empty()) {
            self.logging.level = level;
        }
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        let mut chains = HashSet::new();
        for chain in &self.chains {
            if !chains.insert(chain.chain_id) {
                return Err(GatewayError::Config(format!("chain {} listed twice", chain.chain_id)));
            }
        }
        let mut ids = HashSet::new();
        for endpoint in &self.endpoints {
            if endpoint.id.is_empty() {
                return Err(GatewayError::Config("endpoint with empty id".into()));
            }
            if !ids.insert(endpoint.id.as_str()) {
                return Err(GatewayError::Config(format!("duplicate endpoint id '{}'", endpoint.id)));
            }
            if !chains.contains(&endpoint.chain_id) {
                return Err(GatewayError::Config(format!(
                    "endpoint '{}' is on unconfigured chain {}",
                    endpoint.id, endpoint.chain_id
                )));
            }
            if endpoint.resolved_http_url().is_none() {
                return Err(GatewayError::Config(format!(
                    "endpoint '{}' has no HTTP URL and no provider template",
                    endpoint.id
                )));
            }
        }
        if self.rate_limit.max_requests == 0 || self.rate_limit.window_ms == 0 {
            return Err(GatewayError::Config("rate limit window and max_requests must be non-zero".into()));
        }
        if self.store.backend == StoreBackend::Redis && self.store.url.is_none() {
            return Err(GatewayError::Config("redis store requires a url".into()));
        }
        Ok(())
    }

    /// Configured chains with built-in defaults filled in.
    pub fn chain_specs(&self) -> Vec<ChainSpec> {
        self.chains
            .iter()
            .map(|c| {
                let known = ChainSpec::known(c.chain_id);
                ChainSpec {
                    chain_id: c.chain_id,
                    name: if c.name.is_empty() { known.name } else { c.name.clone() },
                    block_time_ms: c.block_time_ms.or(known.block_time_ms),
                    eip1559: c.eip1559.or(known.eip1559),
                }
            })
            .collect()
    }
}
