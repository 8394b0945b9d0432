//! Upstream endpoint records, provider URL profiles, chain parameters and
//! per-endpoint health bookkeeping.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::health::HealthStatus;

/// Consecutive failures after which an endpoint is marked unhealthy.
pub const UNHEALTHY_AFTER_FAILURES: u32 = 3;

// ─── ProviderKind ─────────────────────────────────────────────────────────────

/// Which RPC service an endpoint belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Alchemy,
    Infura,
    QuickNode,
    Ankr,
    Public,
    #[default]
    Custom,
}

impl ProviderKind {
    /// URL template for HTTP JSON-RPC when only an API key is configured.
    pub fn http_url(&self, api_key: &str, chain_id: u64) -> Option<String> {
        match self {
            Self::Alchemy => Some(format!(
                "https://{}.g.alchemy.com/v2/{api_key}",
                alchemy_network(chain_id)
            )),
            Self::Infura => Some(format!(
                "https://{}.infura.io/v3/{api_key}",
                infura_network(chain_id)
            )),
            Self::Ankr => Some(format!("https://rpc.ankr.com/{}/{api_key}", ankr_network(chain_id))),
            // QuickNode uses personal subdomain URLs, not a shared template.
            Self::QuickNode | Self::Public | Self::Custom => None,
        }
    }

    /// URL template for WebSocket subscriptions when only an API key is configured.
    pub fn ws_url(&self, api_key: &str, chain_id: u64) -> Option<String> {
        match self {
            Self::Alchemy => Some(format!(
                "wss://{}.g.alchemy.com/v2/{api_key}",
                alchemy_network(chain_id)
            )),
            Self::Infura => Some(format!(
                "wss://{}.infura.io/ws/v3/{api_key}",
                infura_network(chain_id)
            )),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Alchemy => "alchemy",
            Self::Infura => "infura",
            Self::QuickNode => "quicknode",
            Self::Ankr => "ankr",
            Self::Public => "public",
            Self::Custom => "custom",
        };
        f.write_str(s)
    }
}

fn alchemy_network(chain_id: u64) -> &'static str {
    match chain_id {
        11155111 => "eth-sepolia",
        137 => "polygon-mainnet",
        42161 => "arb-mainnet",
        10 => "opt-mainnet",
        8453 => "base-mainnet",
        _ => "eth-mainnet",
    }
}

fn infura_network(chain_id: u64) -> &'static str {
    match chain_id {
        11155111 => "sepolia",
        137 => "polygon-mainnet",
        42161 => "arbitrum-mainnet",
        10 => "optimism-mainnet",
        8453 => "base-mainnet",
        _ => "mainnet",
    }
}

fn ankr_network(chain_id: u64) -> &'static str {
    match chain_id {
        137 => "polygon",
        42161 => "arbitrum",
        10 => "optimism",
        8453 => "base",
        56 => "bsc",
        43114 => "avalanche",
        _ => "eth",
    }
}

// ─── Endpoint ─────────────────────────────────────────────────────────────────

/// One upstream JSON-RPC provider for one chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: String,
    pub chain_id: u64,
    #[serde(default)]
    pub kind: ProviderKind,
    /// HTTP JSON-RPC URL. May contain an `{api_key}` placeholder, or be empty
    /// for providers with a URL template.
    #[serde(default)]
    pub http_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Lower is preferred.
    #[serde(default = "default_priority")]
    pub priority: u32,
    /// Relative share for weighted load balancing.
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Retries against this endpoint before failing over to the next one.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Requests per second the provider tolerates (informational).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<u32>,
    #[serde(default = "bool_true")]
    pub active: bool,
}

fn default_priority() -> u32 { 100 }
fn default_weight() -> u32 { 1 }
fn default_max_retries() -> u32 { 1 }
fn default_timeout_ms() -> u64 { 10_000 }
fn bool_true() -> bool { true }

impl Endpoint {
    /// Create an active custom endpoint with default limits.
    pub fn new(id: impl Into<String>, chain_id: u64, http_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            chain_id,
            kind: ProviderKind::Custom,
            http_url: http_url.into(),
            ws_url: None,
            api_key: None,
            priority: default_priority(),
            weight: default_weight(),
            max_retries: default_max_retries(),
            timeout_ms: default_timeout_ms(),
            rate_limit: None,
            active: true,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_ws_url(mut self, url: impl Into<String>) -> Self {
        self.ws_url = Some(url.into());
        self
    }

    /// Per-request timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }

    /// The HTTP URL with the API key applied.
    pub fn resolved_http_url(&self) -> Option<String> {
        resolve(&self.http_url, self.api_key.as_deref())
            .or_else(|| {
                self.api_key
                    .as_deref()
                    .and_then(|key| self.kind.http_url(key, self.chain_id))
            })
    }

    /// The WebSocket URL with the API key applied, if the endpoint has one.
    pub fn resolved_ws_url(&self) -> Option<String> {
        self.ws_url
            .as_deref()
            .and_then(|url| resolve(url, self.api_key.as_deref()))
            .or_else(|| {
                self.api_key
                    .as_deref()
                    .and_then(|key| self.kind.ws_url(key, self.chain_id))
            })
    }
}

fn resolve(url: &str, api_key: Option<&str>) -> Option<String> {
    if url.is_empty() {
        return None;
    }
    match api_key {
        Some(key) => Some(url.replace("{api_key}", key)),
        None => Some(url.to_string()),
    }
}

// ─── ChainSpec ────────────────────────────────────────────────────────────────

/// Chain parameters the gateway needs: nominal block time and fee model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainSpec {
    pub chain_id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_time_ms: Option<u64>,
    /// EIP-1559 fee market. Falls back to the built-in table, then `true`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eip1559: Option<bool>,
}

/// chain id, name, block time (ms), fee market
const KNOWN_CHAINS: &[(u64, &str, u64, bool)] = &[
    (1, "ethereum", 12_000, true),
    (10, "optimism", 2_000, true),
    (56, "bsc", 3_000, false),
    (137, "polygon", 2_000, true),
    (8453, "base", 2_000, true),
    (42161, "arbitrum", 250, true),
    (43114, "avalanche", 2_000, true),
    (11155111, "sepolia", 12_000, true),
];

impl ChainSpec {
    /// Spec for a well-known chain id, or a bare spec with defaults.
    pub fn known(chain_id: u64) -> Self {
        match KNOWN_CHAINS.iter().find(|(id, ..)| *id == chain_id) {
            Some((id, name, block_ms, eip1559)) => Self {
                chain_id: *id,
                name: (*name).to_string(),
                block_time_ms: Some(*block_ms),
                eip1559: Some(*eip1559),
            },
            None => Self {
                chain_id,
                name: format!("chain-{chain_id}"),
                block_time_ms: None,
                eip1559: None,
            },
        }
    }

    fn fallback(&self) -> Option<&'static (u64, &'static str, u64, bool)> {
        KNOWN_CHAINS.iter().find(|(id, ..)| *id == self.chain_id)
    }

    /// Nominal block time.
    pub fn block_time(&self) -> Duration {
        let ms = self
            .block_time_ms
            .or_else(|| self.fallback().map(|c| c.2))
            .unwrap_or(12_000);
        Duration::from_millis(ms)
    }

    /// Whether fees follow the base fee + priority fee model.
    pub fn is_fee_market(&self) -> bool {
        self.eip1559
            .or_else(|| self.fallback().map(|c| c.3))
            .unwrap_or(true)
    }

    /// Display name.
    pub fn display_name(&self) -> String {
        if !self.name.is_empty() {
            return self.name.clone();
        }
        self.fallback()
            .map(|c| c.1.to_string())
            .unwrap_or_else(|| format!("chain-{}", self.chain_id))
    }
}

// ─── EndpointHealth ───────────────────────────────────────────────────────────

/// Outcome of one upstream call, as reported to [`EndpointHealth::record_outcome`].
#[derive(Debug, Clone, Copy)]
pub enum CallOutcome {
    Success {
        latency: Duration,
        height: Option<u64>,
    },
    Failure,
}

/// Mutable health of one endpoint. Owned by the provider pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointHealth {
    pub status: HealthStatus,
    /// Latency of the last successful call.
    pub latency_ms: Option<u64>,
    pub consecutive_errors: u32,
    pub consecutive_successes: u32,
    pub last_height: Option<u64>,
    pub last_check: Option<DateTime<Utc>>,
}

impl Default for EndpointHealth {
    fn default() -> Self {
        Self {
            status: HealthStatus::Healthy,
            latency_ms: None,
            consecutive_errors: 0,
            consecutive_successes: 0,
            last_height: None,
            last_check: None,
        }
    }
}

impl EndpointHealth {
    /// Apply a call outcome. Returns `(old, new)` when the status changed.
    pub fn record_outcome(&mut self, outcome: CallOutcome) -> Option<(HealthStatus, HealthStatus)> {
        let old = self.status;
        self.last_check = Some(Utc::now());
        match outcome {
            CallOutcome::Success { latency, height } => {
                self.consecutive_errors = 0;
                self.consecutive_successes = self.consecutive_successes.saturating_add(1);
                self.latency_ms = Some(latency.as_millis() as u64);
                if let Some(h) = height {
                    self.last_height = Some(h);
                }
                self.status = HealthStatus::Healthy;
            }
            CallOutcome::Failure => {
                self.consecutive_successes = 0;
                self.consecutive_errors = self.consecutive_errors.saturating_add(1);
                self.status = if self.consecutive_errors >= UNHEALTHY_AFTER_FAILURES {
                    HealthStatus::Unhealthy
                } else {
                    HealthStatus::Degraded
                };
            }
        }
        (old != self.status).then_some((old, self.status))
    }
}
