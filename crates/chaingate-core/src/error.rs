//! Error types: transport-level failures and the gateway-wide taxonomy.

use thiserror::Error;

use crate::lock::LockError;
use crate::store::StoreError;

/// Errors that can occur while talking to a single upstream endpoint.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// HTTP request failed (connection refused, bad status, etc.).
    #[error("HTTP error: {0}")]
    Http(String),

    /// WebSocket connection/send/receive error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// The provider answered 429; the caller should back off.
    #[error("Rate limit exceeded (provider: {provider})")]
    RateLimited { provider: String },

    /// Circuit breaker is open, so the provider is short-circuited.
    #[error("Circuit breaker open for provider: {provider}")]
    CircuitOpen { provider: String },

    /// Request timed out after the configured duration.
    #[error("Request timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// Response could not be deserialized.
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// An unexpected error.
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Returns `true` if this error is transient and worth retrying on the same endpoint.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Http(_) | Self::WebSocket(_) | Self::Timeout { .. } | Self::RateLimited { .. }
        )
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        Self::Deserialization(e.to_string())
    }
}

/// JSON-RPC error code used for unexpected server-side failures.
pub const SERVER_ERROR_CODE: i64 = -32000;
/// JSON-RPC error code for invalid parameters.
pub const INVALID_PARAMS_CODE: i64 = -32602;
/// JSON-RPC error code for "limit exceeded" (EIP-1474).
pub const LIMIT_EXCEEDED_CODE: i64 = -32005;

/// Errors surfaced by gateway components to their callers.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Unsupported chain: {chain_id}")]
    UnsupportedChain { chain_id: u64 },

    #[error("All providers failed for chain {chain_id}: {last_error}")]
    AllProvidersFailed { chain_id: u64, last_error: String },

    #[error("Provider error: {0}")]
    Provider(#[from] TransportError),

    #[error("Nonce error for {address} on chain {chain_id}: {cause}")]
    Nonce {
        chain_id: u64,
        address: String,
        cause: String,
    },

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Rate limit exceeded, retry after {retry_after_seconds}s")]
    RateLimitExceeded { retry_after_seconds: u64 },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl GatewayError {
    /// JSON-RPC envelope code for this error.
    pub fn rpc_code(&self) -> i64 {
        match self {
            Self::RateLimitExceeded { .. } => LIMIT_EXCEEDED_CODE,
            Self::Validation(_) => INVALID_PARAMS_CODE,
            _ => SERVER_ERROR_CODE,
        }
    }
}
