//! The `RpcTransport` trait: one upstream endpoint as seen by the pool.

use std::sync::Arc;

use async_trait::async_trait;

use crate::endpoint::Endpoint;
use crate::error::TransportError;
use crate::request::{JsonRpcRequest, JsonRpcResponse};

/// The central async trait every RPC transport must implement.
///
/// # Thread Safety
/// Implementations must be `Send + Sync` for use across Tokio tasks.
///
/// # Object Safety
/// The trait is object-safe and can be stored as `Arc<dyn RpcTransport>`.
#[async_trait]
pub trait RpcTransport: Send + Sync + 'static {
    /// Send a single JSON-RPC request and return the response.
    ///
    /// A node-level JSON-RPC error is a successful transport call: it comes
    /// back as `Ok` with the `error` field populated.
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError>;

    /// Return the transport's identifier (URL or name).
    fn url(&self) -> &str;
}

/// Builds transports for endpoint records handed over by the configuration source.
pub trait TransportFactory: Send + Sync {
    fn create(&self, endpoint: &Endpoint) -> Result<Arc<dyn RpcTransport>, TransportError>;
}
