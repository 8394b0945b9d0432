//! chaingate-core: foundation types and services for the ChainGate RPC gateway.
//!
//! # Overview
//!
//! - [`RpcTransport`] / [`TransportFactory`]: one upstream endpoint and how to build it
//! - [`JsonRpcRequest`] / [`JsonRpcResponse`]: wire types
//! - [`TransportError`] / [`GatewayError`]: structured error types
//! - [`policy`] module: circuit breaker and retry backoff
//! - [`pool`] module: per-chain failover pool with weighted selection and probing
//! - [`store`] module: shared store trait with memory and Redis backends
//! - [`lock`] module: distributed locks over the shared store
//! - [`rate_limiter`] module: fixed-window caller limits
//! - [`health`] module: component health checks and the aggregator

pub mod endpoint;
pub mod error;
pub mod health;
pub mod lock;
pub mod policy;
pub mod pool;
pub mod rate_limiter;
pub mod request;
pub mod source;
pub mod store;
pub mod task;
pub mod transport;

pub use endpoint::{CallOutcome, ChainSpec, Endpoint, EndpointHealth, ProviderKind};
pub use error::{GatewayError, TransportError};
pub use health::{ComponentHealth, HealthAggregator, HealthCheck, HealthConfig, HealthReport, HealthStatus};
pub use lock::{DistributedLock, LockError, LockGuard, NoopLock, StoreLock};
pub use pool::{EndpointStatus, PoolEvent, ProviderPool, ProviderPoolConfig};
pub use rate_limiter::{RateLimitConfig, RateLimitInfo, RateLimiter};
pub use request::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RpcId, RpcParam};
pub use source::{EndpointSource, MemoryEndpointSource};
pub use store::{MemoryStore, SharedStore, StoreError, StoreHealth};
pub use task::{StopSignal, TaskHandle};
pub use transport::{RpcTransport, TransportFactory};
