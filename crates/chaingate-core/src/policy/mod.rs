//! Reliability policies applied per upstream endpoint.

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use retry::{RetryConfig, RetryPolicy};
