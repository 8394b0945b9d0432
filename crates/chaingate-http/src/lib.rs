//! chaingate-http: HTTP JSON-RPC transport.
//!
//! Retries, circuit breaking and failover live in the provider pool; this
//! crate only moves one request over HTTP and classifies the failure.

pub mod client;

pub use client::{HttpClientConfig, HttpRpcClient, HttpTransportFactory};
