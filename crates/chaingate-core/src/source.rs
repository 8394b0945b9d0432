//! Endpoint configuration source.
//!
//! The pool never owns endpoint configuration; it reads it from an
//! [`EndpointSource`] at startup and when providers are added or removed.

use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use crate::endpoint::Endpoint;
use crate::error::GatewayError;
use crate::health::{ComponentHealth, HealthCheck};

#[async_trait]
pub trait EndpointSource: Send + Sync + 'static {
    async fn find_all(&self) -> Result<Vec<Endpoint>, GatewayError>;

    async fn find_by_chain_id(&self, chain_id: u64) -> Result<Vec<Endpoint>, GatewayError>;

    /// Add or replace the endpoint with `endpoint.id`.
    async fn add_provider(&self, endpoint: Endpoint) -> Result<(), GatewayError>;

    /// Returns the removed endpoint, or `None` if the id was unknown.
    async fn remove_provider(&self, endpoint_id: &str) -> Result<Option<Endpoint>, GatewayError>;
}

/// [`EndpointSource`] holding endpoints in memory, seeded from configuration.
#[derive(Debug, Default)]
pub struct MemoryEndpointSource {
    endpoints: RwLock<Vec<Endpoint>>,
}

impl MemoryEndpointSource {
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self {
            endpoints: RwLock::new(endpoints),
        }
    }

    pub fn len(&self) -> usize {
        self.endpoints.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EndpointSource for MemoryEndpointSource {
    async fn find_all(&self) -> Result<Vec<Endpoint>, GatewayError> {
        Ok(self.endpoints.read().unwrap_or_else(PoisonError::into_inner).clone())
    }

    async fn find_by_chain_id(&self, chain_id: u64) -> Result<Vec<Endpoint>, GatewayError> {
        Ok(self
            .endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.chain_id == chain_id)
            .cloned()
            .collect())
    }

    async fn add_provider(&self, endpoint: Endpoint) -> Result<(), GatewayError> {
        if endpoint.id.is_empty() {
            return Err(GatewayError::Validation("endpoint id must not be empty".into()));
        }
        let mut endpoints = self.endpoints.write().unwrap_or_else(PoisonError::into_inner);
        endpoints.retain(|e| e.id != endpoint.id);
        endpoints.push(endpoint);
        Ok(())
    }

    async fn remove_provider(&self, endpoint_id: &str) -> Result<Option<Endpoint>, GatewayError> {
        let mut endpoints = self.endpoints.write().unwrap_or_else(PoisonError::into_inner);
        let pos = endpoints.iter().position(|e| e.id == endpoint_id);
        Ok(pos.map(|i| endpoints.remove(i)))
    }
}

#[async_trait]
impl HealthCheck for MemoryEndpointSource {
    async fn check(&self) -> Result<ComponentHealth, GatewayError> {
        let endpoints = self.find_all().await?;
        let active = endpoints.iter().filter(|e| e.active).count();
        let details = serde_json::json!({ "endpoints": endpoints.len(), "active": active });
        if active == 0 {
            return Ok(ComponentHealth::unhealthy("no active endpoints configured").with_details(details));
        }
        Ok(ComponentHealth::healthy().with_details(details))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_replaces_by_id_and_remove_returns_endpoint() {
        let source = MemoryEndpointSource::new(vec![Endpoint::new("a", 1, "http://a")]);
        source
            .add_provider(Endpoint::new("a", 1, "http://a2"))
            .await
            .unwrap();
        source.add_provider(Endpoint::new("b", 137, "http://b")).await.unwrap();

        assert_eq!(source.len(), 2);
        assert_eq!(source.find_by_chain_id(1).await.unwrap()[0].http_url, "http://a2");

        let removed = source.remove_provider("b").await.unwrap();
        assert_eq!(removed.map(|e| e.chain_id), Some(137));
        assert!(source.remove_provider("b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_source_is_unhealthy() {
        let source = MemoryEndpointSource::default();
        let health = source.check().await.unwrap();
        assert_eq!(health.status, crate::health::HealthStatus::Unhealthy);
    }
}
