//! Health status, the `HealthCheck` trait and the aggregator that polls every
//! registered component.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::GatewayError;
use crate::task::{sleep_or_stop, TaskHandle};

/// Component or endpoint health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Responding normally.
    Healthy,
    /// Responding but degraded (recent errors, stale data, fallback mode).
    Degraded,
    /// Not responding.
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Result of one component check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

impl ComponentHealth {
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            message: None,
            details: Value::Null,
        }
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Degraded,
            message: Some(message.into()),
            details: Value::Null,
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
            details: Value::Null,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// Anything the aggregator can poll.
#[async_trait]
pub trait HealthCheck: Send + Sync + 'static {
    async fn check(&self) -> Result<ComponentHealth, GatewayError>;
}

/// Combined result of one `check_all` pass (`healthCheckComplete`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub components: BTreeMap<String, ComponentHealth>,
    pub checked_at: DateTime<Utc>,
}

/// Worst status wins; no results at all counts as unhealthy.
pub fn overall_status<'a>(statuses: impl IntoIterator<Item = &'a HealthStatus>) -> HealthStatus {
    statuses
        .into_iter()
        .copied()
        .max()
        .unwrap_or(HealthStatus::Unhealthy)
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub interval: Duration,
    /// A check that takes longer than this is reported unhealthy.
    pub check_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            check_timeout: Duration::from_secs(5),
        }
    }
}

/// Polls registered components concurrently and publishes a combined report.
pub struct HealthAggregator {
    config: HealthConfig,
    checks: Mutex<Vec<(String, Arc<dyn HealthCheck>)>>,
    last: Mutex<Option<HealthReport>>,
    tx: broadcast::Sender<HealthReport>,
}

impl HealthAggregator {
    pub fn new(config: HealthConfig) -> Self {
        let (tx, _) = broadcast::channel(16);
        Self {
            config,
            checks: Mutex::new(Vec::new()),
            last: Mutex::new(None),
            tx,
        }
    }

    /// Register a component under `name`. Re-registering a name replaces it.
    pub fn register(&self, name: impl Into<String>, check: Arc<dyn HealthCheck>) {
        let name = name.into();
        let mut checks = self.checks.lock().unwrap_or_else(PoisonError::into_inner);
        checks.retain(|(n, _)| *n != name);
        checks.push((name, check));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthReport> {
        self.tx.subscribe()
    }

    /// The most recent report, if a check has completed.
    pub fn last_report(&self) -> Option<HealthReport> {
        self.last.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Run every check concurrently. Errors, panics and timeouts become
    /// `unhealthy` results instead of propagating.
    pub async fn check_all(&self) -> HealthReport {
        let checks = self.checks.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let timeout = self.config.check_timeout;

        let tasks = checks.into_iter().map(|(name, check)| {
            let task = tokio::spawn(async move { tokio::time::timeout(timeout, check.check()).await });
            async move {
                let result = match task.await {
                    Ok(Ok(Ok(health))) => health,
                    Ok(Ok(Err(e))) => ComponentHealth::unhealthy(e.to_string()),
                    Ok(Err(_)) => ComponentHealth::unhealthy(format!(
                        "check timed out after {}ms",
                        timeout.as_millis()
                    )),
                    Err(e) => ComponentHealth::unhealthy(format!("check failed: {e}")),
                };
                (name, result)
            }
        });

        let components: BTreeMap<String, ComponentHealth> =
            futures::future::join_all(tasks).await.into_iter().collect();
        let status = overall_status(components.values().map(|c| &c.status));

        let report = HealthReport {
            status,
            components,
            checked_at: Utc::now(),
        };
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(report.clone());
        let _ = self.tx.send(report.clone());
        report
    }

    /// Run `check_all` every interval until stopped.
    pub fn start(self: &Arc<Self>) -> TaskHandle {
        let mut handle = TaskHandle::new("health");
        let mut stop = handle.signal();
        let this = Arc::clone(self);
        handle.push(tokio::spawn(async move {
            loop {
                let report = this.check_all().await;
                tracing::debug!(status = %report.status, components = report.components.len(), "health check complete");
                if report.status != HealthStatus::Healthy {
                    tracing::warn!(status = %report.status, "gateway health degraded");
                }
                if !sleep_or_stop(&mut stop, this.config.interval).await {
                    break;
                }
            }
        }));
        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(HealthStatus);

    #[async_trait]
    impl HealthCheck for Fixed {
        async fn check(&self) -> Result<ComponentHealth, GatewayError> {
            Ok(ComponentHealth {
                status: self.0,
                message: None,
                details: Value::Null,
            })
        }
    }

    struct Failing;

    #[async_trait]
    impl HealthCheck for Failing {
        async fn check(&self) -> Result<ComponentHealth, GatewayError> {
            Err(GatewayError::Config("backend gone".into()))
        }
    }

    struct Panicking;

    #[async_trait]
    impl HealthCheck for Panicking {
        async fn check(&self) -> Result<ComponentHealth, GatewayError> {
            panic!("check exploded")
        }
    }

    struct Slow;

    #[async_trait]
    impl HealthCheck for Slow {
        async fn check(&self) -> Result<ComponentHealth, GatewayError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(ComponentHealth::healthy())
        }
    }

    fn aggregator() -> HealthAggregator {
        HealthAggregator::new(HealthConfig {
            interval: Duration::from_secs(1),
            check_timeout: Duration::from_millis(100),
        })
    }

    #[tokio::test]
    async fn empty_aggregator_is_unhealthy() {
        let agg = aggregator();
        assert_eq!(agg.check_all().await.status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn worst_status_wins() {
        let agg = aggregator();
        agg.register("a", Arc::new(Fixed(HealthStatus::Healthy)));
        agg.register("b", Arc::new(Fixed(HealthStatus::Degraded)));
        assert_eq!(agg.check_all().await.status, HealthStatus::Degraded);

        agg.register("c", Arc::new(Fixed(HealthStatus::Unhealthy)));
        assert_eq!(agg.check_all().await.status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn failures_become_unhealthy_results() {
        let agg = aggregator();
        agg.register("ok", Arc::new(Fixed(HealthStatus::Healthy)));
        agg.register("err", Arc::new(Failing));
        agg.register("panic", Arc::new(Panicking));
        agg.register("slow", Arc::new(Slow));

        let report = agg.check_all().await;
        assert_eq!(report.components.len(), 4);
        assert_eq!(report.components["ok"].status, HealthStatus::Healthy);
        assert_eq!(report.components["err"].status, HealthStatus::Unhealthy);
        assert_eq!(report.components["panic"].status, HealthStatus::Unhealthy);
        assert_eq!(report.components["slow"].status, HealthStatus::Unhealthy);
        assert_eq!(report.status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn report_is_published_and_kept() {
        let agg = aggregator();
        let mut rx = agg.subscribe();
        agg.register("a", Arc::new(Fixed(HealthStatus::Healthy)));
        agg.check_all().await;
        assert_eq!(rx.recv().await.unwrap().status, HealthStatus::Healthy);
        assert!(agg.last_report().is_some());
    }

    #[test]
    fn reregistering_replaces() {
        let agg = aggregator();
        agg.register("a", Arc::new(Fixed(HealthStatus::Healthy)));
        agg.register("a", Arc::new(Fixed(HealthStatus::Degraded)));
        assert_eq!(agg.checks.lock().unwrap().len(), 1);
    }
}
