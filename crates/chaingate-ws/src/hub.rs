//! Subscription hub: multiplexed `eth_subscribe` feeds over pooled WebSocket
//! connections, with resubscription after disconnects.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use chaingate_core::endpoint::Endpoint;
use chaingate_core::error::{GatewayError, TransportError};
use chaingate_core::health::{ComponentHealth, HealthCheck};
use chaingate_core::policy::{RetryConfig, RetryPolicy};
use chaingate_core::pool::ProviderPool;
use chaingate_core::task::sleep_or_stop;

use crate::connection::{ConnectionEvent, WsConnection};

/// What to subscribe to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SubscriptionKind {
    NewHeads,
    NewPendingTransactions,
    Logs {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        address: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        topics: Vec<Value>,
    },
}

impl SubscriptionKind {
    /// `eth_subscribe` params for this kind.
    pub fn params(&self) -> Vec<Value> {
        match self {
            Self::NewHeads => vec![json!("newHeads")],
            Self::NewPendingTransactions => vec![json!("newPendingTransactions")],
            Self::Logs { address, topics } => {
                let mut filter = serde_json::Map::new();
                if let Some(address) = address {
                    filter.insert("address".into(), json!(address));
                }
                if !topics.is_empty() {
                    filter.insert("topics".into(), Value::Array(topics.clone()));
                }
                vec![json!("logs"), Value::Object(filter)]
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    pub chain_id: u64,
    pub kind: SubscriptionKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    /// Gateway-assigned id, stable across resubscriptions.
    pub id: String,
    pub chain_id: u64,
    pub kind: SubscriptionKind,
    /// Id returned by the upstream node; changes on resubscribe.
    pub upstream_id: Option<String>,
    pub endpoint_id: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// One push notification, re-keyed to the gateway subscription id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionData {
    pub subscription_id: String,
    pub chain_id: u64,
    pub payload: Value,
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Backoff and attempt budget for resubscribing after a disconnect.
    pub resubscribe: RetryConfig,
    /// Endpoints tried per subscribe before giving up.
    pub endpoint_attempts: u32,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            resubscribe: RetryConfig {
                max_retries: 10,
                initial_backoff: Duration::from_secs(1),
                max_backoff: Duration::from_secs(60),
                multiplier: 2.0,
                jitter_fraction: 0.1,
            },
            endpoint_attempts: 3,
        }
    }
}

struct Connection {
    chain_id: u64,
    endpoint_id: String,
    conn: Arc<WsConnection>,
}

struct SubEntry {
    record: SubscriptionRecord,
    conn_id: Option<u64>,
}

#[derive(Default)]
struct HubState {
    connections: HashMap<u64, Connection>,
    subscriptions: HashMap<String, SubEntry>,
    /// (connection id, upstream id) → gateway subscription id
    routes: HashMap<(u64, String), String>,
    /// Notifications that arrived before their route was stored.
    unrouted: HashMap<(u64, String), Vec<Value>>,
}

const MAX_UNROUTED_KEYS: usize = 64;
const MAX_UNROUTED_PER_KEY: usize = 16;

impl HubState {
    /// Store a route and return notifications buffered for it.
    fn route(&mut self, conn_id: u64, upstream_id: String, id: &str, chain_id: u64) -> Vec<SubscriptionData> {
        let key = (conn_id, upstream_id);
        let buffered = self.unrouted.remove(&key).unwrap_or_default();
        self.routes.insert(key, id.to_string());
        buffered
            .into_iter()
            .map(|payload| SubscriptionData {
                subscription_id: id.to_string(),
                chain_id,
                payload,
            })
            .collect()
    }

    fn buffer(&mut self, key: (u64, String), payload: Value) {
        if !self.unrouted.contains_key(&key) && self.unrouted.len() >= MAX_UNROUTED_KEYS {
            self.unrouted.clear();
        }
        let queue = self.unrouted.entry(key).or_default();
        if queue.len() < MAX_UNROUTED_PER_KEY {
            queue.push(payload);
        }
    }
}

/// Owns every upstream WebSocket connection and the subscriptions on them.
pub struct SubscriptionHub {
    pool: Arc<ProviderPool>,
    config: HubConfig,
    retry: RetryPolicy,
    state: Mutex<HubState>,
    data_tx: broadcast::Sender<SubscriptionData>,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    stop_tx: watch::Sender<bool>,
    next_conn_id: AtomicU64,
    /// Serialises connects per (chain, endpoint) so concurrent subscribers
    /// share one socket.
    connect_gates: Mutex<HashMap<(u64, String), Arc<tokio::sync::Mutex<()>>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl SubscriptionHub {
    /// Create the hub and start its event dispatcher. Must be called inside a
    /// Tokio runtime.
    pub fn new(pool: Arc<ProviderPool>, config: HubConfig) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (data_tx, _) = broadcast::channel(1024);
        let (stop_tx, _) = watch::channel(false);
        let hub = Arc::new(Self {
            pool,
            retry: RetryPolicy::new(config.resubscribe.clone()),
            config,
            state: Mutex::new(HubState::default()),
            data_tx,
            events_tx,
            stop_tx,
            next_conn_id: AtomicU64::new(1),
            connect_gates: Mutex::new(HashMap::new()),
            dispatcher: Mutex::new(None),
        });
        let join = tokio::spawn(dispatch_events(Arc::downgrade(&hub), events_rx));
        *hub.dispatcher.lock().unwrap_or_else(PoisonError::into_inner) = Some(join);
        hub
    }

    fn state(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_shut_down(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Receive notifications for every subscription.
    pub fn updates(&self) -> broadcast::Receiver<SubscriptionData> {
        self.data_tx.subscribe()
    }

    pub fn list(&self) -> Vec<SubscriptionRecord> {
        let mut records: Vec<SubscriptionRecord> =
            self.state().subscriptions.values().map(|e| e.record.clone()).collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    pub fn get(&self, id: &str) -> Option<SubscriptionRecord> {
        self.state().subscriptions.get(id).map(|e| e.record.clone())
    }

    pub fn connection_count(&self) -> usize {
        self.state().connections.len()
    }

    /// Subscribe on a pool-selected endpoint, reusing its connection if one
    /// is open.
    pub async fn subscribe(self: &Arc<Self>, config: SubscriptionConfig) -> Result<SubscriptionRecord, GatewayError> {
        if self.is_shut_down() {
            return Err(TransportError::WebSocket("subscription hub is shut down".into()).into());
        }
        if !self.pool.is_supported(config.chain_id) {
            return Err(GatewayError::UnsupportedChain {
                chain_id: config.chain_id,
            });
        }

        let (conn_id, endpoint_id, upstream_id) = self.open_upstream(config.chain_id, &config.kind, &[]).await?;
        let record = SubscriptionRecord {
            id: Uuid::new_v4().to_string(),
            chain_id: config.chain_id,
            kind: config.kind,
            upstream_id: Some(upstream_id.clone()),
            endpoint_id: Some(endpoint_id.clone()),
            active: true,
            created_at: Utc::now(),
        };

        let (orphaned, buffered) = {
            let mut state = self.state();
            let alive = state.connections.contains_key(&conn_id);
            let mut entry = SubEntry {
                record: record.clone(),
                conn_id: Some(conn_id),
            };
            let mut buffered = Vec::new();
            if alive {
                buffered = state.route(conn_id, upstream_id, &record.id, record.chain_id);
            } else {
                // The connection dropped before the record was stored.
                entry.conn_id = None;
                entry.record.active = false;
                entry.record.upstream_id = None;
            }
            state.subscriptions.insert(record.id.clone(), entry);
            (!alive, buffered)
        };
        for data in buffered {
            let _ = self.data_tx.send(data);
        }
        if orphaned {
            self.spawn_resubscribe(record.id.clone(), endpoint_id);
        }

        tracing::info!(
            chain_id = record.chain_id,
            subscription = %record.id,
            endpoint = record.endpoint_id.as_deref().unwrap_or_default(),
            "subscription created"
        );
        Ok(record)
    }

    /// Remove a subscription and tell the upstream. Returns `false` for an
    /// unknown id. The record is removed even if the upstream call fails.
    pub async fn unsubscribe(&self, id: &str) -> Result<bool, GatewayError> {
        let (entry, conn) = {
            let mut state = self.state();
            let Some(entry) = state.subscriptions.remove(id) else {
                return Ok(false);
            };
            if let (Some(conn_id), Some(upstream)) = (entry.conn_id, &entry.record.upstream_id) {
                state.routes.remove(&(conn_id, upstream.clone()));
            }
            let conn = entry
                .conn_id
                .and_then(|c| state.connections.get(&c))
                .map(|c| Arc::clone(&c.conn));
            (entry, conn)
        };

        if let (Some(conn), Some(upstream)) = (&conn, &entry.record.upstream_id) {
            match conn
                .request("eth_unsubscribe", vec![json!(upstream)], self.config.request_timeout)
                .await
            {
                Ok(resp) if resp.is_ok() => {}
                Ok(resp) => tracing::warn!(
                    subscription = id,
                    error = ?resp.error,
                    "upstream rejected eth_unsubscribe"
                ),
                Err(e) => tracing::warn!(subscription = id, error = %e, "eth_unsubscribe failed"),
            }
        }
        if let Some(conn_id) = entry.conn_id {
            self.close_if_idle(conn_id);
        }
        tracing::info!(subscription = id, "subscription removed");
        Ok(true)
    }

    /// Close every connection immediately and stop resubscribing.
    pub fn shutdown(&self) {
        self.stop_tx.send_replace(true);
        let connections: Vec<Arc<WsConnection>> = {
            let mut state = self.state();
            state.routes.clear();
            state.unrouted.clear();
            for entry in state.subscriptions.values_mut() {
                entry.conn_id = None;
                entry.record.active = false;
            }
            state.connections.drain().map(|(_, c)| c.conn).collect()
        };
        let closed = connections.len();
        for conn in connections {
            conn.close();
        }
        if let Some(join) = self.dispatcher.lock().unwrap_or_else(PoisonError::into_inner).take() {
            join.abort();
        }
        tracing::info!(connections = closed, "subscription hub shut down");
    }

    fn close_if_idle(&self, conn_id: u64) {
        let idle = {
            let mut state = self.state();
            let in_use = state.subscriptions.values().any(|e| e.conn_id == Some(conn_id));
            if in_use {
                None
            } else {
                state.connections.remove(&conn_id)
            }
        };
        if let Some(c) = idle {
            tracing::debug!(conn_id, endpoint = %c.endpoint_id, "closing idle connection");
            c.conn.close();
        }
    }

    /// Subscribe upstream on up to `endpoint_attempts` endpoints, avoiding
    /// `exclude` while alternatives exist.
    async fn open_upstream(
        &self,
        chain_id: u64,
        kind: &SubscriptionKind,
        exclude: &[String],
    ) -> Result<(u64, String, String), GatewayError> {
        let mut exclude = exclude.to_vec();
        let mut last_error = String::from("no WebSocket endpoint configured");
        for _ in 0..self.config.endpoint_attempts.max(1) {
            let Some(endpoint) = self.pool.select_ws_endpoint(chain_id, &exclude)? else {
                break;
            };
            match self.subscribe_on(&endpoint, kind).await {
                Ok((conn_id, upstream_id)) => return Ok((conn_id, endpoint.id, upstream_id)),
                Err(e) => {
                    tracing::warn!(chain_id, endpoint = %endpoint.id, error = %e, "eth_subscribe failed");
                    last_error = e.to_string();
                    exclude.push(endpoint.id);
                }
            }
        }
        Err(GatewayError::AllProvidersFailed { chain_id, last_error })
    }

    async fn subscribe_on(&self, endpoint: &Endpoint, kind: &SubscriptionKind) -> Result<(u64, String), TransportError> {
        let conn = self.connection_for(endpoint).await?;
        let resp = conn
            .request("eth_subscribe", kind.params(), self.config.request_timeout)
            .await?;
        match resp.into_result() {
            Ok(Value::String(upstream_id)) => Ok((conn.id(), upstream_id)),
            Ok(other) => Err(TransportError::Deserialization(format!(
                "unexpected subscription id: {other}"
            ))),
            Err(e) => Err(TransportError::Other(e.to_string())),
        }
    }

    fn open_connection(&self, endpoint: &Endpoint) -> Option<Arc<WsConnection>> {
        self.state()
            .connections
            .values()
            .find(|c| c.chain_id == endpoint.chain_id && c.endpoint_id == endpoint.id && !c.conn.is_closed())
            .map(|c| Arc::clone(&c.conn))
    }

    fn connect_gate(&self, endpoint: &Endpoint) -> Arc<tokio::sync::Mutex<()>> {
        let mut gates = self.connect_gates.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            gates
                .entry((endpoint.chain_id, endpoint.id.clone()))
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    async fn connection_for(&self, endpoint: &Endpoint) -> Result<Arc<WsConnection>, TransportError> {
        if let Some(conn) = self.open_connection(endpoint) {
            return Ok(conn);
        }

        let gate = self.connect_gate(endpoint);
        let _connecting = gate.lock().await;
        // Another subscriber may have connected while we waited.
        if let Some(conn) = self.open_connection(endpoint) {
            return Ok(conn);
        }

        let url = endpoint
            .resolved_ws_url()
            .ok_or_else(|| TransportError::Other(format!("endpoint '{}' has no WebSocket URL", endpoint.id)))?;
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(
            WsConnection::connect(
                conn_id,
                &url,
                format!("{}:{}", endpoint.kind, endpoint.id),
                self.config.connect_timeout,
                self.events_tx.clone(),
            )
            .await?,
        );

        let mut state = self.state();
        if self.is_shut_down() {
            conn.close();
            return Err(TransportError::WebSocket("subscription hub is shut down".into()));
        }
        state.connections.insert(
            conn_id,
            Connection {
                chain_id: endpoint.chain_id,
                endpoint_id: endpoint.id.clone(),
                conn: Arc::clone(&conn),
            },
        );
        Ok(conn)
    }

    fn handle_event(self: &Arc<Self>, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Notification {
                conn_id,
                upstream_id,
                payload,
            } => {
                let key = (conn_id, upstream_id);
                let target = {
                    let mut state = self.state();
                    let target = state
                        .routes
                        .get(&key)
                        .and_then(|id| state.subscriptions.get(id))
                        .map(|e| (e.record.id.clone(), e.record.chain_id));
                    if target.is_none() && state.connections.contains_key(&conn_id) {
                        state.buffer(key, payload.clone());
                    }
                    target
                };
                if let Some((subscription_id, chain_id)) = target {
                    let _ = self.data_tx.send(SubscriptionData {
                        subscription_id,
                        chain_id,
                        payload,
                    });
                }
            }
            ConnectionEvent::Closed { conn_id, reason } => {
                let (endpoint_id, orphaned) = {
                    let mut state = self.state();
                    let Some(conn) = state.connections.remove(&conn_id) else {
                        return;
                    };
                    state.routes.retain(|(c, _), _| *c != conn_id);
                    state.unrouted.retain(|(c, _), _| *c != conn_id);
                    let mut orphaned = Vec::new();
                    for (id, entry) in state.subscriptions.iter_mut() {
                        if entry.conn_id == Some(conn_id) {
                            entry.conn_id = None;
                            entry.record.active = false;
                            entry.record.upstream_id = None;
                            orphaned.push(id.clone());
                        }
                    }
                    (conn.endpoint_id, orphaned)
                };
                tracing::warn!(
                    conn_id,
                    endpoint = %endpoint_id,
                    %reason,
                    subscriptions = orphaned.len(),
                    "connection lost"
                );
                if self.is_shut_down() {
                    return;
                }
                for id in orphaned {
                    self.spawn_resubscribe(id, endpoint_id.clone());
                }
            }
        }
    }

    fn spawn_resubscribe(self: &Arc<Self>, subscription_id: String, failed_endpoint: String) {
        let hub = Arc::clone(self);
        tokio::spawn(async move { hub.resubscribe(subscription_id, failed_endpoint).await });
    }

    /// Kind and chain of a subscription still waiting to be resubscribed.
    fn awaiting_resubscribe(&self, id: &str) -> Option<(u64, SubscriptionKind)> {
        self.state()
            .subscriptions
            .get(id)
            .filter(|e| !e.record.active)
            .map(|e| (e.record.chain_id, e.record.kind.clone()))
    }

    async fn resubscribe(self: Arc<Self>, id: String, failed_endpoint: String) {
        let mut stop = self.stop_tx.subscribe();
        let attempts = self.retry.config.max_retries.max(1);
        for attempt in 1..=attempts {
            if !sleep_or_stop(&mut stop, self.retry.backoff(attempt)).await {
                return;
            }
            let Some((chain_id, kind)) = self.awaiting_resubscribe(&id) else {
                return;
            };
            match self
                .open_upstream(chain_id, &kind, std::slice::from_ref(&failed_endpoint))
                .await
            {
                Ok((conn_id, endpoint_id, upstream_id)) => {
                    let bound = {
                        let mut state = self.state();
                        let alive = state.connections.contains_key(&conn_id);
                        match state.subscriptions.get_mut(&id) {
                            None => None,
                            Some(_) if !alive => Some(None),
                            Some(entry) => {
                                entry.conn_id = Some(conn_id);
                                entry.record.active = true;
                                entry.record.upstream_id = Some(upstream_id.clone());
                                entry.record.endpoint_id = Some(endpoint_id.clone());
                                let chain_id = entry.record.chain_id;
                                Some(Some(state.route(conn_id, upstream_id.clone(), &id, chain_id)))
                            }
                        }
                    };
                    match bound {
                        Some(Some(buffered)) => {
                            for data in buffered {
                                let _ = self.data_tx.send(data);
                            }
                            tracing::info!(subscription = %id, endpoint = %endpoint_id, attempt, "resubscribed");
                            return;
                        }
                        // The new connection dropped too; try again.
                        Some(None) => continue,
                        None => {
                            // Unsubscribed while we were reconnecting.
                            let conn = self.state().connections.get(&conn_id).map(|c| Arc::clone(&c.conn));
                            if let Some(conn) = conn {
                                let _ = conn
                                    .request("eth_unsubscribe", vec![json!(upstream_id)], self.config.request_timeout)
                                    .await;
                            }
                            self.close_if_idle(conn_id);
                            return;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(subscription = %id, attempt, error = %e, "resubscribe attempt failed");
                }
            }
        }
        tracing::error!(subscription = %id, attempts, "giving up on resubscribe");
    }
}

async fn dispatch_events(hub: Weak<SubscriptionHub>, mut events: mpsc::UnboundedReceiver<ConnectionEvent>) {
    while let Some(event) = events.recv().await {
        let Some(hub) = hub.upgrade() else {
            break;
        };
        hub.handle_event(event);
    }
}

#[async_trait]
impl HealthCheck for SubscriptionHub {
    async fn check(&self) -> Result<ComponentHealth, GatewayError> {
        if self.is_shut_down() {
            return Ok(ComponentHealth::unhealthy("subscription hub is shut down"));
        }
        let (total, active, connections) = {
            let state = self.state();
            let active = state.subscriptions.values().filter(|e| e.record.active).count();
            (state.subscriptions.len(), active, state.connections.len())
        };
        let details = json!({
            "subscriptions": total,
            "active": active,
            "connections": connections,
        });
        Ok(if active < total {
            ComponentHealth::degraded(format!("{} subscriptions awaiting resubscribe", total - active))
                .with_details(details)
        } else {
            ComponentHealth::healthy().with_details(details)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_filter_params() {
        let kind = SubscriptionKind::Logs {
            address: Some("0xabc".into()),
            topics: vec![json!("0xddf2")],
        };
        assert_eq!(
            kind.params(),
            vec![json!("logs"), json!({"address": "0xabc", "topics": ["0xddf2"]})]
        );
        assert_eq!(SubscriptionKind::NewHeads.params(), vec![json!("newHeads")]);
    }

    #[test]
    fn kind_serde_is_tagged() {
        let kind: SubscriptionKind = serde_json::from_value(json!({"type": "logs", "address": "0x1"})).unwrap();
        assert_eq!(
            kind,
            SubscriptionKind::Logs {
                address: Some("0x1".into()),
                topics: vec![]
            }
        );
        let heads: SubscriptionKind = serde_json::from_value(json!({"type": "newHeads"})).unwrap();
        assert_eq!(heads, SubscriptionKind::NewHeads);
    }
}
