//! Subscription hub against local WebSocket nodes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use chaingate_core::endpoint::{ChainSpec, Endpoint};
use chaingate_core::error::TransportError;
use chaingate_core::health::{HealthCheck, HealthStatus};
use chaingate_core::policy::RetryConfig;
use chaingate_core::pool::{ProviderPool, ProviderPoolConfig, SequenceRandom};
use chaingate_core::request::{JsonRpcRequest, JsonRpcResponse};
use chaingate_core::transport::{RpcTransport, TransportFactory};
use chaingate_ws::{HubConfig, SubscriptionConfig, SubscriptionHub, SubscriptionKind};

struct NoHttp;

#[async_trait]
impl RpcTransport for NoHttp {
    async fn send(&self, _req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        Err(TransportError::Http("no http in this test".into()))
    }
    fn url(&self) -> &str {
        "none"
    }
}

struct NoHttpFactory;

impl TransportFactory for NoHttpFactory {
    fn create(&self, _endpoint: &Endpoint) -> Result<Arc<dyn RpcTransport>, TransportError> {
        Ok(Arc::new(NoHttp))
    }
}

/// Counters exposed by a fake node.
#[derive(Default)]
struct NodeStats {
    connections: AtomicUsize,
    subscribes: AtomicUsize,
    unsubscribes: AtomicUsize,
}

/// Start a fake node. Each `eth_subscribe` is acknowledged and followed by
/// one notification. With `drop_first`, the first connection is closed right
/// after its first notification.
async fn spawn_node(name: &'static str, drop_first: bool) -> (String, Arc<NodeStats>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let stats = Arc::new(NodeStats::default());
    let node_stats = stats.clone();

    tokio::spawn(async move {
        loop {
            let Ok((tcp, _)) = listener.accept().await else {
                return;
            };
            let stats = node_stats.clone();
            tokio::spawn(async move {
                let conn_no = stats.connections.fetch_add(1, Ordering::SeqCst);
                let Ok(mut ws) = tokio_tungstenite::accept_async(tcp).await else {
                    return;
                };
                while let Some(Ok(msg)) = ws.next().await {
                    let Message::Text(text) = msg else {
                        continue;
                    };
                    let req: Value = serde_json::from_str(&text).unwrap();
                    let id = req["id"].clone();
                    match req["method"].as_str() {
                        Some("eth_subscribe") => {
                            let n = stats.subscribes.fetch_add(1, Ordering::SeqCst);
                            let sub = format!("{name}-sub-{n}");
                            let ack = json!({"jsonrpc": "2.0", "id": id, "result": sub});
                            ws.send(Message::Text(ack.to_string())).await.unwrap();
                            let push = json!({
                                "jsonrpc": "2.0",
                                "method": "eth_subscription",
                                "params": {"subscription": sub, "result": {"node": name, "number": "0x1"}}
                            });
                            ws.send(Message::Text(push.to_string())).await.unwrap();
                            if drop_first && conn_no == 0 {
                                let _ = ws.close(None).await;
                                return;
                            }
                        }
                        Some("eth_unsubscribe") => {
                            stats.unsubscribes.fetch_add(1, Ordering::SeqCst);
                            let ack = json!({"jsonrpc": "2.0", "id": id, "result": true});
                            ws.send(Message::Text(ack.to_string())).await.unwrap();
                        }
                        _ => {}
                    }
                }
            });
        }
    });

    (format!("ws://{addr}"), stats)
}

fn pool(endpoints: Vec<Endpoint>) -> Arc<ProviderPool> {
    let pool = ProviderPool::new(ProviderPoolConfig::default(), Arc::new(NoHttpFactory))
        .with_random_source(Arc::new(SequenceRandom::new(vec![0.0])));
    pool.register_chain(ChainSpec::known(1));
    for ep in endpoints {
        pool.add_endpoint(ep).unwrap();
    }
    Arc::new(pool)
}

fn hub_config() -> HubConfig {
    HubConfig {
        connect_timeout: Duration::from_secs(2),
        request_timeout: Duration::from_secs(2),
        resubscribe: RetryConfig {
            max_retries: 5,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            multiplier: 2.0,
            jitter_fraction: 0.0,
        },
        endpoint_attempts: 2,
    }
}

fn new_heads() -> SubscriptionConfig {
    SubscriptionConfig {
        chain_id: 1,
        kind: SubscriptionKind::NewHeads,
    }
}

#[tokio::test]
async fn notifications_are_rekeyed_to_gateway_ids() {
    let (url, _stats) = spawn_node("a", false).await;
    let hub = SubscriptionHub::new(
        pool(vec![Endpoint::new("a", 1, "http://unused").with_ws_url(url)]),
        hub_config(),
    );
    let mut updates = hub.updates();

    let record = hub.subscribe(new_heads()).await.unwrap();
    assert!(record.active);
    assert_eq!(record.endpoint_id.as_deref(), Some("a"));

    let data = tokio::time::timeout(Duration::from_secs(2), updates.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(data.subscription_id, record.id);
    assert_eq!(data.chain_id, 1);
    assert_eq!(data.payload["number"], "0x1");
}

#[tokio::test]
async fn subscriptions_share_one_connection() {
    let (url, stats) = spawn_node("a", false).await;
    let hub = SubscriptionHub::new(
        pool(vec![Endpoint::new("a", 1, "http://unused").with_ws_url(url)]),
        hub_config(),
    );
    let first = hub.subscribe(new_heads()).await.unwrap();
    let second = hub
        .subscribe(SubscriptionConfig {
            chain_id: 1,
            kind: SubscriptionKind::Logs {
                address: Some("0x00000000000000000000000000000000000000aa".into()),
                topics: vec![],
            },
        })
        .await
        .unwrap();

    assert_ne!(first.id, second.id);
    assert_eq!(hub.connection_count(), 1);
    assert_eq!(stats.connections.load(Ordering::SeqCst), 1);
    assert_eq!(hub.list().len(), 2);
}

#[tokio::test]
async fn concurrent_subscribers_share_one_connection() {
    let (url, stats) = spawn_node("a", false).await;
    let hub = SubscriptionHub::new(
        pool(vec![Endpoint::new("a", 1, "http://unused").with_ws_url(url)]),
        hub_config(),
    );

    let (a, b, c) = tokio::join!(
        hub.subscribe(new_heads()),
        hub.subscribe(new_heads()),
        hub.subscribe(new_heads()),
    );
    let ids = [a.unwrap().id, b.unwrap().id, c.unwrap().id];
    assert!(ids[0] != ids[1] && ids[1] != ids[2] && ids[0] != ids[2]);

    assert_eq!(hub.connection_count(), 1);
    assert_eq!(stats.connections.load(Ordering::SeqCst), 1);
    assert_eq!(stats.subscribes.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn unsubscribe_notifies_upstream_and_closes_idle_connection() {
    let (url, stats) = spawn_node("a", false).await;
    let hub = SubscriptionHub::new(
        pool(vec![Endpoint::new("a", 1, "http://unused").with_ws_url(url)]),
        hub_config(),
    );
    let record = hub.subscribe(new_heads()).await.unwrap();

    assert!(hub.unsubscribe(&record.id).await.unwrap());
    assert_eq!(stats.unsubscribes.load(Ordering::SeqCst), 1);
    assert!(hub.get(&record.id).is_none());
    assert_eq!(hub.connection_count(), 0);

    assert!(!hub.unsubscribe(&record.id).await.unwrap());
}

#[tokio::test]
async fn dropped_connection_resubscribes_on_another_endpoint() {
    let (url_a, _) = spawn_node("a", true).await;
    let (url_b, stats_b) = spawn_node("b", false).await;
    let hub = SubscriptionHub::new(
        pool(vec![
            Endpoint::new("a", 1, "http://unused").with_priority(1).with_ws_url(url_a),
            Endpoint::new("b", 1, "http://unused").with_priority(2).with_ws_url(url_b),
        ]),
        hub_config(),
    );
    let mut updates = hub.updates();

    let record = hub.subscribe(new_heads()).await.unwrap();
    assert_eq!(record.endpoint_id.as_deref(), Some("a"));

    let mut resubscribed = None;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if let Some(r) = hub.get(&record.id) {
            if r.active && r.endpoint_id.as_deref() == Some("b") {
                resubscribed = Some(r);
                break;
            }
        }
    }
    let resubscribed = resubscribed.expect("subscription should move to endpoint b");
    assert_eq!(resubscribed.id, record.id);
    assert_eq!(stats_b.subscribes.load(Ordering::SeqCst), 1);

    // The notification from the new endpoint arrives under the same id.
    let from_b = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let data = updates.recv().await.unwrap();
            if data.payload["node"] == "b" {
                return data;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(from_b.subscription_id, record.id);
}

#[tokio::test]
async fn shutdown_closes_everything() {
    let (url, _) = spawn_node("a", false).await;
    let hub = SubscriptionHub::new(
        pool(vec![Endpoint::new("a", 1, "http://unused").with_ws_url(url)]),
        hub_config(),
    );
    hub.subscribe(new_heads()).await.unwrap();
    assert_eq!(hub.check().await.unwrap().status, HealthStatus::Healthy);

    hub.shutdown();
    assert_eq!(hub.connection_count(), 0);
    assert!(hub.list().iter().all(|r| !r.active));
    assert!(hub.subscribe(new_heads()).await.is_err());
    assert_eq!(hub.check().await.unwrap().status, HealthStatus::Unhealthy);
}

#[tokio::test]
async fn chain_without_ws_endpoint_fails() {
    let hub = SubscriptionHub::new(pool(vec![Endpoint::new("a", 1, "http://unused")]), hub_config());
    assert!(hub.subscribe(new_heads()).await.is_err());

    let err = hub
        .subscribe(SubscriptionConfig {
            chain_id: 5,
            kind: SubscriptionKind::NewHeads,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, chaingate_core::GatewayError::UnsupportedChain { chain_id: 5 }));
}
