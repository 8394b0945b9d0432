//! A single upstream WebSocket connection.
//!
//! A background task owns the socket. Callers send requests through a command
//! channel and get responses through per-request oneshots; push
//! notifications and the final close are reported on an event channel.
//! The connection does not reconnect by itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;

use chaingate_core::error::TransportError;
use chaingate_core::request::{JsonRpcRequest, JsonRpcResponse, RpcParam};
use chaingate_core::transport::RpcTransport;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<JsonRpcResponse, TransportError>>>>>;

/// Reported by a connection task to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// An `eth_subscription` push.
    Notification {
        conn_id: u64,
        upstream_id: String,
        payload: Value,
    },
    /// The socket closed or failed. Not sent after [`WsConnection::close`].
    Closed { conn_id: u64, reason: String },
}

/// Command sent from callers to the background WS task.
enum WsCommand {
    Send {
        req: JsonRpcRequest,
        tx: oneshot::Sender<Result<JsonRpcResponse, TransportError>>,
    },
    Close,
}

/// Handle to a live upstream WebSocket.
pub struct WsConnection {
    id: u64,
    label: String,
    cmd_tx: mpsc::UnboundedSender<WsCommand>,
    next_req_id: AtomicU64,
    closed: Arc<AtomicBool>,
}

impl WsConnection {
    /// Connect to `url` and start the background task. `label` identifies the
    /// connection in logs and must not contain credentials.
    pub async fn connect(
        id: u64,
        url: &str,
        label: impl Into<String>,
        connect_timeout: Duration,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Self, TransportError> {
        let label = label.into();
        let (ws_stream, _) = tokio::time::timeout(connect_timeout, tokio_tungstenite::connect_async(url))
            .await
            .map_err(|_| TransportError::Timeout {
                ms: connect_timeout.as_millis() as u64,
            })?
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;
        tracing::info!(conn_id = id, endpoint = %label, "websocket connected");

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        tokio::spawn(ws_task(id, label.clone(), ws_stream, cmd_rx, events, closed.clone()));

        Ok(Self {
            id,
            label,
            cmd_tx,
            next_req_id: AtomicU64::new(1),
            closed,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Send `method` and wait at most `timeout` for the matching response.
    pub async fn request(
        &self,
        method: &str,
        params: Vec<RpcParam>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, TransportError> {
        let req = JsonRpcRequest::new(self.next_req_id.fetch_add(1, Ordering::Relaxed), method, params);
        tokio::time::timeout(timeout, self.send(req))
            .await
            .map_err(|_| TransportError::Timeout {
                ms: timeout.as_millis() as u64,
            })?
    }

    /// Close the socket immediately. Pending requests fail.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.cmd_tx.send(WsCommand::Close);
        }
    }
}

impl Drop for WsConnection {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl RpcTransport for WsConnection {
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        if self.is_closed() {
            return Err(TransportError::WebSocket("connection closed".into()));
        }
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(WsCommand::Send { req, tx })
            .map_err(|_| TransportError::WebSocket("WS task closed".into()))?;
        rx.await
            .map_err(|_| TransportError::WebSocket("WS response dropped".into()))?
    }

    fn url(&self) -> &str {
        &self.label
    }
}

/// Background task that owns the WebSocket connection.
async fn ws_task<S>(
    conn_id: u64,
    label: String,
    ws_stream: tokio_tungstenite::WebSocketStream<S>,
    mut cmd_rx: mpsc::UnboundedReceiver<WsCommand>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    closed: Arc<AtomicBool>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (mut sink, mut stream) = ws_stream.split();

    let reason = loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    None | Some(WsCommand::Close) => {
                        let _ = sink.send(Message::Close(None)).await;
                        fail_pending(&pending, "connection closed");
                        tracing::debug!(conn_id, endpoint = %label, "websocket closed by owner");
                        return;
                    }
                    Some(WsCommand::Send { req, tx }) => {
                        let Some(id) = req.id.as_u64() else {
                            let _ = tx.send(Err(TransportError::Other("request id must be numeric".into())));
                            continue;
                        };
                        let msg = match serde_json::to_string(&req) {
                            Ok(m) => m,
                            Err(e) => {
                                let _ = tx.send(Err(e.into()));
                                continue;
                            }
                        };
                        pending.lock().unwrap_or_else(PoisonError::into_inner).insert(id, tx);
                        if let Err(e) = sink.send(Message::Text(msg)).await {
                            break format!("send failed: {e}");
                        }
                    }
                }
            }
            msg = stream.next() => {
                match msg {
                    None => break "stream ended".to_string(),
                    Some(Err(e)) => break format!("receive error: {e}"),
                    Some(Ok(Message::Text(text))) => handle_message(conn_id, &text, &pending, &events),
                    Some(Ok(Message::Close(_))) => break "closed by peer".to_string(),
                    _ => {}
                }
            }
        }
    };

    closed.store(true, Ordering::Release);
    fail_pending(&pending, &reason);
    tracing::warn!(conn_id, endpoint = %label, %reason, "websocket disconnected");
    let _ = events.send(ConnectionEvent::Closed { conn_id, reason });
}

fn fail_pending(pending: &PendingMap, reason: &str) {
    let drained: Vec<_> = pending
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .drain()
        .collect();
    for (_, tx) in drained {
        let _ = tx.send(Err(TransportError::WebSocket(reason.to_string())));
    }
}

fn handle_message(
    conn_id: u64,
    text: &str,
    pending: &PendingMap,
    events: &mpsc::UnboundedSender<ConnectionEvent>,
) {
    let Ok(val) = serde_json::from_str::<Value>(text) else {
        tracing::debug!(conn_id, "failed to parse WS message as JSON");
        return;
    };

    if val.get("method").and_then(|m| m.as_str()) == Some("eth_subscription") {
        let params = &val["params"];
        if let Some(upstream_id) = params["subscription"].as_str() {
            let _ = events.send(ConnectionEvent::Notification {
                conn_id,
                upstream_id: upstream_id.to_string(),
                payload: params["result"].clone(),
            });
        }
        return;
    }

    match serde_json::from_value::<JsonRpcResponse>(val) {
        Ok(resp) => {
            let Some(id) = resp.id.as_u64() else {
                return;
            };
            if let Some(tx) = pending.lock().unwrap_or_else(PoisonError::into_inner).remove(&id) {
                let _ = tx.send(Ok(resp));
            }
        }
        Err(e) => tracing::debug!(conn_id, error = %e, "unrecognised WS message"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_with(id: u64) -> (PendingMap, oneshot::Receiver<Result<JsonRpcResponse, TransportError>>) {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (tx, rx) = oneshot::channel();
        pending.lock().unwrap().insert(id, tx);
        (pending, rx)
    }

    #[test]
    fn response_resolves_pending_request() {
        let (pending, mut rx) = pending_with(7);
        let (events, _events_rx) = mpsc::unbounded_channel();
        handle_message(1, r#"{"jsonrpc":"2.0","id":7,"result":"0xabc"}"#, &pending, &events);
        let resp = rx.try_recv().unwrap().unwrap();
        assert_eq!(resp.result, Some(Value::String("0xabc".into())));
        assert!(pending.lock().unwrap().is_empty());
    }

    #[test]
    fn notification_becomes_event() {
        let (pending, _rx) = pending_with(1);
        let (events, mut events_rx) = mpsc::unbounded_channel();
        handle_message(
            3,
            r#"{"jsonrpc":"2.0","method":"eth_subscription","params":{"subscription":"0xs1","result":{"number":"0x5"}}}"#,
            &pending,
            &events,
        );
        match events_rx.try_recv().unwrap() {
            ConnectionEvent::Notification { conn_id, upstream_id, payload } => {
                assert_eq!(conn_id, 3);
                assert_eq!(upstream_id, "0xs1");
                assert_eq!(payload["number"], "0x5");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(pending.lock().unwrap().len(), 1);
    }

    #[test]
    fn fail_pending_drains_everything() {
        let (pending, mut rx) = pending_with(2);
        fail_pending(&pending, "gone");
        assert!(matches!(rx.try_recv().unwrap(), Err(TransportError::WebSocket(_))));
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        let (events, _rx) = mpsc::unbounded_channel();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let result = WsConnection::connect(
            1,
            &format!("ws://{addr}"),
            "test",
            Duration::from_secs(2),
            events,
        )
        .await;
        assert!(result.is_err());
    }
}
