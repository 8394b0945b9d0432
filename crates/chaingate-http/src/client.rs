//! HTTP JSON-RPC client backed by `reqwest`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use chaingate_core::endpoint::Endpoint;
use chaingate_core::error::TransportError;
use chaingate_core::request::{JsonRpcRequest, JsonRpcResponse};
use chaingate_core::transport::{RpcTransport, TransportFactory};

/// Configuration for `HttpRpcClient`.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            user_agent: concat!("chaingate/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// One upstream HTTP JSON-RPC endpoint.
pub struct HttpRpcClient {
    url: String,
    /// Identifier used in errors; never contains the API key.
    label: String,
    http: reqwest::Client,
    request_timeout: Duration,
}

impl HttpRpcClient {
    /// Create a client for the given JSON-RPC endpoint URL.
    pub fn new(url: impl Into<String>, config: HttpClientConfig) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent)
            .build()
            .map_err(|e| TransportError::Other(format!("failed to build HTTP client: {e}")))?;
        let url = url.into();
        Ok(Self {
            label: url.clone(),
            url,
            http,
            request_timeout: config.request_timeout,
        })
    }

    /// Create with default configuration.
    pub fn default_for(url: impl Into<String>) -> Result<Self, TransportError> {
        Self::new(url, HttpClientConfig::default())
    }

    fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    fn map_reqwest(&self, e: reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout {
                ms: self.request_timeout.as_millis() as u64,
            }
        } else if e.is_decode() {
            TransportError::Deserialization(e.to_string())
        } else {
            TransportError::Http(e.without_url().to_string())
        }
    }
}

#[async_trait]
impl RpcTransport for HttpRpcClient {
    async fn send(&self, req: JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        tracing::trace!(endpoint = %self.label, method = %req.method, id = %req.id, "sending request");
        let resp = self
            .http
            .post(&self.url)
            .json(&req)
            .send()
            .await
            .map_err(|e| self.map_reqwest(e))?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(TransportError::RateLimited {
                provider: self.label.clone(),
            });
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Http(format!(
                "HTTP {}: {}",
                status.as_u16(),
                body.chars().take(200).collect::<String>()
            )));
        }

        resp.json::<JsonRpcResponse>()
            .await
            .map_err(|e| self.map_reqwest(e))
    }

    fn url(&self) -> &str {
        &self.label
    }
}

/// Builds an [`HttpRpcClient`] per endpoint, applying the endpoint's timeout.
#[derive(Debug, Clone, Default)]
pub struct HttpTransportFactory {
    config: HttpClientConfig,
}

impl HttpTransportFactory {
    pub fn new(config: HttpClientConfig) -> Self {
        Self { config }
    }
}

impl TransportFactory for HttpTransportFactory {
    fn create(&self, endpoint: &Endpoint) -> Result<Arc<dyn RpcTransport>, TransportError> {
        let url = endpoint.resolved_http_url().ok_or_else(|| {
            TransportError::Other(format!("endpoint '{}' has no HTTP URL", endpoint.id))
        })?;
        let config = HttpClientConfig {
            request_timeout: endpoint.timeout(),
            ..self.config.clone()
        };
        let client = HttpRpcClient::new(url, config)?.with_label(format!("{}:{}", endpoint.kind, endpoint.id));
        Ok(Arc::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chaingate_core::endpoint::ProviderKind;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one HTTP response with the given status line and body.
    async fn one_shot_server(status: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = sock.read(&mut buf).await;
            let resp = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            sock.write_all(resp.as_bytes()).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn successful_call_parses_response() {
        let url = one_shot_server("200 OK", r#"{"jsonrpc":"2.0","id":1,"result":"0x10"}"#).await;
        let client = HttpRpcClient::default_for(url).unwrap();
        let resp = client
            .send(JsonRpcRequest::new(1, "eth_blockNumber", vec![]))
            .await
            .unwrap();
        assert_eq!(resp.result, Some(serde_json::json!("0x10")));
    }

    #[tokio::test]
    async fn node_error_is_not_a_transport_error() {
        let url = one_shot_server(
            "200 OK",
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"method not found"}}"#,
        )
        .await;
        let client = HttpRpcClient::default_for(url).unwrap();
        let resp = client.send(JsonRpcRequest::new(1, "nope", vec![])).await.unwrap();
        assert_eq!(resp.error.map(|e| e.code), Some(-32601));
    }

    #[tokio::test]
    async fn too_many_requests_maps_to_rate_limited() {
        let url = one_shot_server("429 Too Many Requests", "{}").await;
        let client = HttpRpcClient::default_for(url).unwrap();
        let err = client
            .send(JsonRpcRequest::new(1, "eth_blockNumber", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::RateLimited { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn server_error_maps_to_http() {
        let url = one_shot_server("502 Bad Gateway", "upstream down").await;
        let client = HttpRpcClient::default_for(url).unwrap();
        let err = client
            .send(JsonRpcRequest::new(1, "eth_blockNumber", vec![]))
            .await
            .unwrap_err();
        match err {
            TransportError::Http(msg) => assert!(msg.contains("502")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn factory_labels_without_api_key() {
        let mut ep = Endpoint::new("main", 1, "https://eth-mainnet.example/v2/{api_key}");
        ep.kind = ProviderKind::Alchemy;
        ep.api_key = Some("secret".into());
        let transport = HttpTransportFactory::default().create(&ep).unwrap();
        assert_eq!(transport.url(), "alchemy:main");
    }

    #[test]
    fn factory_rejects_endpoint_without_url() {
        let ep = Endpoint::new("empty", 1, "");
        assert!(HttpTransportFactory::default().create(&ep).is_err());
    }
}
