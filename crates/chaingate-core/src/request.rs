//! JSON-RPC 2.0 wire types shared by every transport and by the gateway envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC request ID: string, number, or null.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    Number(u64),
    String(String),
    Null,
}

impl RpcId {
    pub fn number(n: u64) -> Self {
        Self::Number(n)
    }

    /// Numeric value of the id, if it has one.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl std::fmt::Display for RpcId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
            Self::Null => write!(f, "null"),
        }
    }
}

/// A single JSON-RPC parameter value.
pub type RpcParam = Value;

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: Vec<RpcParam>,
    pub id: RpcId,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC 2.0 request.
    pub fn new(id: u64, method: impl Into<String>, params: Vec<RpcParam>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params,
            id: RpcId::Number(id),
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

/// A JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: RpcId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Successful envelope carrying `result`.
    pub fn success(id: RpcId, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Error envelope.
    pub fn failure(id: RpcId, code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data,
            }),
        }
    }

    /// Returns `true` if this is a successful response (no error object).
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Unwrap the result value or return an error.
    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        if let Some(err) = self.error {
            Err(err)
        } else {
            Ok(self.result.unwrap_or(Value::Null))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serialization() {
        let req = JsonRpcRequest::new(7, "eth_getTransactionCount", vec![
            Value::String("0xabc".into()),
            Value::String("pending".into()),
        ]);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"method\":\"eth_getTransactionCount\""));
        assert!(json.contains("\"id\":7"));
    }

    #[test]
    fn response_into_result_ok() {
        let resp = JsonRpcResponse::success(RpcId::Number(1), Value::String("0x12345".into()));
        assert!(resp.is_ok());
        assert_eq!(resp.into_result().unwrap(), Value::String("0x12345".into()));
    }

    #[test]
    fn failure_envelope_omits_result() {
        let resp = JsonRpcResponse::failure(RpcId::String("a".into()), -32000, "boom", None);
        let json = serde_json::to_value(&resp).unwrap();
        assert!(json.get("result").is_none());
        assert_eq!(json["error"]["code"], -32000);
        assert_eq!(resp.into_result().unwrap_err().message, "boom");
    }

    #[test]
    fn null_result_is_still_success() {
        let raw = r#"{"jsonrpc":"2.0","id":3,"result":null}"#;
        let resp: JsonRpcResponse = serde_json::from_str(raw).unwrap();
        assert!(resp.is_ok());
        assert_eq!(resp.into_result().unwrap(), Value::Null);
    }
}
