//! JSON-RPC 2.0 transport

use crate::error::RpcError;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Sends one JSON-RPC request to one endpoint.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn send(&self, url: &str, method: &str, params: &Value) -> Result<Value, RpcError>;
}

/// JSON-RPC over HTTP POST
pub struct HttpRpcTransport {
    client: reqwest::Client,
    next_id: AtomicU64,
}

impl HttpRpcTransport {
    pub fn new(timeout: Duration) -> Result<Self, RpcError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RpcError::Transport {
                url: String::new(),
                message: format!("failed to build http client: {}", e),
            })?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            next_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl RpcTransport for HttpRpcTransport {
    async fn send(&self, url: &str, method: &str, params: &Value) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let transport_err = |e: reqwest::Error| RpcError::Transport {
            url: url.to_string(),
            message: e.to_string(),
        };

        let resp = self
            .client
            .post(url)
            .json(&payload)
            .send()
            .await
            .map_err(transport_err)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(RpcError::Transport {
                url: url.to_string(),
                message: format!("HTTP {}", status),
            });
        }

        let body: Value = resp.json().await.map_err(transport_err)?;
        parse_response(body)
    }
}

/// Extract `result` from a JSON-RPC response body
pub fn parse_response(mut body: Value) -> Result<Value, RpcError> {
    if let Some(err) = body.get("error") {
        if !err.is_null() {
            return Err(RpcError::Response {
                code: err.get("code").and_then(Value::as_i64).unwrap_or(-32603),
                message: err
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            });
        }
    }

    match body.get_mut("result") {
        Some(result) => Ok(result.take()),
        None => Err(RpcError::InvalidResponse(
            "response has neither result nor error".into(),
        )),
    }
}

/// Decode a hex quantity (`"0x1b4"`) into u64
pub fn parse_hex_u64(value: &Value) -> Result<u64, RpcError> {
    let s = hex_str(value)?;
    u64::from_str_radix(s, 16)
        .map_err(|e| RpcError::InvalidResponse(format!("bad hex quantity {:?}: {}", value, e)))
}

/// Decode a hex quantity into u128 (wei amounts)
pub fn parse_hex_u128(value: &Value) -> Result<u128, RpcError> {
    let s = hex_str(value)?;
    u128::from_str_radix(s, 16)
        .map_err(|e| RpcError::InvalidResponse(format!("bad hex quantity {:?}: {}", value, e)))
}

fn hex_str(value: &Value) -> Result<&str, RpcError> {
    let s = value
        .as_str()
        .ok_or_else(|| RpcError::InvalidResponse(format!("expected hex string, got {}", value)))?;
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    if digits.is_empty() {
        Ok("0")
    } else {
        Ok(digits)
    }
}

/// Encode a wei amount as a hex quantity
pub fn to_hex_quantity(value: u128) -> String {
    format!("0x{:x}", value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_response_result() {
        let body = json!({"jsonrpc": "2.0", "id": 1, "result": "0x10"});
        assert_eq!(parse_response(body).unwrap(), json!("0x10"));
    }

    #[test]
    fn test_parse_response_error_object() {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": { "code": -32000, "message": "upstream failed" }
        });
        assert_eq!(
            parse_response(body).unwrap_err(),
            RpcError::Response {
                code: -32000,
                message: "upstream failed".into()
            }
        );
    }

    #[test]
    fn test_parse_response_missing_result() {
        let body = json!({"jsonrpc": "2.0", "id": 1});
        assert!(matches!(
            parse_response(body),
            Err(RpcError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_hex_quantities() {
        assert_eq!(parse_hex_u64(&json!("0x1b4")).unwrap(), 436);
        assert_eq!(parse_hex_u64(&json!("0x")).unwrap(), 0);
        assert_eq!(
            parse_hex_u128(&json!("0xde0b6b3a7640000")).unwrap(),
            1_000_000_000_000_000_000
        );
        assert!(parse_hex_u64(&json!(12)).is_err());
        assert!(parse_hex_u64(&json!("0xzz")).is_err());
        assert_eq!(to_hex_quantity(500_000_000_000_000_000), "0x6f05b59d3b20000");
    }
}
