//! JSON-RPC 2.0 wire types for the stdio worker protocol.
//!
//! One request per line on the worker's stdin, one response per line on its
//! stdout.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use plexus_core::error::PlexusError;

pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl RpcRequest {
    pub fn new(id: u64, method: &str, params: Map<String, Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Value::from(id),
            method: method.to_string(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }

    /// Failure response for an error raised while serving a request.
    pub fn from_error(id: Value, err: &PlexusError) -> Self {
        Self::failure(id, error_code(err), err.to_string())
    }
}

/// JSON-RPC code for an error raised while executing a request.
pub fn error_code(err: &PlexusError) -> i64 {
    match err {
        PlexusError::ToolNotFound { .. } => METHOD_NOT_FOUND,
        _ => INTERNAL_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let mut params = Map::new();
        params.insert("path".into(), json!("a.txt"));
        let req = RpcRequest::new(7, "file.read", params);
        let wire = serde_json::to_value(&req).unwrap();
        assert_eq!(
            wire,
            json!({"jsonrpc": "2.0", "id": 7, "method": "file.read", "params": {"path": "a.txt"}})
        );
    }

    #[test]
    fn test_response_omits_absent_members() {
        let ok = serde_json::to_value(RpcResponse::success(json!(1), json!({"x": 1}))).unwrap();
        assert!(ok.get("error").is_none());
        let err = serde_json::to_value(RpcResponse::failure(Value::Null, PARSE_ERROR, "bad")).unwrap();
        assert!(err.get("result").is_none());
        assert_eq!(err["error"]["code"], json!(-32700));
        assert_eq!(err["id"], Value::Null);
    }

    #[test]
    fn test_error_codes() {
        let not_found = PlexusError::ToolNotFound {
            server: "srv_fs".into(),
            tool: "file.nope".into(),
        };
        assert_eq!(error_code(&not_found), METHOD_NOT_FOUND);
        let failed = PlexusError::ToolExecution {
            tool: "file.read".into(),
            message: "denied".into(),
        };
        assert_eq!(error_code(&failed), INTERNAL_ERROR);
    }
}
