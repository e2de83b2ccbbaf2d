//! Phasegate RPC Interface
//!
//! Model Context Protocol over JSON-RPC 2.0. Agents send one JSON message per
//! line on stdin and read one response per line on stdout.
//!
//! # Methods
//!
//! - `initialize`: protocol version, capabilities, server info
//! - `ping`
//! - `tools/list`: tool definitions with input schemas
//! - `tools/call`: run a tool; the result is JSON text inside `content`
//!
//! Notifications (messages without an `id`) never get a response.

use crate::core::tools::ToolRegistry;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use tracing::{debug, warn};

pub const JSONRPC_VERSION: &str = "2.0";
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";
pub const SERVER_NAME: &str = "agent-os-rag";

/// Standard JSON-RPC error codes.
pub mod error_codes {
    /// Invalid JSON.
    pub const PARSE_ERROR: i64 = -32700;
    /// Not a valid request object.
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
}

/// JSON-RPC request or notification
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    /// Absent for notifications
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<JsonValue>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<JsonValue>,
}

impl RpcRequest {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// JSON-RPC response envelope
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

/// JSON-RPC error details
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
}

#[derive(Debug, Clone, Deserialize)]
struct ToolCallParams {
    name: String,
    #[serde(default)]
    arguments: JsonValue,
}

impl RpcResponse {
    pub fn success(id: JsonValue, result: JsonValue) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: JsonValue, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

pub fn initialize_result() -> JsonValue {
    json!({
        "protocolVersion": MCP_PROTOCOL_VERSION,
        "capabilities": {
            "tools": {"listChanged": false}
        },
        "serverInfo": {
            "name": SERVER_NAME,
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

/// Parses one line and dispatches it. `None` means nothing should be written.
pub fn handle_line(line: &str, tools: &mut ToolRegistry) -> Option<RpcResponse> {
    let raw: JsonValue = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "Unparseable JSON-RPC message");
            return Some(RpcResponse::failure(
                JsonValue::Null,
                error_codes::PARSE_ERROR,
                format!("Parse error: {}", e),
            ));
        }
    };
    let id = raw.get("id").cloned().unwrap_or(JsonValue::Null);
    let request: RpcRequest = match serde_json::from_value(raw) {
        Ok(r) => r,
        Err(e) => {
            return Some(RpcResponse::failure(
                id,
                error_codes::INVALID_REQUEST,
                format!("Invalid request: {}", e),
            ));
        }
    };
    if request.jsonrpc != JSONRPC_VERSION {
        return Some(RpcResponse::failure(
            id,
            error_codes::INVALID_REQUEST,
            "Invalid request: jsonrpc must be \"2.0\"",
        ));
    }
    handle_request(request, tools)
}

pub fn handle_request(request: RpcRequest, tools: &mut ToolRegistry) -> Option<RpcResponse> {
    debug!(method = %request.method, "RPC request");
    if request.is_notification() {
        debug!(method = %request.method, "Notification received");
        return None;
    }
    let id = request.id.unwrap_or(JsonValue::Null);

    let response = match request.method.as_str() {
        "initialize" => RpcResponse::success(id, initialize_result()),
        "ping" => RpcResponse::success(id, json!({})),
        "tools/list" => RpcResponse::success(id, json!({ "tools": tools.list() })),
        "tools/call" => {
            let params = request.params.unwrap_or(JsonValue::Null);
            match serde_json::from_value::<ToolCallParams>(params) {
                Ok(call) => {
                    let result = tools.call(&call.name, &call.arguments);
                    let text = serde_json::to_string_pretty(&result.payload)
                        .unwrap_or_else(|e| json!({ "error": e.to_string() }).to_string());
                    RpcResponse::success(
                        id,
                        json!({
                            "content": [{"type": "text", "text": text}],
                            "isError": result.is_error,
                        }),
                    )
                }
                Err(e) => RpcResponse::failure(
                    id,
                    error_codes::INVALID_PARAMS,
                    format!("Invalid params: {}", e),
                ),
            }
        }
        other => {
            warn!(method = other, "Unknown RPC method");
            RpcResponse::failure(
                id,
                error_codes::METHOD_NOT_FOUND,
                format!("Method not found: {}", other),
            )
        }
    };
    Some(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_envelope_shape() {
        let resp = RpcResponse::failure(json!(7), error_codes::METHOD_NOT_FOUND, "nope");
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["id"], 7);
        assert_eq!(value["error"]["code"], -32601);
        assert!(value.get("result").is_none());
    }

    #[test]
    fn test_notification_detection() {
        let req: RpcRequest =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#).unwrap();
        assert!(req.is_notification());
    }
}
