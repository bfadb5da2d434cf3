//! Shared types for the MCP client.
//!
//! JSON-RPC 2.0 message types and MCP protocol structures.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// MCP protocol revision announced during the handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (no id, no response expected).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// Any inbound JSON-RPC envelope: request, notification, or response.
///
/// Fields are all optional so one shape covers every direction; callers
/// decide what the message is from which fields are present.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonRpcMessage {
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcMessage {
    /// The numeric request id, if the message carries one.
    pub fn numeric_id(&self) -> Option<u64> {
        self.id.as_ref().and_then(|id| id.as_u64())
    }
}

/// Outbound JSON-RPC 2.0 response (success or error).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: serde_json::Value, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: serde_json::Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// MCP tool definition as returned by `tools/list`.
///
/// Fields the gateway does not interpret are kept in `extra` so the
/// definition is re-advertised to callers exactly as the backend sent it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpToolDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(
        default = "default_input_schema",
        rename = "inputSchema",
        alias = "input_schema"
    )]
    pub input_schema: serde_json::Value,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_input_schema() -> serde_json::Value {
    serde_json::json!({"type": "object", "properties": {}})
}

/// `tools/list` response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<McpToolDefinition>,
}

/// MCP initialize response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(default, alias = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: serde_json::Value,
    #[serde(default, alias = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// One backend process: how to launch it and which tool prefix it owns.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    /// Tool-name prefix routed to this backend (defaults to `name`).
    #[serde(default)]
    pub prefix: Option<String>,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment on top of the inherited one.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Per-backend working directory (overrides the gateway's working_dir).
    #[serde(default)]
    pub cwd: Option<String>,
}

impl BackendConfig {
    pub fn new(name: &str, command: &str, args: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            prefix: None,
            command: command.to_string(),
            args,
            env: HashMap::new(),
            cwd: None,
        }
    }

    /// The routing prefix, without the trailing underscore.
    pub fn prefix(&self) -> &str {
        self.prefix.as_deref().unwrap_or(&self.name)
    }

    /// Whether `tool_name` falls under this backend's `{prefix}_` namespace.
    pub fn owns_tool_name(&self, tool_name: &str) -> bool {
        tool_name
            .strip_prefix(self.prefix())
            .is_some_and(|rest| rest.starts_with('_'))
    }
}

// ─── Standard JSON-RPC Error Codes ───────────────────────────────────────────

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i64 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i64 = -32603;
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_rpc_request_serialization() {
        let req = JsonRpcRequest::new(1, "initialize", None);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"id\":1"));
        assert!(json.contains("\"method\":\"initialize\""));
        // params should be omitted when None
        assert!(!json.contains("params"));
    }

    #[test]
    fn test_tools_call_request_shape() {
        let params = serde_json::json!({"name": "ventas_por_dia", "arguments": {"n": 5}});
        let req = JsonRpcRequest::new(42, "tools/call", Some(params));
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": 42,
                "method": "tools/call",
                "params": {"name": "ventas_por_dia", "arguments": {"n": 5}}
            })
        );
    }

    #[test]
    fn test_notification_has_no_id() {
        let n = JsonRpcNotification::new("notifications/initialized", None);
        let value = serde_json::to_value(&n).unwrap();
        assert!(value.get("id").is_none());
        assert_eq!(value["method"], "notifications/initialized");
    }

    #[test]
    fn test_message_error_response() {
        let json = r#"{
            "jsonrpc": "2.0",
            "id": 2,
            "error": {"code": -32601, "message": "Method not found"}
        }"#;
        let msg: JsonRpcMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.numeric_id(), Some(2));
        let err = msg.error.unwrap();
        assert_eq!(err.code, error_codes::METHOD_NOT_FOUND);
    }

    #[test]
    fn test_message_error_without_code() {
        let json = r#"{"jsonrpc":"2.0","id":3,"error":{"message":"boom"}}"#;
        let msg: JsonRpcMessage = serde_json::from_str(json).unwrap();
        let err = msg.error.unwrap();
        assert_eq!(err.code, 0);
        assert_eq!(err.message, "boom");
    }

    #[test]
    fn test_message_string_id_is_not_numeric() {
        let msg: JsonRpcMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":"abc","result":{}}"#).unwrap();
        assert_eq!(msg.numeric_id(), None);
    }

    #[test]
    fn test_tool_definition_wire_names_and_extras() {
        let json = r#"{
            "name": "pedidos_crear",
            "description": "Crea un pedido",
            "inputSchema": {"type": "object", "required": ["cliente", "monto"]},
            "annotations": {"destructiveHint": false}
        }"#;
        let tool: McpToolDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(tool.input_schema["required"][0], "cliente");
        assert!(tool.extra.contains_key("annotations"));

        let back = serde_json::to_value(&tool).unwrap();
        assert!(back.get("inputSchema").is_some());
        assert_eq!(back["annotations"]["destructiveHint"], false);
    }

    #[test]
    fn test_tool_definition_defaults() {
        let tool: McpToolDefinition = serde_json::from_str(r#"{"name": "x_op"}"#).unwrap();
        assert_eq!(tool.description, None);
        assert_eq!(tool.input_schema["type"], "object");

        // No description in, no description out
        let back = serde_json::to_value(&tool).unwrap();
        assert!(back.get("description").is_none());
    }

    #[test]
    fn test_backend_prefix_ownership() {
        let mut cfg = BackendConfig::new("ventas", "tsx", vec![]);
        assert_eq!(cfg.prefix(), "ventas");
        assert!(cfg.owns_tool_name("ventas_por_dia"));
        assert!(!cfg.owns_tool_name("ventasx_por_dia"));
        assert!(!cfg.owns_tool_name("ventas"));
        assert!(!cfg.owns_tool_name("pedidos_crear"));

        cfg.prefix = Some("sales".into());
        assert!(cfg.owns_tool_name("sales_total"));
        assert!(!cfg.owns_tool_name("ventas_por_dia"));
    }

    #[test]
    fn test_response_failure_serialization() {
        let resp = JsonRpcResponse::failure(serde_json::Value::Null, error_codes::PARSE_ERROR, "bad");
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["id"], serde_json::Value::Null);
        assert_eq!(value["error"]["code"], -32700);
        assert!(value.get("result").is_none());
    }
}
