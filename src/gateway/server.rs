//! Caller-facing MCP server over newline-delimited JSON-RPC.
//!
//! Each request line is handled on its own task so a slow tool call never
//! blocks `tools/list` or other calls. Responses share one `LineWriter`,
//! which keeps them whole-line even when they finish concurrently.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinSet;

use super::router::Gateway;
use crate::mcp_client::transport::{pump_lines, LineFramer, LineWriter};
use crate::mcp_client::types::{error_codes, JsonRpcMessage, JsonRpcResponse, PROTOCOL_VERSION};
use crate::mcp_client::McpError;

/// Name reported in `serverInfo`.
pub const SERVER_NAME: &str = "mcp-gateway";

/// Label used for the caller side in logs.
const CALLER: &str = "caller";

/// Serve requests from `reader` until EOF, writing responses to `writer`.
///
/// Returns after every in-flight request has been answered.
pub async fn serve<R, W>(gateway: Arc<Gateway>, reader: R, writer: W) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let writer = Arc::new(LineWriter::new(CALLER, Box::new(writer)));
    let mut framer = LineFramer::new(CALLER);
    let mut tasks = JoinSet::new();

    tracing::info!("MCP gateway serving on stdio");

    pump_lines(reader, &mut framer, |frame| {
        while tasks.try_join_next().is_some() {}

        let gateway = Arc::clone(&gateway);
        let writer = Arc::clone(&writer);
        tasks.spawn(async move {
            if let Some(response) = handle_frame(&gateway, frame).await {
                if let Err(e) = writer.send(&response).await {
                    tracing::warn!(error = %e, "failed to write response");
                }
            }
        });
    })
    .await?;

    tracing::debug!(in_flight = tasks.len(), "input closed, draining requests");
    while tasks.join_next().await.is_some() {}
    Ok(())
}

/// Turn one inbound frame into the response to send, if any.
async fn handle_frame(
    gateway: &Gateway,
    frame: Result<serde_json::Value, McpError>,
) -> Option<JsonRpcResponse> {
    let value = match frame {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(error = %e, "unparseable request");
            return Some(JsonRpcResponse::failure(
                serde_json::Value::Null,
                error_codes::PARSE_ERROR,
                "Parse error",
            ));
        }
    };

    let message = match serde_json::from_value::<JsonRpcMessage>(value) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(error = %e, "request is not a JSON-RPC envelope");
            return Some(JsonRpcResponse::failure(
                serde_json::Value::Null,
                error_codes::INVALID_REQUEST,
                "Invalid Request",
            ));
        }
    };

    let Some(method) = message.method.as_deref() else {
        tracing::debug!(id = ?message.id, "ignoring message without a method");
        return None;
    };

    let Some(id) = message.id.clone() else {
        tracing::debug!(method, "received notification");
        return None;
    };

    Some(handle_request(gateway, id, method, message.params).await)
}

async fn handle_request(
    gateway: &Gateway,
    id: serde_json::Value,
    method: &str,
    params: Option<serde_json::Value>,
) -> JsonRpcResponse {
    match method {
        "initialize" => JsonRpcResponse::success(
            id,
            serde_json::json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": {
                    "name": SERVER_NAME,
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        ),
        "ping" => JsonRpcResponse::success(id, serde_json::json!({})),
        "tools/list" => {
            tracing::info!("listing all available tools");
            let tools = gateway.list_tools();
            match serde_json::to_value(&tools) {
                Ok(tools) => JsonRpcResponse::success(id, serde_json::json!({ "tools": tools })),
                Err(e) => JsonRpcResponse::failure(
                    id,
                    error_codes::INTERNAL_ERROR,
                    format!("failed to serialize tools: {e}"),
                ),
            }
        }
        "tools/call" => {
            let params = params.unwrap_or(serde_json::Value::Null);
            let Some(name) = params.get("name").and_then(|n| n.as_str()) else {
                return JsonRpcResponse::failure(
                    id,
                    error_codes::INVALID_PARAMS,
                    "tools/call requires a string 'name'",
                );
            };
            let arguments = match params.get("arguments") {
                Some(args) if !args.is_null() => args.clone(),
                _ => serde_json::json!({}),
            };
            tracing::info!(tool = name, "tool call received");
            let result = gateway.call_tool(name, arguments).await;
            JsonRpcResponse::success(id, result)
        }
        other => {
            tracing::debug!(method = other, "unknown method");
            JsonRpcResponse::failure(
                id,
                error_codes::METHOD_NOT_FOUND,
                format!("Method not found: {other}"),
            )
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
