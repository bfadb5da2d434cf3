//! Demo MCP backend
//!
//! A small stdio backend for local trials and integration tests. It speaks
//! the same line-delimited JSON-RPC dialect as real backends and exposes
//! two tools under its prefix:
//! - `{prefix}_echo` returns its arguments as text
//! - `{prefix}_sum` adds the numeric arguments `a` and `b`
//!
//! Fault flags make it misbehave on purpose (slow, silent, crashing).
//!
//! # Usage
//!
//! ```bash
//! ./demo-backend --prefix ventas --delay-ms 200
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mcp_gateway::gateway::error_result;
use mcp_gateway::mcp_client::transport::{pump_lines, LineFramer, LineWriter};
use mcp_gateway::mcp_client::types::{
    error_codes, JsonRpcMessage, JsonRpcResponse, PROTOCOL_VERSION,
};

/// Exit status used when `--exit-after` fires.
const CRASH_EXIT_CODE: i32 = 3;

#[derive(Parser, Debug)]
#[command(name = "demo-backend")]
#[command(about = "Demo MCP backend for exercising the gateway")]
struct Args {
    /// Tool-name prefix (tools are `{prefix}_echo` and `{prefix}_sum`)
    #[arg(long, default_value = "demo")]
    prefix: String,

    /// Delay before answering each tool call
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,

    /// Accept tool calls but never answer them
    #[arg(long)]
    never_reply: bool,

    /// Exit without replying when the N-th tool call arrives
    #[arg(long)]
    exit_after: Option<u32>,

    /// Also advertise a tool outside the prefix
    #[arg(long)]
    off_prefix_tool: bool,

    /// Answer `initialize` with an error
    #[arg(long)]
    fail_init: bool,
}

struct Backend {
    args: Args,
    calls: AtomicU32,
    out: LineWriter,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    info!(prefix = %args.prefix, "demo backend starting");

    let backend = Arc::new(Backend {
        args,
        calls: AtomicU32::new(0),
        out: LineWriter::new("demo-backend", Box::new(tokio::io::stdout())),
    });

    let mut framer = LineFramer::new("demo-backend");
    pump_lines(tokio::io::stdin(), &mut framer, |frame| {
        let value = match frame {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "skipping malformed line");
                return;
            }
        };
        let Ok(message) = serde_json::from_value::<JsonRpcMessage>(value) else {
            warn!("skipping message that is not JSON-RPC");
            return;
        };
        let (Some(method), Some(id)) = (message.method, message.id) else {
            // Notifications need no answer
            return;
        };

        let backend = Arc::clone(&backend);
        tokio::spawn(async move {
            if let Some(response) = backend.handle(id, &method, message.params).await {
                if let Err(e) = backend.out.send(&response).await {
                    warn!(error = %e, "failed to write response");
                }
            }
        });
    })
    .await?;

    info!("stdin closed, exiting");
    Ok(())
}

impl Backend {
    async fn handle(
        &self,
        id: serde_json::Value,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Option<JsonRpcResponse> {
        let response = match method {
            "initialize" if self.args.fail_init => JsonRpcResponse::failure(
                id,
                error_codes::INTERNAL_ERROR,
                "demo backend refuses to initialize",
            ),
            "initialize" => JsonRpcResponse::success(
                id,
                serde_json::json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": "demo-backend", "version": env!("CARGO_PKG_VERSION") },
                }),
            ),
            "ping" => JsonRpcResponse::success(id, serde_json::json!({})),
            "tools/list" => JsonRpcResponse::success(id, serde_json::json!({ "tools": self.tools() })),
            "tools/call" => {
                let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                if self.args.exit_after.is_some_and(|limit| call >= limit) {
                    warn!(call, "exiting on purpose");
                    std::process::exit(CRASH_EXIT_CODE);
                }
                if self.args.never_reply {
                    info!(call, "holding tool call without replying");
                    return None;
                }
                if self.args.delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(self.args.delay_ms)).await;
                }
                let params = params.unwrap_or(serde_json::Value::Null);
                let name = params.get("name").and_then(|n| n.as_str()).unwrap_or_default();
                let arguments = params
                    .get("arguments")
                    .cloned()
                    .unwrap_or_else(|| serde_json::json!({}));
                JsonRpcResponse::success(id, self.call_tool(name, &arguments))
            }
            other => JsonRpcResponse::failure(
                id,
                error_codes::METHOD_NOT_FOUND,
                format!("Method not found: {other}"),
            ),
        };
        Some(response)
    }

    fn tools(&self) -> Vec<serde_json::Value> {
        let prefix = &self.args.prefix;
        let mut tools = vec![
            serde_json::json!({
                "name": format!("{prefix}_echo"),
                "description": "Return the arguments unchanged",
                "inputSchema": { "type": "object", "properties": {} },
            }),
            serde_json::json!({
                "name": format!("{prefix}_sum"),
                "description": "Add two numbers",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "a": { "type": "number" },
                        "b": { "type": "number" },
                    },
                    "required": ["a", "b"],
                },
            }),
        ];
        if self.args.off_prefix_tool {
            tools.push(serde_json::json!({
                "name": "foreign_tool",
                "description": "Advertised outside the prefix",
                "inputSchema": { "type": "object", "properties": {} },
            }));
        }
        tools
    }

    fn call_tool(&self, name: &str, arguments: &serde_json::Value) -> serde_json::Value {
        let tool = name
            .strip_prefix(self.args.prefix.as_str())
            .and_then(|rest| rest.strip_prefix('_'));
        match tool {
            Some("echo") => text_result(arguments.to_string()),
            Some("sum") => {
                let a = arguments.get("a").and_then(|v| v.as_f64());
                let b = arguments.get("b").and_then(|v| v.as_f64());
                match (a, b) {
                    (Some(a), Some(b)) => text_result(serde_json::json!({ "sum": a + b }).to_string()),
                    _ => error_result("'a' and 'b' must be numbers"),
                }
            }
            _ => error_result(&format!("unknown tool: {name}")),
        }
    }
}

fn text_result(text: String) -> serde_json::Value {
    serde_json::json!({ "content": [{ "type": "text", "text": text }] })
}
