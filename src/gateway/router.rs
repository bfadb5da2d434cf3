//! Tool routing across backends.
//!
//! The `Gateway` holds one slot per configured backend, in configuration
//! order. Each slot owns the current `BackendClient`; an explicit restart
//! swaps in a fresh client and rebuilds the directory. There is no
//! automatic restart: a crashed backend stays down until asked.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use parking_lot::RwLock;

use crate::config::GatewayConfig;
use crate::mcp_client::{
    BackendClient, BackendConfig, BackendState, ClientOptions, McpError, McpToolDefinition,
    ToolRegistry,
};

/// Maximum number of explicit restarts per backend.
pub const MAX_RESTART_ATTEMPTS: u32 = 3;

/// Base delay before a restart; doubles with each attempt.
const RESTART_BASE_DELAY: Duration = Duration::from_secs(1);

/// One configured backend and its current client.
struct BackendSlot {
    config: BackendConfig,
    client: RwLock<Arc<BackendClient>>,
    restarts: AtomicU32,
}

impl BackendSlot {
    fn client(&self) -> Arc<BackendClient> {
        self.client.read().clone()
    }
}

// ─── Gateway ─────────────────────────────────────────────────────────────────

pub struct Gateway {
    slots: Vec<BackendSlot>,
    options: ClientOptions,
    registry: RwLock<ToolRegistry>,
}

impl Gateway {
    /// Create a gateway with one idle client per backend, in order.
    pub fn new(backends: Vec<BackendConfig>, options: ClientOptions) -> Self {
        let clients = backends
            .into_iter()
            .map(|config| BackendClient::new(config, options.clone()))
            .collect();
        Self::with_clients(clients, options)
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(config.backends.clone(), config.client_options())
    }

    /// Create a gateway over existing clients. `start()` only starts the
    /// ones that are still idle.
    pub fn with_clients(clients: Vec<Arc<BackendClient>>, options: ClientOptions) -> Self {
        let slots = clients
            .into_iter()
            .map(|client| BackendSlot {
                config: client.config().clone(),
                client: RwLock::new(client),
                restarts: AtomicU32::new(0),
            })
            .collect();
        Self {
            slots,
            options,
            registry: RwLock::new(ToolRegistry::new()),
        }
    }

    /// Current clients, in configuration order.
    pub fn clients(&self) -> Vec<Arc<BackendClient>> {
        self.slots.iter().map(BackendSlot::client).collect()
    }

    /// `(name, state)` for every backend, in configuration order.
    pub fn backend_states(&self) -> Vec<(String, BackendState)> {
        self.slots
            .iter()
            .map(|slot| (slot.config.name.clone(), slot.client().state()))
            .collect()
    }

    /// Snapshot of the tool directory.
    pub fn directory(&self) -> ToolRegistry {
        self.registry.read().clone()
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Start every idle backend concurrently and build the directory.
    ///
    /// Backends that fail to start are reported in the returned list and
    /// left down. Errors only when backends are configured and none of
    /// them ended up ready.
    pub async fn start(&self) -> Result<Vec<(String, McpError)>, McpError> {
        let started = Instant::now();
        let clients = self.clients();
        tracing::info!(backends = clients.len(), "starting gateway");

        let attempts = clients
            .iter()
            .filter(|client| client.state() == BackendState::Idle)
            .map(|client| {
                let client = Arc::clone(client);
                async move {
                    let result = client.start().await;
                    (client.name().to_string(), result)
                }
            });
        let failures: Vec<(String, McpError)> = join_all(attempts)
            .await
            .into_iter()
            .filter_map(|(name, result)| result.err().map(|e| (name, e)))
            .collect();

        for (name, error) in &failures {
            tracing::warn!(
                server = %name,
                error = %error,
                "backend unavailable, its tools will not be listed"
            );
        }

        self.rebuild_directory();

        let ready = clients.iter().filter(|c| c.is_ready()).count();
        if !clients.is_empty() && ready == 0 {
            return Err(McpError::NoBackendsAvailable {
                attempted: clients.iter().map(|c| c.name().to_string()).collect(),
            });
        }

        tracing::info!(
            ready,
            failed = failures.len(),
            tools = self.registry.read().len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "gateway started"
        );
        Ok(failures)
    }

    /// Stop every backend concurrently and clear the directory.
    pub async fn stop(&self) {
        let clients = self.clients();
        tracing::info!(backends = clients.len(), "stopping gateway");
        join_all(clients.iter().map(|client| client.stop())).await;
        *self.registry.write() = ToolRegistry::new();
    }

    /// Replace a backend's client with a fresh one and start it.
    ///
    /// Waits `1s · 2ⁿ` before the n-th restart; after
    /// `MAX_RESTART_ATTEMPTS` restarts the backend is left down.
    pub async fn restart_backend(&self, name: &str) -> Result<(), McpError> {
        let slot = self
            .slots
            .iter()
            .find(|slot| slot.config.name == name)
            .ok_or_else(|| McpError::ConfigError {
                reason: format!("no backend named '{name}'"),
            })?;

        let attempt = slot.restarts.fetch_add(1, Ordering::SeqCst);
        if attempt >= MAX_RESTART_ATTEMPTS {
            tracing::error!(server = %name, attempts = attempt, "restart attempts exhausted");
            return Err(McpError::RestartExhausted {
                name: name.to_string(),
                attempts: attempt,
            });
        }

        let delay = RESTART_BASE_DELAY * 2u32.pow(attempt);
        tracing::info!(
            server = %name,
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "restarting backend"
        );
        tokio::time::sleep(delay).await;

        slot.client().stop().await;

        let fresh = BackendClient::new(slot.config.clone(), self.options.clone());
        *slot.client.write() = Arc::clone(&fresh);
        let result = fresh.start().await;
        self.rebuild_directory();

        match &result {
            Ok(()) => tracing::info!(server = %name, "backend restarted"),
            Err(e) => tracing::error!(server = %name, error = %e, "backend restart failed"),
        }
        result
    }

    /// Rebuild the directory from the clients that are ready now.
    pub fn rebuild_directory(&self) {
        let clients = self.clients();
        let registry = ToolRegistry::build(&clients);
        for client in clients.iter().filter(|c| c.is_ready()) {
            tracing::info!(
                server = %client.name(),
                tools = registry.tools_for_server(client.name()),
                "backend tools in directory"
            );
        }
        tracing::debug!(tools = ?registry.tool_names(), "directory rebuilt");
        *self.registry.write() = registry;
    }

    // ─── Routing ─────────────────────────────────────────────────────────

    /// The backend owning `tool_name` by prefix: the longest `{prefix}_`
    /// that matches.
    pub fn resolve(&self, tool_name: &str) -> Option<Arc<BackendClient>> {
        self.slots
            .iter()
            .filter(|slot| slot.config.owns_tool_name(tool_name))
            .max_by_key(|slot| slot.config.prefix().len())
            .map(BackendSlot::client)
    }

    /// Tools of every ready backend, in configuration order.
    pub fn list_tools(&self) -> Vec<McpToolDefinition> {
        let tools: Vec<McpToolDefinition> = self
            .clients()
            .iter()
            .filter(|client| client.is_ready())
            .flat_map(|client| client.tools())
            .collect();
        tracing::debug!(tools = tools.len(), "listing tools");
        tools
    }

    /// Route a call and return the backend's result, or a structured
    /// `isError` result describing why it failed.
    pub async fn call_tool(&self, tool_name: &str, arguments: serde_json::Value) -> serde_json::Value {
        match self.try_call_tool(tool_name, arguments).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(tool = tool_name, error = %e, "tool call failed");
                error_result(&e.to_string())
            }
        }
    }

    /// Route a call, keeping the failure as a typed error.
    pub async fn try_call_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, McpError> {
        let client = self.resolve(tool_name).ok_or_else(|| McpError::UnknownTool {
            name: tool_name.to_string(),
        })?;

        if !client.is_ready() {
            return Err(McpError::BackendUnavailable {
                name: client.name().to_string(),
                tool: tool_name.to_string(),
            });
        }

        let listed_owner = self
            .registry
            .read()
            .get_server_for_tool(tool_name)
            .map(|owner| owner.name().to_string());
        match listed_owner {
            Some(owner) if owner != client.name() => tracing::warn!(
                tool = tool_name,
                server = %client.name(),
                listed_owner = %owner,
                "directory lists another owner, routing by prefix"
            ),
            None => tracing::debug!(
                tool = tool_name,
                server = %client.name(),
                "tool not in directory, forwarding to prefix owner"
            ),
            Some(_) => {
                tracing::debug!(tool = tool_name, server = %client.name(), "routing tool call")
            }
        }
        client.call_tool(tool_name, arguments).await
    }
}

/// MCP tool result signalling a failure to the caller.
pub fn error_result(message: &str) -> serde_json::Value {
    serde_json::json!({
        "content": [{
            "type": "text",
            "text": serde_json::json!({ "error": message }).to_string(),
        }],
        "isError": true,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
