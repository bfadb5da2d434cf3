//! Tool registry: the merged directory of tools across all ready backends.
//!
//! Provides:
//! - A full rebuild from the current set of backend clients
//! - Tool → owning backend lookup
//! - Per-backend tool counts for status reporting
//!
//! The registry is never patched in place: callers rebuild it whenever
//! backend readiness changes.

use std::collections::HashMap;
use std::sync::Arc;

use super::backend::BackendClient;

// ─── ToolRegistry ────────────────────────────────────────────────────────────

/// `tool name → owning backend` for every ready backend.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<BackendClient>>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a fresh registry from `clients`, in order.
    ///
    /// Clients that are not ready contribute nothing. When two backends
    /// advertise the same name, the later one in `clients` wins.
    pub fn build(clients: &[Arc<BackendClient>]) -> Self {
        let mut registry = Self::new();
        for client in clients.iter().filter(|c| c.is_ready()) {
            registry.register_server_tools(client);
        }
        tracing::info!(
            tools = registry.len(),
            backends = clients.iter().filter(|c| c.is_ready()).count(),
            "tool registry built"
        );
        registry
    }

    /// Register every tool a backend advertises, overwriting earlier owners.
    pub fn register_server_tools(&mut self, client: &Arc<BackendClient>) {
        for tool in client.tools() {
            if let Some(previous) = self.tools.insert(tool.name.clone(), Arc::clone(client)) {
                if !Arc::ptr_eq(&previous, client) {
                    tracing::warn!(
                        tool = %tool.name,
                        previous = %previous.name(),
                        owner = %client.name(),
                        "duplicate tool name, later backend wins"
                    );
                }
            }
        }
    }

    /// Get the backend that owns a tool.
    pub fn get_server_for_tool(&self, tool_name: &str) -> Option<&Arc<BackendClient>> {
        self.tools.get(tool_name)
    }

    /// Whether a tool is in the directory.
    pub fn contains(&self, tool_name: &str) -> bool {
        self.tools.contains_key(tool_name)
    }

    /// Return all registered tool names, sorted.
    pub fn tool_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|k| k.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Count tools owned by a specific backend.
    pub fn tools_for_server(&self, server_name: &str) -> usize {
        self.tools
            .values()
            .filter(|client| client.name() == server_name)
            .count()
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
