//! MCP Client: JSON-RPC over stdio for backend process management.
//!
//! This module handles:
//! - Framing line-delimited JSON off a byte stream
//! - Spawning backend processes and running the MCP handshake
//! - Multiplexing concurrent requests over one pipe, correlated by id
//! - Per-request timeouts and crash detection
//! - Aggregating discovered tools into one directory
//!
//! The `Gateway` (see `crate::gateway`) sits on top and routes calls here.

pub mod backend;
pub mod errors;
pub mod registry;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use backend::{BackendClient, BackendState, ClientOptions};
pub use errors::McpError;
pub use registry::ToolRegistry;
pub use types::{BackendConfig, McpToolDefinition};
