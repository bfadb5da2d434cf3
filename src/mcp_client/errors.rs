//! MCP Client error types.
//!
//! All errors implement `std::error::Error` via `thiserror`. Each variant
//! carries the backend and tool names so log entries can be built without
//! extra context.

use thiserror::Error;

/// Errors that can occur during backend and gateway operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// A backend process failed to start.
    #[error("failed to spawn backend '{name}': {reason}")]
    SpawnFailed {
        name: String,
        reason: String,
    },

    /// The initialization handshake failed or timed out.
    #[error("backend '{name}' initialization failed: {reason}")]
    InitFailed {
        name: String,
        reason: String,
    },

    /// A line read from a backend was not valid JSON.
    #[error("malformed message from '{server}': {reason}")]
    ParseError {
        server: String,
        reason: String,
    },

    /// I/O failure on the backend's pipes.
    #[error("transport error for backend '{server}': {reason}")]
    TransportError {
        server: String,
        reason: String,
    },

    /// Backend returned a JSON-RPC error response.
    #[error("{message}")]
    ServerError {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// A call reached a backend that has not finished its handshake, or has
    /// already crashed or stopped.
    #[error("backend '{name}' is not ready")]
    NotReady {
        name: String,
    },

    /// The router found the owning backend but it is not ready.
    #[error("backend '{name}' for tool '{tool}' is not available")]
    BackendUnavailable {
        name: String,
        tool: String,
    },

    /// No backend claims the tool name.
    #[error("unknown tool: '{name}'")]
    UnknownTool {
        name: String,
    },

    /// No matching response arrived within the deadline.
    #[error("request '{tool}' to backend '{server}' timed out after {elapsed_ms}ms")]
    Timeout {
        server: String,
        tool: String,
        elapsed_ms: u64,
    },

    /// Backend process exited while requests were outstanding.
    #[error("backend '{name}' crashed: {reason}")]
    ServerCrashed {
        name: String,
        reason: String,
    },

    /// The backend was stopped while the request was in flight.
    #[error("backend '{name}' stopped")]
    Stopped {
        name: String,
    },

    /// Configuration error (bad file, duplicate names, missing command).
    #[error("config error: {reason}")]
    ConfigError {
        reason: String,
    },

    /// Every configured backend failed to start.
    #[error("no backend could be started (tried: {})", attempted.join(", "))]
    NoBackendsAvailable {
        attempted: Vec<String>,
    },

    /// All restart attempts exhausted for a backend.
    #[error("backend '{name}' failed after {attempts} restart attempts")]
    RestartExhausted {
        name: String,
        attempts: u32,
    },
}

impl McpError {
    /// Whether this error means the backend never became usable.
    pub fn is_startup(&self) -> bool {
        matches!(self, Self::SpawnFailed { .. } | Self::InitFailed { .. })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_names_tool_and_elapsed() {
        let err = McpError::Timeout {
            server: "ventas".into(),
            tool: "ventas_por_dia".into(),
            elapsed_ms: 30_004,
        };
        let msg = err.to_string();
        assert!(msg.contains("ventas_por_dia"));
        assert!(msg.contains("30004ms"));
    }

    #[test]
    fn test_server_error_displays_backend_message() {
        let err = McpError::ServerError {
            code: -32602,
            message: "N debe estar entre 1 y 365".into(),
            data: None,
        };
        assert_eq!(err.to_string(), "N debe estar entre 1 y 365");
    }

    #[test]
    fn test_no_backends_lists_attempted() {
        let err = McpError::NoBackendsAvailable {
            attempted: vec!["ventas".into(), "pedidos".into()],
        };
        assert_eq!(
            err.to_string(),
            "no backend could be started (tried: ventas, pedidos)"
        );
    }

    #[test]
    fn test_is_startup() {
        assert!(McpError::SpawnFailed {
            name: "a".into(),
            reason: "enoent".into(),
        }
        .is_startup());
        assert!(!McpError::Stopped { name: "a".into() }.is_startup());
    }
}
