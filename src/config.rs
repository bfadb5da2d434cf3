//! Gateway configuration.
//!
//! Loads the backend list and runtime options from `mcp-gateway.json` /
//! `.yaml`, with `${VAR}` and `${VAR:-default}` interpolation, or builds the
//! default two-backend deployment from environment variables.
//!
//! Example (`mcp-gateway.yaml`):
//! ```yaml
//! request_timeout_ms: 30000
//! backends:
//!   - name: ventas
//!     command: tsx
//!     args: ["${VENTAS_SERVER_PATH:-../mcp-ventas-node/src/index.ts}"]
//!   - name: pedidos
//!     command: python
//!     args: ["../mcp-pedidos-py/src/server.py"]
//! log:
//!   level: info
//!   format: json
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::mcp_client::{BackendConfig, ClientOptions, McpError};

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "MCP_GATEWAY_CONFIG";

/// Config file picked up from the working directory when present.
pub const DEFAULT_CONFIG_FILE: &str = "mcp-gateway.json";

const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_INIT_TIMEOUT_MS: u64 = 30_000;

// ─── Types ───────────────────────────────────────────────────────────────────

/// Top-level gateway configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Deadline for each `tools/call`.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Deadline for each handshake request.
    #[serde(default = "default_init_timeout_ms")]
    pub init_timeout_ms: u64,
    /// Working directory for backends without their own `cwd`.
    #[serde(default)]
    pub working_dir: Option<String>,
    /// Backends in listing order.
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub log: LogConfig,
}

/// Logging options.
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Log to this file instead of stderr.
    #[serde(default)]
    pub file: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

fn default_init_timeout_ms() -> u64 {
    DEFAULT_INIT_TIMEOUT_MS
}

fn default_log_level() -> String {
    "info".to_string()
}

// ─── GatewayConfig ───────────────────────────────────────────────────────────

impl GatewayConfig {
    /// The default deployment: a Node `ventas` backend and a Python
    /// `pedidos` backend, overridable through environment variables.
    pub fn from_env() -> Result<Self, McpError> {
        let node = env_or("NODE_PATH", "tsx");
        let python = env_or("PYTHON_PATH", "python");
        let ventas_path = env_or("VENTAS_SERVER_PATH", "../mcp-ventas-node/src/index.ts");
        let pedidos_path = env_or("PEDIDOS_SERVER_PATH", "../mcp-pedidos-py/src/server.py");

        let request_timeout_ms = match std::env::var("REQUEST_TIMEOUT") {
            Ok(raw) => parse_timeout_ms("REQUEST_TIMEOUT", &raw)?,
            Err(_) => DEFAULT_REQUEST_TIMEOUT_MS,
        };

        Ok(Self {
            request_timeout_ms,
            init_timeout_ms: DEFAULT_INIT_TIMEOUT_MS,
            working_dir: None,
            backends: vec![
                BackendConfig::new("ventas", &node, vec![ventas_path]),
                BackendConfig::new("pedidos", &python, vec![pedidos_path]),
            ],
            log: LogConfig {
                level: env_or("LOG_LEVEL", "info"),
                ..LogConfig::default()
            },
        })
    }

    /// Check the invariants the router relies on.
    pub fn validate(&self) -> Result<(), McpError> {
        if self.backends.is_empty() {
            return Err(config_error("at least one backend must be configured"));
        }
        if self.request_timeout_ms == 0 || self.init_timeout_ms == 0 {
            return Err(config_error("timeouts must be greater than zero"));
        }

        let mut names = HashSet::new();
        let mut prefixes = HashSet::new();
        for backend in &self.backends {
            if backend.name.trim().is_empty() {
                return Err(config_error("backend name must not be empty"));
            }
            if backend.command.trim().is_empty() {
                return Err(config_error(&format!(
                    "backend '{}' has an empty command",
                    backend.name
                )));
            }
            if backend.prefix().is_empty() {
                return Err(config_error(&format!(
                    "backend '{}' has an empty prefix",
                    backend.name
                )));
            }
            if !names.insert(backend.name.as_str()) {
                return Err(config_error(&format!(
                    "duplicate backend name '{}'",
                    backend.name
                )));
            }
            if !prefixes.insert(backend.prefix()) {
                return Err(config_error(&format!(
                    "duplicate tool prefix '{}' (backend '{}')",
                    backend.prefix(),
                    backend.name
                )));
            }
        }
        Ok(())
    }

    /// Runtime options handed to every backend client.
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            init_timeout: Duration::from_millis(self.init_timeout_ms),
            working_dir: self.working_dir.clone(),
        }
    }
}

fn config_error(reason: &str) -> McpError {
    McpError::ConfigError {
        reason: reason.to_string(),
    }
}

/// Parse a millisecond timeout taken from the environment.
fn parse_timeout_ms(var: &str, raw: &str) -> Result<u64, McpError> {
    raw.trim().parse().map_err(|e| McpError::ConfigError {
        reason: format!("invalid {var} '{raw}': {e}"),
    })
}

fn env_or(var: &str, default: &str) -> String {
    std::env::var(var)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Load a config file. `.yaml` / `.yml` are parsed as YAML, anything else
/// as JSON.
pub fn load_config(path: &Path) -> Result<GatewayConfig, McpError> {
    let raw = std::fs::read_to_string(path).map_err(|e| McpError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    let interpolated = interpolate_env_vars(&raw);

    let is_yaml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"));

    let config: GatewayConfig = if is_yaml {
        serde_yaml::from_str(&interpolated).map_err(|e| McpError::ConfigError {
            reason: format!("failed to parse {}: {e}", path.display()),
        })?
    } else {
        serde_json::from_str(&interpolated).map_err(|e| McpError::ConfigError {
            reason: format!("failed to parse {}: {e}", path.display()),
        })?
    };

    Ok(config)
}

/// Pick the config file: explicit path, then `$MCP_GATEWAY_CONFIG`, then
/// `./mcp-gateway.json` if it exists. `None` means environment defaults.
pub fn resolve_config_path(explicit: Option<PathBuf>) -> Option<PathBuf> {
    if explicit.is_some() {
        return explicit;
    }
    if let Some(from_env) = std::env::var_os(CONFIG_PATH_ENV).filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(from_env));
    }
    let local = PathBuf::from(DEFAULT_CONFIG_FILE);
    local.is_file().then_some(local)
}

/// Load and validate the effective configuration.
pub fn load(path: Option<&Path>) -> Result<GatewayConfig, McpError> {
    let config = match path {
        Some(path) => load_config(path)?,
        None => GatewayConfig::from_env()?,
    };
    config.validate()?;
    Ok(config)
}

/// Replace `${VAR}` and `${VAR:-default}` with environment values.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((var_name, default)) => {
            std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
        }
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(suffix: &str, contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_json_config() {
        let file = write_config(
            ".json",
            r#"{
                "request_timeout_ms": 5000,
                "backends": [
                    {"name": "ventas", "command": "tsx", "args": ["server.ts"]},
                    {"name": "pedidos", "prefix": "ped", "command": "python", "cwd": "/srv"}
                ]
            }"#,
        );
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.request_timeout_ms, 5000);
        assert_eq!(config.init_timeout_ms, DEFAULT_INIT_TIMEOUT_MS);
        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.backends[0].name, "ventas");
        assert_eq!(config.backends[0].args, vec!["server.ts"]);
        assert_eq!(config.backends[1].prefix(), "ped");
        assert_eq!(config.backends[1].cwd.as_deref(), Some("/srv"));
        assert_eq!(config.log.format, LogFormat::Text);
        config.validate().unwrap();
    }

    #[test]
    fn test_load_yaml_config() {
        let file = write_config(
            ".yaml",
            "backends:\n  - name: ventas\n    command: tsx\n    env:\n      DB_URL: sqlite://ventas.db\nlog:\n  level: debug\n  format: json\n",
        );
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.backends[0].env["DB_URL"], "sqlite://ventas.db");
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.log.format, LogFormat::Json);
        assert_eq!(config.request_timeout_ms, DEFAULT_REQUEST_TIMEOUT_MS);
    }

    #[test]
    fn test_load_interpolates_env_vars() {
        std::env::set_var("__MCP_GW_TEST_CMD__", "/opt/node/bin/tsx");
        std::env::remove_var("__MCP_GW_TEST_UNSET__");
        let file = write_config(
            ".json",
            r#"{"backends": [{"name": "ventas", "command": "${__MCP_GW_TEST_CMD__}", "args": ["${__MCP_GW_TEST_UNSET__:-index.ts}"]}]}"#,
        );
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.backends[0].command, "/opt/node/bin/tsx");
        assert_eq!(config.backends[0].args, vec!["index.ts"]);
        std::env::remove_var("__MCP_GW_TEST_CMD__");
    }

    #[test]
    fn test_load_missing_file_is_config_error() {
        let err = load_config(Path::new("/nonexistent/mcp-gateway.json")).unwrap_err();
        assert!(matches!(err, McpError::ConfigError { .. }));
    }

    #[test]
    fn test_load_malformed_file_is_config_error() {
        let file = write_config(".json", "{\"backends\": [");
        let err = load_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("failed to parse"));
    }

    #[test]
    fn test_from_env_has_default_backends() {
        let config = GatewayConfig::from_env().unwrap();
        let names: Vec<&str> = config.backends.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["ventas", "pedidos"]);
        assert!(config.backends.iter().all(|b| b.args.len() == 1));
        config.validate().unwrap();
    }

    #[test]
    fn test_invalid_timeout_env_is_config_error() {
        assert_eq!(parse_timeout_ms("REQUEST_TIMEOUT", " 1500 ").unwrap(), 1500);
        let err = parse_timeout_ms("REQUEST_TIMEOUT", "30s").unwrap_err();
        assert!(matches!(err, McpError::ConfigError { .. }));
        assert!(err.to_string().contains("invalid REQUEST_TIMEOUT '30s'"));
    }

    #[test]
    fn test_validate_rejects_bad_configs() {
        let base = GatewayConfig::from_env().unwrap();

        let mut empty = base.clone();
        empty.backends.clear();
        assert!(empty.validate().is_err());

        let mut dup_name = base.clone();
        dup_name.backends[1].name = "ventas".into();
        assert!(dup_name.validate().unwrap_err().to_string().contains("duplicate backend name"));

        let mut dup_prefix = base.clone();
        dup_prefix.backends[1].prefix = Some("ventas".into());
        assert!(dup_prefix.validate().unwrap_err().to_string().contains("duplicate tool prefix"));

        let mut no_command = base.clone();
        no_command.backends[0].command = " ".into();
        assert!(no_command.validate().is_err());

        let mut zero_timeout = base;
        zero_timeout.request_timeout_ms = 0;
        assert!(zero_timeout.validate().is_err());
    }

    #[test]
    fn test_client_options_from_config() {
        let mut config = GatewayConfig::from_env().unwrap();
        config.request_timeout_ms = 1500;
        config.working_dir = Some("/srv/mcp".into());
        let options = config.client_options();
        assert_eq!(options.request_timeout, Duration::from_millis(1500));
        assert_eq!(options.working_dir.as_deref(), Some("/srv/mcp"));
    }

    #[test]
    fn test_resolve_config_path_prefers_explicit() {
        let explicit = PathBuf::from("/etc/mcp-gateway.yaml");
        assert_eq!(resolve_config_path(Some(explicit.clone())), Some(explicit));
    }

    #[test]
    fn test_interpolate_no_vars() {
        let input = "plain text with no variables";
        assert_eq!(interpolate_env_vars(input), input);
    }

    #[test]
    fn test_expand_tilde() {
        let expanded = expand_tilde("~/mcp/server.py");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expanded, format!("{}/mcp/server.py", home.display()));
        }
        assert_eq!(expand_tilde("/abs/path"), "/abs/path");
    }
}
