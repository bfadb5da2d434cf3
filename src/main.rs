//! MCP Gateway
//!
//! Exposes the tools of several stdio MCP backends as one MCP server on
//! stdin/stdout.
//!
//! # Usage
//!
//! ```bash
//! ./mcp-gateway --config mcp-gateway.yaml
//! ```
//!
//! Without `--config`, `$MCP_GATEWAY_CONFIG` or `./mcp-gateway.json` is
//! used, falling back to the `ventas` + `pedidos` defaults driven by
//! environment variables.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use mcp_gateway::config;
use mcp_gateway::gateway::{self, Gateway};

#[derive(Parser, Debug)]
#[command(name = "mcp-gateway", version)]
#[command(about = "Routes MCP tool calls to multiple stdio backends")]
struct Args {
    /// Configuration file path (JSON or YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level or filter directive, e.g. `debug` or `mcp_gateway=trace`
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = config::resolve_config_path(args.config);
    let mut config = config::load(config_path.as_deref())?;
    if let Some(level) = args.log_level {
        config.log.level = level;
    }
    mcp_gateway::init_tracing(&config.log)?;

    info!(
        config = ?config_path,
        backends = config.backends.len(),
        request_timeout_ms = config.request_timeout_ms,
        "configuration loaded"
    );

    let gateway = Arc::new(Gateway::from_config(&config));
    if let Err(e) = gateway.start().await {
        error!(error = %e, "gateway failed to start");
        gateway.stop().await;
        return Err(e.into());
    }

    let serving = gateway::serve(Arc::clone(&gateway), tokio::io::stdin(), tokio::io::stdout());
    tokio::select! {
        result = serving => match result {
            Ok(()) => info!("stdin closed, shutting down"),
            Err(e) => error!(error = %e, "stdio transport failed, shutting down"),
        },
        _ = shutdown_signal() => {}
    }

    gateway.stop().await;
    info!("MCP gateway stopped");
    Ok(())
}

/// Resolves on SIGINT, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => tokio::select! {
                _ = ctrl_c => info!("received SIGINT, shutting down"),
                _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            },
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
                info!("received SIGINT, shutting down");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("received SIGINT, shutting down");
    }
}
