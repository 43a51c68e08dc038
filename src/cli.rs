//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// MCP dispatch gateway - validated tool invocations with SSE streaming
#[derive(Parser, Debug)]
#[command(name = "mcp-dispatch")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "MCP_DISPATCH_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "MCP_DISPATCH_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "MCP_DISPATCH_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "MCP_DISPATCH_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "MCP_DISPATCH_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Do not mount the webhook route
    #[arg(long)]
    pub no_webhook: bool,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway server (default)
    Serve,

    /// Load and validate the configuration, then print the backends
    CheckConfig,
}
