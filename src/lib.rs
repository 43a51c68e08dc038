//! MCP Dispatch Library
//!
//! HTTP gateway that validates client tool invocations, executes them against
//! Model Context Protocol (MCP) tool servers and returns the outcome either as
//! a single JSON response or as a Server-Sent Events stream of frames.
//!
//! # Features
//!
//! - **Two-stage pipeline**: pluggable [`pipeline::Validator`] and [`pipeline::Executor`]
//! - **Streaming**: ordered frame bridge with idle timeout and consumer-driven cancellation
//! - **Webhooks**: HMAC-SHA256 verified event ingestion with fire-and-forget replies
//! - **Multi-Transport**: stdio and Streamable HTTP backends
//! - **Lifecycle**: best-effort startup, reverse-order shutdown of every backend

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod pipeline;
pub mod protocol;
pub mod transport;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG` takes precedence over `level`.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    }
    .map_err(|e| Error::Internal(format!("Failed to install tracing subscriber: {e}")))
}
