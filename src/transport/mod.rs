//! Transport implementations for MCP backends

mod http;
mod stdio;

pub use self::http::HttpTransport;
pub use self::stdio::StdioTransport;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::{Result, protocol::JsonRpcResponse, protocol::PROTOCOL_VERSION};

/// Transport trait for MCP communication
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for response
    async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse>;

    /// Send a notification (no response expected)
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()>;

    /// Check if transport is connected
    fn is_connected(&self) -> bool;

    /// Close the transport
    async fn close(&self) -> Result<()>;
}

/// Params of the `initialize` request sent by every transport
pub(crate) fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": "mcp-dispatch",
            "version": env!("CARGO_PKG_VERSION")
        }
    })
}
