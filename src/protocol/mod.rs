//! MCP protocol types used to talk to backend tool servers

mod messages;
mod types;

pub use messages::*;
pub use types::*;

/// MCP Protocol version sent in the `initialize` handshake
pub const PROTOCOL_VERSION: &str = "2024-11-05";
