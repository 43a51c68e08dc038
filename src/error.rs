//! Error types for the dispatch gateway

use std::io;

use thiserror::Error;

/// Result type alias for the dispatch gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Dispatch gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Backend not found
    #[error("Backend not found: {0}")]
    BackendNotFound(String),

    /// Backend unavailable (not connected)
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Backend timeout
    #[error("Backend timeout: {0}")]
    BackendTimeout(String),

    /// Backend transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Request shape or credential problem, reported in-band
    #[error("{0}")]
    Validation(String),

    /// Backend invocation failed, reported in-band
    #[error("{0}")]
    Execution(String),

    /// Webhook signature did not match
    #[error("Invalid signature: {0}")]
    Signature(String),

    /// Malformed JSON body
    #[error("Invalid JSON: {0}")]
    Decode(String),

    /// One or more backends failed to close
    #[error("Failed to close {} backend(s): {}", .0.len(), .0.join("; "))]
    RegistryClose(Vec<String>),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error is a business outcome delivered inside a normal
    /// response (`Status: false` or an ERROR frame) rather than a gateway failure.
    #[must_use]
    pub fn is_in_band(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::Execution(_))
    }

    /// Shorthand for a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Shorthand for an execution error
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution(message.into())
    }
}
