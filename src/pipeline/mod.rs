//! Validation and execution stages
//!
//! A request [`Envelope`] passes through a [`Validator`], which turns it into
//! a [`Payload`], and then an [`Executor`], which produces the result data.
//! Both stages report business failures as in-band errors
//! ([`Error::Validation`](crate::Error::Validation) and
//! [`Error::Execution`](crate::Error::Execution)); anything else is treated as
//! a gateway failure by the dispatcher.

mod execute;
mod validate;

pub use execute::{CREDENTIALS_ARGUMENT, ToolExecutor};
pub use validate::RequestValidator;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::gateway::ProgressSink;
use crate::{Error, Result};

/// Raw client request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Envelope {
    /// Free-form request details (`tool`, `arguments`, `is_stream`, ...)
    pub client_details: Map<String, Value>,
    /// Client identifier
    pub selected_client: Option<String>,
    /// Tool servers the request may use
    pub selected_servers: Vec<String>,
    /// Credentials per selected server
    pub selected_server_credentials: HashMap<String, Value>,
}

impl Envelope {
    /// Build an envelope from a decoded request body
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] if `raw` is not a JSON object or a known
    /// field has the wrong type.
    pub fn from_value(raw: Value) -> Result<Self> {
        if !raw.is_object() {
            return Err(Error::Decode(format!(
                "request body must be a JSON object, got {}",
                json_kind(&raw)
            )));
        }
        serde_json::from_value(raw).map_err(|e| Error::Decode(format!("malformed request: {e}")))
    }

    /// Set `client_details.is_stream`
    ///
    /// Downstream stages always run in non-streaming mode; streaming is done
    /// by the dispatcher.
    #[must_use]
    pub fn with_stream_flag(mut self, is_stream: bool) -> Self {
        self.client_details
            .insert("is_stream".to_string(), Value::Bool(is_stream));
        self
    }

    /// Value of `client_details.is_stream`
    #[must_use]
    pub fn is_stream(&self) -> bool {
        self.client_details
            .get("is_stream")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// A selected server together with its credentials
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelectedServer {
    /// Backend name
    pub name: String,
    /// Credentials object, or null when none were supplied
    pub credentials: Value,
}

/// Validated request, ready for execution
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Payload {
    /// Client identifier
    pub client: String,
    /// Servers in selection order, without duplicates
    pub servers: Vec<SelectedServer>,
    /// Tool to invoke
    pub tool: String,
    /// Tool arguments
    pub arguments: Map<String, Value>,
    /// Remaining request details
    pub client_details: Map<String, Value>,
}

/// Turns an envelope into a payload
///
/// When `sink` is present the request is streaming and the stage may emit
/// progress frames.
#[async_trait]
pub trait Validator: Send + Sync {
    /// Validate `envelope`
    async fn validate(&self, envelope: Envelope, sink: Option<&ProgressSink>) -> Result<Payload>;
}

/// Runs a validated payload against the backends
#[async_trait]
pub trait Executor: Send + Sync {
    /// Execute `payload` and return the result data
    async fn execute(&self, payload: Payload, sink: Option<&ProgressSink>) -> Result<Value>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_defaults_for_missing_fields() {
        let envelope = Envelope::from_value(json!({})).unwrap();
        assert_eq!(envelope, Envelope::default());
        assert!(!envelope.is_stream());
    }

    #[test]
    fn test_envelope_from_full_request() {
        let envelope = Envelope::from_value(json!({
            "client_details": { "tool": "add", "arguments": { "a": 1 }, "is_stream": true },
            "selected_client": "MCP_CLIENT_OPENAI",
            "selected_servers": ["NUMPY_MCP"],
            "selected_server_credentials": { "NUMPY_MCP": { "key": "k" } }
        }))
        .unwrap();

        assert_eq!(envelope.selected_client.as_deref(), Some("MCP_CLIENT_OPENAI"));
        assert_eq!(envelope.selected_servers, vec!["NUMPY_MCP".to_string()]);
        assert!(envelope.is_stream());
        assert!(!envelope.with_stream_flag(false).is_stream());
    }

    #[test]
    fn test_non_object_body_is_decode_error() {
        let err = Envelope::from_value(json!([1, 2])).unwrap_err();
        assert!(matches!(err, Error::Decode(ref m) if m.contains("an array")));
        assert!(!err.is_in_band());
    }

    #[test]
    fn test_wrong_field_type_is_decode_error() {
        let err = Envelope::from_value(json!({ "selected_servers": "NUMPY_MCP" })).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }
}
