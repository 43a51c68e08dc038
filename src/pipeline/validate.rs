//! Default validation stage

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use super::{Envelope, Payload, SelectedServer, Validator};
use crate::backend::BackendRegistry;
use crate::config::PipelineConfig;
use crate::gateway::ProgressSink;
use crate::{Error, Result};

/// Checks an envelope against the configured clients and the live backends
pub struct RequestValidator {
    registry: Arc<BackendRegistry>,
    config: PipelineConfig,
}

impl RequestValidator {
    /// Create a validator over `registry`
    #[must_use]
    pub fn new(registry: Arc<BackendRegistry>, config: PipelineConfig) -> Self {
        Self { registry, config }
    }

    fn check_client(&self, selected: Option<&str>) -> Result<String> {
        let client = match selected.map(str::trim) {
            None | Some("") => return Err(Error::validation("selected_client is required")),
            Some(client) => client,
        };
        if self.config.clients.iter().any(|c| c == client) {
            Ok(client.to_string())
        } else {
            Err(Error::validation(format!("Unsupported client: {client}")))
        }
    }

    fn credentials_for(&self, name: &str, supplied: Option<Value>) -> Result<Value> {
        match supplied {
            Some(Value::Object(map)) => Ok(Value::Object(map)),
            Some(Value::Null) | None if !self.config.require_credentials => Ok(Value::Null),
            Some(Value::Null) | None => Err(Error::validation(format!(
                "Missing credentials for server: {name}"
            ))),
            Some(_) => Err(Error::validation(format!(
                "Credentials for server {name} must be an object"
            ))),
        }
    }
}

#[async_trait]
impl Validator for RequestValidator {
    async fn validate(&self, envelope: Envelope, _sink: Option<&ProgressSink>) -> Result<Payload> {
        let Envelope {
            client_details,
            selected_client,
            selected_servers,
            mut selected_server_credentials,
        } = envelope;

        let client = self.check_client(selected_client.as_deref())?;

        if selected_servers.is_empty() {
            return Err(Error::validation("selected_servers is required"));
        }

        let mut servers: Vec<SelectedServer> = Vec::with_capacity(selected_servers.len());
        for name in selected_servers {
            if servers.iter().any(|s| s.name == name) {
                continue;
            }
            if !self.registry.get(&name).is_some_and(|b| b.is_live()) {
                return Err(Error::validation(format!("Server not available: {name}")));
            }
            let credentials = self.credentials_for(&name, selected_server_credentials.remove(&name))?;
            servers.push(SelectedServer { name, credentials });
        }

        let tool = match client_details.get("tool") {
            Some(Value::String(tool)) if !tool.trim().is_empty() => tool.clone(),
            _ => return Err(Error::validation("client_details.tool is required")),
        };

        let arguments = match client_details.get("arguments") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(arguments)) => arguments.clone(),
            Some(_) => {
                return Err(Error::validation("client_details.arguments must be an object"));
            }
        };

        debug!(client = %client, tool = %tool, servers = servers.len(), "Request validated");

        Ok(Payload {
            client,
            servers,
            tool,
            arguments,
            client_details,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::protocol::JsonRpcResponse;
    use crate::transport::Transport;
    use serde_json::json;

    struct IdleTransport {
        live: bool,
    }

    #[async_trait]
    impl Transport for IdleTransport {
        async fn request(&self, _method: &str, _params: Option<Value>) -> Result<JsonRpcResponse> {
            Err(Error::Transport("not used".to_string()))
        }

        async fn notify(&self, _method: &str, _params: Option<Value>) -> Result<()> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.live
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    async fn registry() -> Arc<BackendRegistry> {
        let configs = vec![
            ("NUMPY_MCP".to_string(), Default::default()),
            ("NEO4J_MCP".to_string(), Default::default()),
        ];
        let (registry, _) = BackendRegistry::open_with(configs, |name, _| async move {
            let live = name == "NUMPY_MCP";
            Ok(Backend::new(&name, Arc::new(IdleTransport { live }), "stdio"))
        })
        .await;
        Arc::new(registry)
    }

    fn envelope(value: Value) -> Envelope {
        Envelope::from_value(value).unwrap()
    }

    fn valid_request() -> Value {
        json!({
            "client_details": { "tool": "add", "arguments": { "a": 40, "b": 2 } },
            "selected_client": "MCP_CLIENT_OPENAI",
            "selected_servers": ["NUMPY_MCP", "NUMPY_MCP"],
            "selected_server_credentials": { "NUMPY_MCP": { "token": "t" } }
        })
    }

    async fn validate(request: Value) -> Result<Payload> {
        let validator = RequestValidator::new(registry().await, PipelineConfig::default());
        validator.validate(envelope(request), None).await
    }

    #[tokio::test]
    async fn test_valid_request_produces_payload() {
        let payload = validate(valid_request()).await.unwrap();
        assert_eq!(payload.client, "MCP_CLIENT_OPENAI");
        assert_eq!(payload.tool, "add");
        assert_eq!(payload.arguments["b"], 2);
        assert_eq!(payload.servers.len(), 1);
        assert_eq!(payload.servers[0].credentials, json!({ "token": "t" }));
    }

    #[tokio::test]
    async fn test_missing_client_rejected() {
        let mut request = valid_request();
        request["selected_client"] = Value::Null;
        let err = validate(request).await.unwrap_err();
        assert_eq!(err.to_string(), "selected_client is required");
    }

    #[tokio::test]
    async fn test_unknown_client_rejected() {
        let mut request = valid_request();
        request["selected_client"] = json!("MCP_CLIENT_UNKNOWN");
        let err = validate(request).await.unwrap_err();
        assert_eq!(err.to_string(), "Unsupported client: MCP_CLIENT_UNKNOWN");
    }

    #[tokio::test]
    async fn test_empty_servers_rejected() {
        let mut request = valid_request();
        request["selected_servers"] = json!([]);
        let err = validate(request).await.unwrap_err();
        assert_eq!(err.to_string(), "selected_servers is required");
    }

    #[tokio::test]
    async fn test_dead_or_unknown_server_rejected() {
        let mut request = valid_request();
        request["selected_servers"] = json!(["NEO4J_MCP"]);
        let err = validate(request).await.unwrap_err();
        assert_eq!(err.to_string(), "Server not available: NEO4J_MCP");

        let mut request = valid_request();
        request["selected_servers"] = json!(["GMAIL_MCP"]);
        let err = validate(request).await.unwrap_err();
        assert!(err.is_in_band());
    }

    #[tokio::test]
    async fn test_missing_credentials_rejected() {
        let mut request = valid_request();
        request["selected_server_credentials"] = json!({});
        let err = validate(request).await.unwrap_err();
        assert_eq!(err.to_string(), "Missing credentials for server: NUMPY_MCP");
    }

    #[tokio::test]
    async fn test_credentials_optional_when_configured() {
        let mut request = valid_request();
        request["selected_server_credentials"] = json!({});
        let config = PipelineConfig {
            require_credentials: false,
            ..Default::default()
        };
        let validator = RequestValidator::new(registry().await, config);
        let payload = validator.validate(envelope(request), None).await.unwrap();
        assert!(payload.servers[0].credentials.is_null());
    }

    #[tokio::test]
    async fn test_missing_tool_rejected() {
        let mut request = valid_request();
        request["client_details"] = json!({ "arguments": {} });
        let err = validate(request).await.unwrap_err();
        assert_eq!(err.to_string(), "client_details.tool is required");
    }

    #[tokio::test]
    async fn test_non_object_arguments_rejected() {
        let mut request = valid_request();
        request["client_details"]["arguments"] = json!([1, 2]);
        let err = validate(request).await.unwrap_err();
        assert!(err.is_in_band());
    }
}
