//! Default execution stage

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use super::{Executor, Payload};
use crate::backend::BackendRegistry;
use crate::gateway::ProgressSink;
use crate::protocol::ToolsCallResult;
use crate::{Error, Result};

/// Argument under which server credentials are passed to the tool
pub const CREDENTIALS_ARGUMENT: &str = "__credentials__";

/// Invokes the requested tool on the first selected server that offers it
pub struct ToolExecutor {
    registry: Arc<BackendRegistry>,
}

impl ToolExecutor {
    /// Create an executor over `registry`
    #[must_use]
    pub fn new(registry: Arc<BackendRegistry>) -> Self {
        Self { registry }
    }
}

/// Backend failures during execution are business outcomes
fn in_band(e: Error) -> Error {
    if e.is_in_band() {
        e
    } else {
        Error::execution(e.to_string())
    }
}

/// Tool output as JSON: text content is parsed if it is JSON, kept as a
/// string otherwise. Results without text are returned as their content list.
fn decode_result(result: &ToolsCallResult) -> Value {
    let text = result.text();
    if text.is_empty() {
        return serde_json::to_value(&result.content).unwrap_or(Value::Null);
    }
    serde_json::from_str(&text).unwrap_or(Value::String(text))
}

#[async_trait]
impl Executor for ToolExecutor {
    async fn execute(&self, payload: Payload, _sink: Option<&ProgressSink>) -> Result<Value> {
        for server in &payload.servers {
            let backend = self.registry.lookup(&server.name).map_err(in_band)?;
            let tools = backend.list_tools().await.map_err(in_band)?;
            if !tools.iter().any(|t| t.name == payload.tool) {
                continue;
            }

            let mut arguments = payload.arguments.clone();
            if !server.credentials.is_null() {
                arguments.insert(CREDENTIALS_ARGUMENT.to_string(), server.credentials.clone());
            }

            debug!(backend = %server.name, tool = %payload.tool, "Invoking tool");
            let result = backend
                .call_tool(&payload.tool, Value::Object(arguments))
                .await
                .map_err(in_band)?;

            if result.is_error {
                let text = result.text();
                warn!(backend = %server.name, tool = %payload.tool, error = %text, "Tool reported an error");
                return Err(Error::execution(if text.is_empty() {
                    format!("Tool '{}' failed", payload.tool)
                } else {
                    text
                }));
            }

            return Ok(decode_result(&result));
        }

        let names: Vec<_> = payload.servers.iter().map(|s| s.name.as_str()).collect();
        Err(Error::execution(format!(
            "Tool '{}' not found on selected servers: {}",
            payload.tool,
            names.join(", ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::pipeline::SelectedServer;
    use crate::protocol::{JsonRpcResponse, RequestId};
    use crate::transport::Transport;
    use parking_lot::Mutex;
    use serde_json::{Map, json};

    /// Offers `add` and `fail`; records the arguments of every call
    struct MathTransport {
        calls: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl Transport for MathTransport {
        async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse> {
            let id = RequestId::Number(1);
            match method {
                "tools/list" => Ok(JsonRpcResponse::success(
                    id,
                    json!({ "tools": [{ "name": "add" }, { "name": "fail" }] }),
                )),
                "tools/call" => {
                    let params = params.unwrap_or_default();
                    self.calls.lock().push(params["arguments"].clone());
                    if params["name"] == "fail" {
                        return Ok(JsonRpcResponse::success(
                            id,
                            json!({ "content": [{ "type": "text", "text": "division by zero" }], "isError": true }),
                        ));
                    }
                    let sum = params["arguments"]["a"].as_i64().unwrap_or(0)
                        + params["arguments"]["b"].as_i64().unwrap_or(0);
                    Ok(JsonRpcResponse::success(
                        id,
                        json!({ "content": [{ "type": "text", "text": sum.to_string() }] }),
                    ))
                }
                _ => Err(Error::Protocol(format!("unexpected method {method}"))),
            }
        }

        async fn notify(&self, _method: &str, _params: Option<Value>) -> Result<()> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    async fn executor() -> (ToolExecutor, Arc<MathTransport>) {
        let transport = Arc::new(MathTransport {
            calls: Mutex::new(Vec::new()),
        });
        let shared = Arc::clone(&transport);
        let (registry, _) = BackendRegistry::open_with(
            vec![("NUMPY_MCP".to_string(), Default::default())],
            move |name, _| {
                let transport: Arc<dyn Transport> = shared.clone();
                async move { Ok(Backend::new(&name, transport, "stdio")) }
            },
        )
        .await;
        (ToolExecutor::new(Arc::new(registry)), transport)
    }

    fn payload(tool: &str) -> Payload {
        let mut arguments = Map::new();
        arguments.insert("a".to_string(), json!(40));
        arguments.insert("b".to_string(), json!(2));
        Payload {
            client: "MCP_CLIENT_OPENAI".to_string(),
            servers: vec![SelectedServer {
                name: "NUMPY_MCP".to_string(),
                credentials: json!({ "token": "t" }),
            }],
            tool: tool.to_string(),
            arguments,
            client_details: Map::new(),
        }
    }

    #[tokio::test]
    async fn test_tool_result_decoded_as_json() {
        let (executor, transport) = executor().await;
        let data = executor.execute(payload("add"), None).await.unwrap();
        assert_eq!(data, json!(42));

        let calls = transport.calls.lock();
        assert_eq!(calls[0][CREDENTIALS_ARGUMENT], json!({ "token": "t" }));
    }

    #[tokio::test]
    async fn test_tool_error_is_execution_failure() {
        let (executor, _) = executor().await;
        let err = executor.execute(payload("fail"), None).await.unwrap_err();
        assert!(matches!(err, Error::Execution(ref m) if m == "division by zero"));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_execution_failure() {
        let (executor, _) = executor().await;
        let err = executor.execute(payload("mul"), None).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Tool 'mul' not found on selected servers: NUMPY_MCP"
        );
    }

    #[test]
    fn test_non_json_text_kept_as_string() {
        let result: ToolsCallResult =
            serde_json::from_value(json!({ "content": [{ "type": "text", "text": "sent" }] }))
                .unwrap();
        assert_eq!(decode_result(&result), json!("sent"));
    }
}
