//! Streamable HTTP transport implementation
//!
//! Every JSON-RPC message is a direct POST to the configured endpoint. The
//! server may answer with plain JSON or with a single-event SSE body; the
//! `Mcp-Session-Id` header is captured from the first response and echoed
//! on every later request.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, header};
use serde_json::{Value, json};
use tracing::{debug, warn};
use url::Url;

use super::{Transport, initialize_params};
use crate::protocol::{JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION, RequestId};
use crate::{Error, Result};

/// HTTP transport for MCP servers speaking Streamable HTTP
pub struct HttpTransport {
    /// HTTP client
    client: Client,
    /// Endpoint URL
    url: Url,
    /// Static headers (auth etc.) sent with every request
    headers: header::HeaderMap,
    /// Session ID assigned by the server
    session_id: RwLock<Option<String>>,
    /// Request ID counter
    request_id: AtomicI64,
    /// Connected flag
    connected: AtomicBool,
}

impl HttpTransport {
    /// Create a new HTTP transport
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the HTTP client cannot be built.
    pub fn new(url: &str, headers: &HashMap<String, String>, timeout: Duration) -> Result<Arc<Self>> {
        let url = Url::parse(url).map_err(|e| Error::Config(format!("Invalid http_url '{url}': {e}")))?;

        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .tcp_nodelay(true)
            .build()
            .map_err(|e| Error::Transport(e.to_string()))?;

        let mut header_map = header::HeaderMap::new();
        for (key, value) in headers {
            match (
                key.parse::<header::HeaderName>(),
                value.parse::<header::HeaderValue>(),
            ) {
                (Ok(k), Ok(v)) => {
                    header_map.insert(k, v);
                }
                _ => warn!(header = %key, "Skipping invalid backend header"),
            }
        }

        Ok(Arc::new(Self {
            client,
            url,
            headers: header_map,
            session_id: RwLock::new(None),
            request_id: AtomicI64::new(1),
            connected: AtomicBool::new(false),
        }))
    }

    /// Perform the `initialize` handshake
    ///
    /// # Errors
    ///
    /// Returns an error if the server is unreachable or rejects the handshake.
    pub async fn initialize(&self) -> Result<()> {
        let request = JsonRpcRequest::new(RequestId::Number(0), "initialize", Some(initialize_params()));
        let response = self.send(&request).await?;

        if let Some(err) = response.error {
            return Err(Error::Protocol(format!("Initialize failed: {}", err.message)));
        }

        self.notify("notifications/initialized", None).await?;

        self.connected.store(true, Ordering::Relaxed);
        debug!(url = %self.url, "HTTP transport initialized");

        Ok(())
    }

    /// Headers for one outgoing message
    fn message_headers(&self) -> header::HeaderMap {
        let mut headers = self.headers.clone();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json, text/event-stream"),
        );
        headers.insert(
            "mcp-protocol-version",
            header::HeaderValue::from_static(PROTOCOL_VERSION),
        );
        if let Some(ref session_id) = *self.session_id.read() {
            if let Ok(v) = header::HeaderValue::from_str(session_id) {
                headers.insert("mcp-session-id", v);
            }
        }
        headers
    }

    /// POST one request and decode the response
    async fn send(&self, request: &JsonRpcRequest) -> Result<JsonRpcResponse> {
        let response = self
            .client
            .post(self.url.clone())
            .headers(self.message_headers())
            .json(request)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("Request failed: {e}")))?;

        if self.session_id.read().is_none() {
            if let Some(id) = response
                .headers()
                .get("mcp-session-id")
                .and_then(|v| v.to_str().ok())
            {
                debug!(session_id = %id, url = %self.url, "Stored session ID from response");
                *self.session_id.write() = Some(id.to_string());
            }
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Transport(format!("HTTP {status}: {body}")));
        }

        let is_sse = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("text/event-stream"));

        if is_sse {
            let text = response
                .text()
                .await
                .map_err(|e| Error::Transport(format!("Failed to read SSE response: {e}")))?;
            parse_sse_response(&text)
        } else {
            response
                .json()
                .await
                .map_err(|e| Error::Transport(format!("Failed to parse response: {e}")))
        }
    }

    /// Get next request ID
    fn next_id(&self) -> RequestId {
        RequestId::Number(self.request_id.fetch_add(1, Ordering::Relaxed))
    }
}

/// Extract the JSON-RPC response from the first `data:` line of an SSE body
fn parse_sse_response(text: &str) -> Result<JsonRpcResponse> {
    let data = text
        .lines()
        .find_map(|line| line.strip_prefix("data:"))
        .ok_or_else(|| Error::Transport("No data in SSE response".to_string()))?;
    serde_json::from_str(data.trim())
        .map_err(|e| Error::Transport(format!("Failed to parse SSE data: {e}")))
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse> {
        let request = JsonRpcRequest::new(self.next_id(), method, params);
        self.send(&request).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let notification = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params
        });

        let response = self
            .client
            .post(self.url.clone())
            .headers(self.message_headers())
            .json(&notification)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("Notification failed: {e}")))?;

        if !response.status().is_success() {
            warn!(status = %response.status(), url = %self.url, "Notification failed");
        }

        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::Relaxed);

        // Terminate the server-side session if one was assigned
        let session_id = self.session_id.write().take();
        if let Some(id) = session_id {
            self.client
                .delete(self.url.clone())
                .header("MCP-Session-Id", id)
                .send()
                .await
                .map_err(|e| Error::Transport(format!("Session termination failed: {e}")))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sse_response() {
        let body = "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"ok\":true}}\n\n";
        let response = parse_sse_response(body).unwrap();
        assert_eq!(response.id, Some(RequestId::Number(1)));
        assert_eq!(response.result, Some(json!({"ok": true})));
    }

    #[test]
    fn test_parse_sse_response_without_data() {
        assert!(parse_sse_response("event: ping\n\n").is_err());
    }

    #[test]
    fn test_invalid_url_rejected() {
        let result = HttpTransport::new("not a url", &HashMap::new(), Duration::from_secs(1));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_new_transport_is_disconnected() {
        let transport =
            HttpTransport::new("http://127.0.0.1:9/mcp", &HashMap::new(), Duration::from_secs(1))
                .unwrap();
        assert!(!transport.is_connected());
    }
}
