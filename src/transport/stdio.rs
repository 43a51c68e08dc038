//! Stdio transport implementation (subprocess)

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, error, trace};

use super::{Transport, initialize_params};
use crate::protocol::{JsonRpcRequest, JsonRpcResponse, RequestId};
use crate::{Error, Result};

/// Stdio transport for subprocess MCP servers
pub struct StdioTransport {
    /// Child process
    child: Mutex<Option<Child>>,
    /// Pending requests waiting for response
    pending: DashMap<String, oneshot::Sender<JsonRpcResponse>>,
    /// Request ID counter
    request_id: AtomicI64,
    /// Connected flag
    connected: AtomicBool,
    /// Program to execute
    command: String,
    /// Program arguments
    args: Vec<String>,
    /// Environment variables
    env: HashMap<String, String>,
    /// Working directory
    cwd: Option<String>,
    /// Per-request timeout
    timeout: Duration,
    /// Writer handle
    writer: Mutex<Option<ChildStdin>>,
}

impl StdioTransport {
    /// Create a new stdio transport
    #[must_use]
    pub fn new(
        command: &str,
        args: Vec<String>,
        env: HashMap<String, String>,
        cwd: Option<String>,
        timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            child: Mutex::new(None),
            pending: DashMap::new(),
            request_id: AtomicI64::new(1),
            connected: AtomicBool::new(false),
            command: command.to_string(),
            args,
            env,
            cwd,
            timeout,
            writer: Mutex::new(None),
        })
    }

    /// Spawn the subprocess and run the `initialize` handshake
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be spawned or the handshake fails.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(ref cwd) = self.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Transport(format!("Failed to spawn '{}': {e}", self.command)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Transport("Failed to get stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Transport("Failed to get stdout".to_string()))?;
        let stderr = child.stderr.take();

        *self.writer.lock().await = Some(stdin);
        *self.child.lock().await = Some(child);

        let transport = Arc::clone(self);
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout).lines();

            while let Ok(Some(line)) = reader.next_line().await {
                if let Err(e) = transport.handle_response(&line) {
                    error!(command = %transport.command, error = %e, "Failed to handle response");
                }
            }

            transport.connected.store(false, Ordering::Relaxed);
            // Wake every caller still waiting on this process
            transport.pending.clear();
            debug!(command = %transport.command, "Stdio reader task ended");
        });

        // Tool servers log to stderr; keep it out of the protocol stream
        if let Some(stderr) = stderr {
            let command = self.command.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    trace!(command = %command, "{line}");
                }
            });
        }

        self.initialize().await
    }

    /// Initialize the MCP connection
    async fn initialize(&self) -> Result<()> {
        let response = self.request("initialize", Some(initialize_params())).await?;

        if let Some(err) = response.error {
            return Err(Error::Protocol(format!("Initialize failed: {}", err.message)));
        }

        self.notify("notifications/initialized", None).await?;

        self.connected.store(true, Ordering::Relaxed);
        debug!(command = %self.command, "Stdio transport initialized");

        Ok(())
    }

    /// Handle a response line from stdout
    fn handle_response(&self, line: &str) -> Result<()> {
        let response: JsonRpcResponse = serde_json::from_str(line)?;

        if let Some(ref id) = response.id {
            if let Some((_, sender)) = self.pending.remove(&id.to_string()) {
                let _ = sender.send(response);
            }
        }

        Ok(())
    }

    /// Write a message to stdin
    async fn write_message(&self, message: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let stdin = writer
            .as_mut()
            .ok_or_else(|| Error::Transport("Not connected".to_string()))?;

        stdin
            .write_all(message.as_bytes())
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        stdin
            .flush()
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }

    /// Get next request ID
    fn next_id(&self) -> RequestId {
        RequestId::Number(self.request_id.fetch_add(1, Ordering::Relaxed))
    }
}

/// Entry in the pending map, removed again when dropped
///
/// A request future that is dropped before its response arrives (the stream
/// consumer went away) must not leave its sender behind.
struct PendingEntry<'a> {
    pending: &'a DashMap<String, oneshot::Sender<JsonRpcResponse>>,
    key: String,
}

impl<'a> PendingEntry<'a> {
    fn insert(
        pending: &'a DashMap<String, oneshot::Sender<JsonRpcResponse>>,
        key: String,
        sender: oneshot::Sender<JsonRpcResponse>,
    ) -> Self {
        pending.insert(key.clone(), sender);
        Self { pending, key }
    }
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.key);
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse> {
        let id = self.next_id();
        let request = JsonRpcRequest::new(id.clone(), method, params);

        let (tx, rx) = oneshot::channel();
        let _pending = PendingEntry::insert(&self.pending, id.to_string(), tx);

        let message = serde_json::to_string(&request)?;
        self.write_message(&message).await?;

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::Transport("Response channel closed".to_string())),
            Err(_) => Err(Error::BackendTimeout(format!(
                "{method} timed out after {}s",
                self.timeout.as_secs()
            ))),
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params
        });

        let message = serde_json::to_string(&notification)?;
        self.write_message(&message).await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::Relaxed);

        // Closing stdin lets well-behaved servers exit on their own
        *self.writer.lock().await = None;

        if let Some(mut child) = self.child.lock().await.take() {
            if let Ok(Some(status)) = child.try_wait() {
                debug!(command = %self.command, %status, "Backend process already exited");
                return Ok(());
            }
            child
                .kill()
                .await
                .map_err(|e| Error::Transport(format!("Failed to kill '{}': {e}", self.command)))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_failure_is_transport_error() {
        let transport = StdioTransport::new(
            "/nonexistent/mcp-dispatch-test-binary",
            vec![],
            HashMap::new(),
            None,
            Duration::from_secs(1),
        );
        let err = transport.start().await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_request_without_process_fails() {
        let transport =
            StdioTransport::new("cat", vec![], HashMap::new(), None, Duration::from_secs(1));
        let err = transport.request("tools/list", None).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert!(transport.pending.is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_request_leaves_no_pending_entry() {
        let transport =
            StdioTransport::new("sleep", vec![], HashMap::new(), None, Duration::from_secs(30));
        let mut child = Command::new("sleep")
            .arg("5")
            .stdin(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        *transport.writer.lock().await = child.stdin.take();

        let abandoned =
            tokio::time::timeout(Duration::from_millis(50), transport.request("tools/list", None))
                .await;
        assert!(abandoned.is_err());
        assert!(transport.pending.is_empty());

        child.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let transport =
            StdioTransport::new("cat", vec![], HashMap::new(), None, Duration::from_secs(1));
        transport.close().await.unwrap();
        transport.close().await.unwrap();
    }
}
