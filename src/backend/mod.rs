//! Backend management
//!
//! The [`BackendRegistry`] owns one [`Backend`] per configured tool server.
//! It is populated once during startup, read concurrently while serving, and
//! torn down once during shutdown.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{BackendConfig, TransportConfig};
use crate::protocol::{JsonRpcResponse, Tool, ToolsCallResult, ToolsListResult};
use crate::transport::{HttpTransport, StdioTransport, Transport};
use crate::{Error, Result};

/// Connection to a single MCP tool server
pub struct Backend {
    /// Backend name
    pub name: String,
    /// Transport
    transport: Arc<dyn Transport>,
    /// Transport type name, for diagnostics
    transport_type: &'static str,
    /// Serializes calls; transports are not assumed to multiplex safely
    call_lock: Mutex<()>,
    /// Cached tool list
    tools_cache: RwLock<Option<Vec<Tool>>>,
    /// Request counter
    request_count: AtomicU64,
}

impl Backend {
    /// Wrap an already connected transport
    #[must_use]
    pub fn new(name: &str, transport: Arc<dyn Transport>, transport_type: &'static str) -> Self {
        Self {
            name: name.to_string(),
            transport,
            transport_type,
            call_lock: Mutex::new(()),
            tools_cache: RwLock::new(None),
            request_count: AtomicU64::new(0),
        }
    }

    /// Open a connection according to `config`
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot be created or the handshake fails.
    pub async fn connect(name: &str, config: &BackendConfig) -> Result<Self> {
        info!(backend = %name, transport = config.transport.transport_type(), "Connecting backend");

        let transport: Arc<dyn Transport> = match &config.transport {
            TransportConfig::Stdio { command, args, cwd } => {
                let transport = StdioTransport::new(
                    command,
                    args.clone(),
                    config.env.clone(),
                    cwd.clone(),
                    config.timeout,
                );
                if let Err(e) = transport.start().await {
                    // Reap the child if it was spawned before the handshake failed
                    let _ = transport.close().await;
                    return Err(e);
                }
                transport
            }
            TransportConfig::Http { http_url } => {
                let transport = HttpTransport::new(http_url, &config.headers, config.timeout)?;
                transport.initialize().await?;
                transport
            }
        };

        Ok(Self::new(name, transport, config.transport.transport_type()))
    }

    /// Whether the underlying transport is connected
    pub fn is_live(&self) -> bool {
        self.transport.is_connected()
    }

    /// Send a request to the backend
    ///
    /// Calls to one backend are serialized.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is not connected or the request fails.
    #[tracing::instrument(skip(self, method, params), fields(backend = %self.name, method = %method))]
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse> {
        if !self.is_live() {
            return Err(Error::BackendUnavailable(self.name.clone()));
        }

        let _guard = self.call_lock.lock().await;
        self.request_count.fetch_add(1, Ordering::Relaxed);

        let start = std::time::Instant::now();
        let result = self.transport.request(method, params).await;
        match &result {
            Ok(_) => debug!(latency_ms = start.elapsed().as_millis(), "Request completed"),
            Err(e) => warn!(error = %e, latency_ms = start.elapsed().as_millis(), "Request failed"),
        }
        result
    }

    /// Get cached tools (or fetch if needed)
    ///
    /// # Errors
    ///
    /// Returns an error if the tools request fails or the backend answers with an error.
    pub async fn list_tools(&self) -> Result<Vec<Tool>> {
        let cached = self.tools_cache.read().clone();
        if let Some(tools) = cached {
            return Ok(tools);
        }

        let response = self.request("tools/list", None).await?;
        if let Some(err) = response.error {
            return Err(Error::Protocol(format!(
                "{}: tools/list failed: {}",
                self.name, err.message
            )));
        }

        let tools = match response.result {
            Some(result) => serde_json::from_value::<ToolsListResult>(result)?.tools,
            None => Vec::new(),
        };

        debug!(backend = %self.name, count = tools.len(), "Tools cached");
        *self.tools_cache.write() = Some(tools.clone());
        Ok(tools)
    }

    /// Invoke a tool
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails, the backend answers with a
    /// JSON-RPC error, or the result cannot be decoded.
    pub async fn call_tool(&self, tool: &str, arguments: Value) -> Result<ToolsCallResult> {
        let response = self
            .request("tools/call", Some(json!({ "name": tool, "arguments": arguments })))
            .await?;

        if let Some(err) = response.error {
            return Err(Error::Protocol(format!(
                "{}/{tool} failed ({}): {}",
                self.name, err.code, err.message
            )));
        }

        let result = response
            .result
            .ok_or_else(|| Error::Protocol(format!("{}/{tool}: empty result", self.name)))?;
        Ok(serde_json::from_value(result)?)
    }

    /// Close the connection
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails to close cleanly.
    pub async fn close(&self) -> Result<()> {
        info!(backend = %self.name, "Closing backend");
        self.transport.close().await
    }

    /// Get backend status
    pub fn status(&self) -> BackendStatus {
        BackendStatus {
            name: self.name.clone(),
            live: self.is_live(),
            transport: self.transport_type.to_string(),
            tools_cached: self.tools_cache.read().as_ref().map_or(0, Vec::len),
            request_count: self.request_count.load(Ordering::Relaxed),
        }
    }
}

/// Backend status information
#[derive(Debug, Clone, serde::Serialize)]
pub struct BackendStatus {
    /// Backend name
    pub name: String,
    /// Whether the connection is live
    pub live: bool,
    /// Transport type
    pub transport: String,
    /// Number of cached tools
    pub tools_cached: usize,
    /// Total request count
    pub request_count: u64,
}

/// Backend registry - owns every open backend connection
///
/// Acts as the aggregate resource guard for startup and shutdown: every
/// successfully opened backend is recorded in open order and released in
/// reverse order by [`BackendRegistry::close_all`].
pub struct BackendRegistry {
    /// Backends by name
    backends: HashMap<String, Arc<Backend>>,
    /// Names in the order they were opened
    open_order: Vec<String>,
    /// Set once `close_all` has run
    closed: AtomicBool,
}

impl BackendRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
            open_order: Vec::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Open every configured backend, best-effort
    ///
    /// Backends that fail to connect are logged and left out. The returned
    /// flag is `true` only if every backend opened.
    pub async fn open<'a, I>(configs: I) -> (Self, bool)
    where
        I: IntoIterator<Item = (&'a String, &'a BackendConfig)>,
    {
        let configs = configs
            .into_iter()
            .map(|(name, config)| (name.clone(), config.clone()))
            .collect();
        Self::open_with(configs, |name, config| async move {
            Backend::connect(&name, &config).await
        })
        .await
    }

    /// Open backends with a custom connector
    ///
    /// Connections are opened sequentially in the given order.
    pub async fn open_with<F, Fut>(configs: Vec<(String, BackendConfig)>, mut connect: F) -> (Self, bool)
    where
        F: FnMut(String, BackendConfig) -> Fut,
        Fut: Future<Output = Result<Backend>>,
    {
        let mut registry = Self::new();
        let mut all_ok = true;

        for (name, config) in configs {
            if registry.backends.contains_key(&name) {
                warn!(backend = %name, "Duplicate backend name, skipping");
                all_ok = false;
                continue;
            }
            match connect(name.clone(), config).await {
                Ok(backend) => {
                    info!(backend = %name, transport = backend.transport_type, "Backend connected");
                    registry.open_order.push(name.clone());
                    registry.backends.insert(name, Arc::new(backend));
                }
                Err(e) => {
                    warn!(backend = %name, error = %e, "Backend failed to connect, omitting");
                    all_ok = false;
                }
            }
        }

        (registry, all_ok)
    }

    /// Get a backend by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Backend>> {
        self.backends.get(name).map(Arc::clone)
    }

    /// Look up a backend by name
    ///
    /// # Errors
    ///
    /// Returns [`Error::BackendNotFound`] if no backend with that name was opened.
    pub fn lookup(&self, name: &str) -> Result<Arc<Backend>> {
        self.get(name)
            .ok_or_else(|| Error::BackendNotFound(name.to_string()))
    }

    /// Names of backends whose connection is live, in open order
    #[must_use]
    pub fn live_names(&self) -> Vec<String> {
        self.open_order
            .iter()
            .filter(|name| self.backends.get(*name).is_some_and(|b| b.is_live()))
            .cloned()
            .collect()
    }

    /// Number of opened backends
    #[must_use]
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Whether no backend was opened
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Get all backend statuses, in open order
    #[must_use]
    pub fn statuses(&self) -> Vec<BackendStatus> {
        self.open_order
            .iter()
            .filter_map(|name| self.backends.get(name))
            .map(|b| b.status())
            .collect()
    }

    /// Close every backend in reverse open order
    ///
    /// Only the first call does any work. A failing backend does not stop the
    /// others from being closed; all failures are reported together.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RegistryClose`] listing every backend that failed to close.
    pub async fn close_all(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("Backends already closed");
            return Ok(());
        }

        let mut failures = Vec::new();
        for name in self.open_order.iter().rev() {
            let Some(backend) = self.backends.get(name) else {
                continue;
            };
            if let Err(e) = backend.close().await {
                warn!(backend = %name, error = %e, "Failed to close backend");
                failures.push(format!("{name}: {e}"));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::RegistryClose(failures))
        }
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BackendRegistry {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) && !self.backends.is_empty() {
            // Stdio children are still reaped through kill_on_drop
            warn!(
                backends = self.backends.len(),
                "Backend registry dropped without close_all"
            );
        }
    }
}
