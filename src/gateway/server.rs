//! Gateway server

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

use super::dispatcher::Dispatcher;
use super::router::{AppState, create_router};
use super::webhooks::WebhookIngestor;
use crate::backend::BackendRegistry;
use crate::config::Config;
use crate::pipeline::{Executor, RequestValidator, ToolExecutor, Validator};
use crate::{Error, Result};

/// Dispatch gateway server
pub struct Gateway {
    /// Configuration
    config: Config,
    /// Shared state handed to every handler
    state: Arc<AppState>,
}

impl Gateway {
    /// Open every configured backend and wire up the default stages
    ///
    /// Backends that fail to connect are left out; the gateway still starts.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid; no backend is
    /// started in that case.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let (registry, all_ok) = BackendRegistry::open(config.enabled_backends()).await;
        if !all_ok {
            warn!(
                live = registry.len(),
                configured = config.enabled_backends().len(),
                "Some backends failed to start"
            );
        }
        let registry = Arc::new(registry);

        let validator: Arc<dyn Validator> = Arc::new(RequestValidator::new(
            Arc::clone(&registry),
            config.pipeline.clone(),
        ));
        let executor: Arc<dyn Executor> = Arc::new(ToolExecutor::new(Arc::clone(&registry)));

        Ok(Self::with_stages(config, registry, validator, executor))
    }

    /// Build a gateway over an already opened registry and custom stages
    #[must_use]
    pub fn with_stages(
        config: Config,
        registry: Arc<BackendRegistry>,
        validator: Arc<dyn Validator>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(
            validator,
            executor,
            config.streaming.clone(),
        ));
        let ingestor = config
            .webhook
            .enabled
            .then(|| Arc::new(WebhookIngestor::new(config.webhook.clone(), Arc::clone(&dispatcher))));

        let state = Arc::new(AppState {
            registry,
            dispatcher,
            ingestor,
            webhook_path: config.webhook.path.clone(),
        });

        Self { config, state }
    }

    /// HTTP router over this gateway's state
    #[must_use]
    pub fn router(&self) -> Router {
        create_router(Arc::clone(&self.state), self.config.server.max_body_size)
    }

    /// Serve until a shutdown signal, then release every backend
    ///
    /// # Errors
    ///
    /// Returns an error if the listen address is invalid or cannot be bound,
    /// the server fails, or a backend fails to close.
    pub async fn run(self) -> Result<()> {
        let listener = match self.bind().await {
            Ok(listener) => listener,
            Err(e) => {
                if let Err(close_err) = self.state.registry.close_all().await {
                    error!(error = %close_err, "Failed to release backends after bind failure");
                }
                return Err(e);
            }
        };

        let live = self.state.registry.live_names();
        info!(
            addr = ?listener.local_addr().ok(),
            backends = ?live,
            webhook = self.state.ingestor.as_ref().map(|_| self.config.webhook.path.as_str()),
            "Dispatch gateway listening"
        );
        info!("  POST /api/v1/mcp/process_message");
        info!("  POST /api/v1/mcp/process_message_stream  (SSE)");
        if self.state.ingestor.is_some() {
            info!("  POST {}  (webhook)", self.config.webhook.path);
        }
        info!("  GET  /status, /health");

        let served = axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| Error::Internal(e.to_string()));

        // Background dispatches must finish before their backends go away
        self.state
            .dispatcher
            .drain(self.config.server.shutdown_timeout)
            .await;

        info!("Closing backends");
        let closed = self.state.registry.close_all().await;

        served?;
        closed
    }

    async fn bind(&self) -> Result<TcpListener> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );
        TcpListener::bind(addr).await.map_err(Error::Io)
    }
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
