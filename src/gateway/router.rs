//! HTTP router and handlers

use std::any::Any;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, State},
    http::{HeaderValue, Response, StatusCode, Version, header},
    response::{
        IntoResponse,
        sse::{Event, Sse},
    },
    routing::{get, post},
};
use futures::StreamExt;
use serde_json::{Value, json};
use tower_http::{catch_panic::CatchPanicLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::{error, warn};

use super::dispatcher::{DispatchResponse, Dispatcher};
use super::webhooks::{WebhookIngestor, webhook_handler};
use crate::backend::BackendRegistry;

/// Shared application state
pub struct AppState {
    /// Backend registry
    pub registry: Arc<BackendRegistry>,
    /// Request dispatcher
    pub dispatcher: Arc<Dispatcher>,
    /// Webhook ingestor, when the webhook route is mounted
    pub ingestor: Option<Arc<WebhookIngestor>>,
    /// Webhook route path
    pub webhook_path: String,
}

/// Create the router
pub fn create_router(state: Arc<AppState>, max_body_size: usize) -> Router {
    let mut router = Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/api/v1/mcp/process_message", post(process_message_handler))
        .route(
            "/api/v1/mcp/process_message_stream",
            post(process_message_stream_handler),
        );

    if state.ingestor.is_some() {
        router = router.route(&state.webhook_path, post(webhook_handler));
    }

    router
        .layer(DefaultBodyLimit::max(max_body_size))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Decode a request body; an empty body counts as `{}`
fn decode_body(body: &[u8]) -> Result<Value, DispatchResponse> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(json!({}));
    }
    serde_json::from_slice(body).map_err(|e| DispatchResponse::failure(format!("Invalid JSON: {e}")))
}

fn server_error(response: DispatchResponse) -> axum::response::Response {
    (StatusCode::INTERNAL_SERVER_ERROR, Json(response)).into_response()
}

/// POST /api/v1/mcp/process_message
async fn process_message_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> impl IntoResponse {
    let raw = match decode_body(&body) {
        Ok(raw) => raw,
        Err(response) => {
            warn!(error = ?response.error, "Rejected request body");
            return server_error(response);
        }
    };

    match state.dispatcher.handle_value(raw).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => {
            error!(error = %e, "Request processing failed");
            server_error(DispatchResponse::failure(e.to_string()))
        }
    }
}

/// POST /api/v1/mcp/process_message_stream - SSE stream of frames
async fn process_message_stream_handler(
    State(state): State<Arc<AppState>>,
    version: Version,
    body: Bytes,
) -> impl IntoResponse {
    let raw = match decode_body(&body) {
        Ok(raw) => raw,
        Err(response) => {
            warn!(error = ?response.error, "Rejected request body");
            return server_error(response);
        }
    };

    let source = match state.dispatcher.handle_stream_value(raw) {
        Ok(source) => source,
        Err(e) => {
            warn!(error = %e, "Rejected streaming request");
            return server_error(DispatchResponse::failure(e.to_string()));
        }
    };

    let events = source
        .into_stream()
        .map(|frame| Event::default().json_data(frame));

    let mut response = (
        [(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("Content-Type"),
        )],
        Sse::new(events),
    )
        .into_response();
    // Connection-specific headers are forbidden in HTTP/2 and later
    if version <= Version::HTTP_11 {
        response
            .headers_mut()
            .insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    }
    response
}

/// GET /status
async fn status_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "active",
        "mcp_servers": state.registry.live_names(),
        "backends": state.registry.statuses(),
        "webhook_path": state.ingestor.as_ref().map(|_| state.webhook_path.as_str()),
    }))
}

/// GET /health
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "backends": state.registry.live_names().len(),
    }))
}

/// Panics surface as a 500 in the regular response shape
fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response<Body> {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!(panic = %detail, "Handler panicked");
    server_error(DispatchResponse::failure("Internal server error"))
}
