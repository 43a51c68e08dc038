//! Messaging platform webhook ingestion
//!
//! Verifies the HMAC-SHA256 signature of an inbound batch of events, turns
//! each event into a reply request and submits it to the dispatcher without
//! waiting for the outcome.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::dispatcher::Dispatcher;
use super::router::AppState;
use crate::config::WebhookConfig;
use crate::pipeline::Envelope;
use crate::{Error, Result};

/// Verify a base64 HMAC-SHA256 signature over the raw request body
///
/// # Errors
///
/// Returns [`Error::Signature`] if the secret is empty, the signature is
/// missing, or it does not match.
pub fn verify_signature(body: &[u8], signature: Option<&str>, secret: &str) -> Result<()> {
    use hmac::{KeyInit, Mac};
    use sha2::Sha256;

    if secret.is_empty() {
        return Err(Error::Signature("No secret configured".to_string()));
    }
    let signature = signature
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::Signature("Missing signature header".to_string()))?;

    let mut mac = hmac::Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::Signature(format!("Invalid secret: {e}")))?;
    mac.update(body);
    let computed = STANDARD.encode(mac.finalize().into_bytes().as_slice());

    if computed.as_bytes().ct_eq(signature.as_bytes()).into() {
        Ok(())
    } else {
        Err(Error::Signature("Signature mismatch".to_string()))
    }
}

/// Inbound event batch
#[derive(Debug, Deserialize)]
struct EventBatch {
    #[serde(default)]
    events: Vec<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventSource {
    user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum MessageBody {
    Text {
        #[serde(default)]
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum PlatformEvent {
    Message {
        #[serde(default)]
        source: EventSource,
        message: MessageBody,
    },
    Follow {
        #[serde(default)]
        source: EventSource,
    },
    Unfollow {
        #[serde(default)]
        source: EventSource,
    },
    #[serde(other)]
    Other,
}

/// What happened to each event of a batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    /// Events in the batch
    pub received: usize,
    /// Events that produced a reply dispatch
    pub dispatched: usize,
    /// Events that were only logged
    pub ignored: usize,
}

/// Webhook event ingestor
pub struct WebhookIngestor {
    config: WebhookConfig,
    secret: String,
    dispatcher: Arc<Dispatcher>,
}

impl WebhookIngestor {
    /// Create an ingestor, resolving the channel secret
    #[must_use]
    pub fn new(config: WebhookConfig, dispatcher: Arc<Dispatcher>) -> Self {
        let secret = config.resolve_secret();
        if secret.is_empty() {
            warn!(path = %config.path, "Webhook channel secret is empty, every delivery will be rejected");
        }
        Self {
            config,
            secret,
            dispatcher,
        }
    }

    /// Name of the signature header
    #[must_use]
    pub fn signature_header(&self) -> &str {
        &self.config.signature_header
    }

    /// Verify and process one delivery
    ///
    /// Reply dispatches run in the background; this returns as soon as they
    /// are submitted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Signature`] if verification fails (nothing is
    /// dispatched) or [`Error::Decode`] if the body is not an event batch.
    pub fn ingest(&self, body: &[u8], signature: Option<&str>) -> Result<IngestReport> {
        verify_signature(body, signature, &self.secret)?;

        let batch: EventBatch =
            serde_json::from_slice(body).map_err(|e| Error::Decode(e.to_string()))?;

        let mut report = IngestReport {
            received: batch.events.len(),
            ..Default::default()
        };

        for raw in batch.events {
            match self.reply_for(raw) {
                Some(envelope) => {
                    self.dispatcher.submit(envelope);
                    report.dispatched += 1;
                }
                None => report.ignored += 1,
            }
        }

        Ok(report)
    }

    /// Reply request for an event, if it warrants one
    fn reply_for(&self, raw: Value) -> Option<Envelope> {
        let event = match serde_json::from_value::<PlatformEvent>(raw) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Skipping malformed webhook event");
                return None;
            }
        };

        match event {
            PlatformEvent::Message {
                source,
                message: MessageBody::Text { text },
            } => {
                let user_id = Self::user(source, "message")?;
                info!(user_id = %user_id, "Received text message");
                let reply = self.config.reply_template.replace("{text}", &text);
                Some(self.reply_envelope(&user_id, &reply))
            }
            PlatformEvent::Message { .. } => {
                debug!("Ignoring non-text message");
                None
            }
            PlatformEvent::Follow { source } => {
                let user_id = Self::user(source, "follow")?;
                info!(user_id = %user_id, "New follower");
                Some(self.reply_envelope(&user_id, &self.config.welcome_message))
            }
            PlatformEvent::Unfollow { source } => {
                info!(user_id = source.user_id.as_deref().unwrap_or("unknown"), "User unfollowed");
                None
            }
            PlatformEvent::Other => {
                debug!("Ignoring unsupported event type");
                None
            }
        }
    }

    fn user(source: EventSource, kind: &str) -> Option<String> {
        let user_id = source.user_id.filter(|id| !id.is_empty());
        if user_id.is_none() {
            warn!(event = kind, "Event has no user id, cannot reply");
        }
        user_id
    }

    /// Request that sends `message` to `user_id` through the reply server
    #[must_use]
    pub fn reply_envelope(&self, user_id: &str, message: &str) -> Envelope {
        let server = self.config.reply_server.clone();

        let mut client_details = Map::new();
        client_details.insert("tool".to_string(), json!(self.config.reply_tool));
        client_details.insert(
            "arguments".to_string(),
            json!({ "to": user_id, "message": message }),
        );
        client_details.insert(
            "input".to_string(),
            json!(format!("Send a text message '{message}' to user {user_id}")),
        );

        Envelope {
            client_details,
            selected_client: Some(self.config.reply_client.clone()),
            selected_servers: vec![server.clone()],
            selected_server_credentials: HashMap::from([(
                server,
                self.config.reply_credentials.clone(),
            )]),
        }
        .with_stream_flag(false)
    }
}

/// POST handler for the webhook route
pub async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let Some(ingestor) = state.ingestor.as_ref() else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Webhook not enabled" })),
        );
    };

    let delivery_id = Uuid::new_v4();
    let signature = headers
        .get(ingestor.signature_header())
        .and_then(|v| v.to_str().ok());

    match ingestor.ingest(&body, signature) {
        Ok(report) => {
            info!(
                delivery_id = %delivery_id,
                received = report.received,
                dispatched = report.dispatched,
                ignored = report.ignored,
                "Webhook processed"
            );
            (StatusCode::OK, Json(json!({ "status": "success" })))
        }
        Err(e @ Error::Signature(_)) => {
            warn!(delivery_id = %delivery_id, error = %e, "Webhook signature validation failed");
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "Invalid signature" })),
            )
        }
        Err(e) => {
            warn!(delivery_id = %delivery_id, error = %e, "Rejected webhook body");
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": e.to_string() })),
            )
        }
    }
}
