//! Request dispatcher
//!
//! Runs the validation and execution stages for one request, either
//! synchronously (one [`DispatchResponse`]) or as a stream of frames.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use super::bridge::{Frame, FrameSink, FrameSource, ProgressSink, bridge};
use crate::config::StreamingConfig;
use crate::pipeline::{Envelope, Executor, Validator};
use crate::{Error, Result};

/// Result of a synchronous dispatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DispatchResponse {
    /// Result data, null on failure
    pub data: Value,
    /// Error message, null on success
    pub error: Option<String>,
    /// Whether the request succeeded
    pub status: bool,
}

impl DispatchResponse {
    /// Successful outcome
    #[must_use]
    pub fn success(data: Value) -> Self {
        Self {
            data,
            error: None,
            status: true,
        }
    }

    /// Failed outcome
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            data: Value::Null,
            error: Some(message.into()),
            status: false,
        }
    }
}

/// Owns the pipeline stages and every task it spawns
pub struct Dispatcher {
    validator: Arc<dyn Validator>,
    executor: Arc<dyn Executor>,
    streaming: StreamingConfig,
    tasks: TaskTracker,
}

impl Dispatcher {
    /// Create a dispatcher
    #[must_use]
    pub fn new(
        validator: Arc<dyn Validator>,
        executor: Arc<dyn Executor>,
        streaming: StreamingConfig,
    ) -> Self {
        Self {
            validator,
            executor,
            streaming,
            tasks: TaskTracker::new(),
        }
    }

    /// Handle a request and return a single response
    ///
    /// Validation and execution failures come back as `Ok` with
    /// `status == false`.
    ///
    /// # Errors
    ///
    /// Returns an error only for gateway failures (anything that is not a
    /// validation or execution failure).
    pub async fn handle(&self, envelope: Envelope) -> Result<DispatchResponse> {
        let span = info_span!("dispatch", request_id = %Uuid::new_v4(), stream = false);
        async move {
            match self.run_stages(envelope, None).await {
                Ok(data) => {
                    debug!("Request succeeded");
                    Ok(DispatchResponse::success(data))
                }
                Err(e) if e.is_in_band() => {
                    info!(error = %e, "Request failed");
                    Ok(DispatchResponse::failure(e.to_string()))
                }
                Err(e) => {
                    error!(error = %e, "Dispatch failed");
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Handle a decoded request body
    ///
    /// # Errors
    ///
    /// As [`Dispatcher::handle`], plus [`Error::Decode`] if `raw` is not a
    /// well-formed request object.
    pub async fn handle_value(&self, raw: Value) -> Result<DispatchResponse> {
        self.handle(Envelope::from_value(raw)?).await
    }

    /// Handle a request as a stream of frames
    ///
    /// The stages run on a background task. Dropping the returned source
    /// cancels that task.
    pub fn handle_stream(self: &Arc<Self>, envelope: Envelope) -> FrameSource {
        let (sink, mut source) = bridge(self.streaming.buffer_size, self.streaming.idle_timeout);
        let token = CancellationToken::new();
        source.cancel_on_drop(token.clone());

        let dispatcher = Arc::clone(self);
        let span = info_span!("dispatch", request_id = %Uuid::new_v4(), stream = true);
        self.tasks.spawn(
            async move {
                tokio::select! {
                    () = token.cancelled() => debug!("Stream consumer went away, dispatch cancelled"),
                    () = dispatcher.produce(envelope, sink) => {}
                }
            }
            .instrument(span),
        );

        source
    }

    /// Streaming counterpart of [`Dispatcher::handle_value`]
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] if `raw` is not a well-formed request
    /// object; no stream is started.
    pub fn handle_stream_value(self: &Arc<Self>, raw: Value) -> Result<FrameSource> {
        Ok(self.handle_stream(Envelope::from_value(raw)?))
    }

    /// Dispatch without waiting for the outcome, which is only logged
    pub fn submit(self: &Arc<Self>, envelope: Envelope) {
        let dispatcher = Arc::clone(self);
        self.tasks.spawn(async move {
            match dispatcher.handle(envelope).await {
                Ok(response) if response.status => debug!("Background dispatch succeeded"),
                Ok(response) => warn!(
                    error = response.error.as_deref().unwrap_or_default(),
                    "Background dispatch failed"
                ),
                Err(e) => error!(error = %e, "Background dispatch failed"),
            }
        });
    }

    /// Stop accepting background work and wait for what is running
    ///
    /// Returns `false` if tasks were still running after `timeout`.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.tasks.close();
        if self.tasks.is_empty() {
            return true;
        }
        info!(tasks = self.tasks.len(), "Waiting for in-flight dispatches");
        if tokio::time::timeout(timeout, self.tasks.wait()).await.is_ok() {
            true
        } else {
            warn!(tasks = self.tasks.len(), "Dispatches still running after drain timeout");
            false
        }
    }

    /// Frame producer: STARTED, then the outcome, then COMPLETED
    async fn produce(&self, envelope: Envelope, sink: FrameSink) {
        if sink.send(Frame::started()).await.is_err() {
            return;
        }

        let progress = ProgressSink::new(sink.clone());
        let outcome = AssertUnwindSafe(self.run_stages(envelope, Some(&progress)))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(Error::Internal("dispatch task panicked".to_string())));

        let frame = match outcome {
            Ok(data) => {
                debug!("Request succeeded");
                Frame::ai_response(data)
            }
            Err(e) => {
                if e.is_in_band() {
                    info!(error = %e, "Request failed");
                } else {
                    error!(error = %e, "Dispatch failed");
                }
                Frame::error(e.to_string())
            }
        };

        if sink.send(frame).await.is_ok() && sink.send(Frame::completed()).await.is_ok() {
            sink.close().await;
        }
    }

    async fn run_stages(&self, envelope: Envelope, sink: Option<&ProgressSink>) -> Result<Value> {
        let envelope = envelope.with_stream_flag(false);
        let payload = self.validator.validate(envelope, sink).await?;
        self.executor.execute(payload, sink).await
    }
}
