//! Scripted pipeline stages shared by the integration tests
//!
//! The validator rejects requests carrying `client_details.reject`; the
//! executor behaves according to the requested tool name.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use mcp_dispatch::config::StreamingConfig;
use mcp_dispatch::gateway::{
    Dispatcher, EndReason, Frame, FrameSource, ProgressSink, StreamingStatus,
};
use mcp_dispatch::pipeline::{Envelope, Executor, Payload, Validator};
use mcp_dispatch::{Error, Result};
use parking_lot::Mutex;
use serde_json::{Map, Value, json};

/// Records every envelope it sees
#[derive(Default)]
pub struct RecordingValidator {
    pub seen: Mutex<Vec<Envelope>>,
}

#[async_trait]
impl Validator for RecordingValidator {
    async fn validate(&self, envelope: Envelope, _sink: Option<&ProgressSink>) -> Result<Payload> {
        self.seen.lock().push(envelope.clone());

        if let Some(reason) = envelope.client_details.get("reject").and_then(Value::as_str) {
            return Err(Error::validation(reason));
        }

        let tool = envelope
            .client_details
            .get("tool")
            .and_then(Value::as_str)
            .unwrap_or("answer")
            .to_string();

        Ok(Payload {
            client: envelope.selected_client.clone().unwrap_or_default(),
            servers: Vec::new(),
            tool,
            arguments: Map::new(),
            client_details: envelope.client_details,
        })
    }
}

/// Sets a flag if the execution future is dropped before it finishes
struct AbandonGuard {
    flag: Arc<AtomicBool>,
    armed: bool,
}

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        if self.armed {
            self.flag.store(true, Ordering::SeqCst);
        }
    }
}

/// Tool names: `answer`, `fail`, `crash`, `progress`, `hang`, `panic`, and
/// `restart`/`finish-early`, which try to send lifecycle frames before
/// answering 42
#[derive(Default)]
pub struct ScriptedExecutor {
    pub started: AtomicUsize,
    pub finished: AtomicUsize,
    pub abandoned: Arc<AtomicBool>,
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn execute(&self, payload: Payload, sink: Option<&ProgressSink>) -> Result<Value> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let mut guard = AbandonGuard {
            flag: Arc::clone(&self.abandoned),
            armed: true,
        };

        let result = match payload.tool.as_str() {
            "answer" => Ok(json!(42)),
            "fail" => Err(Error::execution("tool exploded")),
            "crash" => Err(Error::Transport("backend pipe closed".to_string())),
            "progress" => {
                if let Some(sink) = sink {
                    for step in 1..=3 {
                        let _ = sink.send(Frame::progress(json!({ "step": step }))).await;
                    }
                }
                Ok(json!("done"))
            }
            "restart" | "finish-early" => {
                if let Some(sink) = sink {
                    let frame = if payload.tool == "restart" {
                        Frame::started()
                    } else {
                        Frame::completed()
                    };
                    let _ = sink.send(frame).await;
                    let _ = sink.progress(json!({ "step": 1 })).await;
                }
                Ok(json!(42))
            }
            "panic" => panic!("tool handler bug"),
            "hang" => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(Value::Null)
            }
            other => Err(Error::execution(format!("unknown tool {other}"))),
        };

        guard.armed = false;
        self.finished.fetch_add(1, Ordering::SeqCst);
        result
    }
}

pub fn streaming(idle_timeout: Duration) -> StreamingConfig {
    StreamingConfig {
        idle_timeout,
        buffer_size: 16,
    }
}

pub struct Harness {
    pub dispatcher: Arc<Dispatcher>,
    pub validator: Arc<RecordingValidator>,
    pub executor: Arc<ScriptedExecutor>,
}

pub fn harness(idle_timeout: Duration) -> Harness {
    let validator = Arc::new(RecordingValidator::default());
    let executor = Arc::new(ScriptedExecutor::default());
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&validator) as Arc<dyn Validator>,
        Arc::clone(&executor) as Arc<dyn Executor>,
        streaming(idle_timeout),
    ));
    Harness {
        dispatcher,
        validator,
        executor,
    }
}

/// A well-formed request for `tool`, sent with `is_stream: true`
pub fn request(tool: &str) -> Value {
    json!({
        "client_details": { "tool": tool, "is_stream": true },
        "selected_client": "MCP_CLIENT_OPENAI",
        "selected_servers": ["NUMPY_MCP"],
        "selected_server_credentials": { "NUMPY_MCP": {} }
    })
}

pub fn envelope(tool: &str) -> Envelope {
    Envelope::from_value(request(tool)).unwrap()
}

pub async fn collect(mut source: FrameSource) -> (Vec<Frame>, Option<EndReason>) {
    let mut frames = Vec::new();
    while let Some(frame) = source.next().await {
        frames.push(frame);
    }
    let reason = source.end_reason();
    (frames, reason)
}

pub fn statuses(frames: &[Frame]) -> Vec<StreamingStatus> {
    frames.iter().map(|f| f.streaming_status).collect()
}

/// Poll `condition` for up to a second
pub async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
