//! Stream bridge between the dispatch pipeline and a streaming response
//!
//! A bridge is a single-producer/single-consumer FIFO of [`Frame`]s. The
//! dispatcher holds the [`FrameSink`] and the HTTP response writer holds the
//! [`FrameSource`]. Pipeline stages only get a [`ProgressSink`], which cannot
//! open or end the stream. Frames come out of the source in exactly the order
//! they were sent.

use std::time::Duration;

use async_stream::stream;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

/// Lifecycle position of a frame within its stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamingStatus {
    /// First frame of every stream
    #[serde(rename = "STARTED")]
    Started,
    /// Progress or result frame
    #[serde(rename = "IN-PROGRESS")]
    InProgress,
    /// Validation or execution failed
    #[serde(rename = "ERROR")]
    Error,
    /// Terminal frame
    #[serde(rename = "COMPLETED")]
    Completed,
}

/// What the client is expected to do with a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameAction {
    /// Informational only
    #[serde(rename = "NO-ACTION")]
    NoAction,
    /// Frame carries the tool result
    #[serde(rename = "AI-RESPONSE")]
    AiResponse,
    /// Frame carries an error
    #[serde(rename = "ERROR")]
    Error,
}

/// One unit of the streaming protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Frame {
    /// Result or progress payload
    pub data: Value,
    /// Error message
    pub error: Option<String>,
    /// Whether the frame reports success
    pub status: bool,
    /// Lifecycle position
    pub streaming_status: StreamingStatus,
    /// Client action hint
    pub action: FrameAction,
}

impl Frame {
    /// Stream opening frame
    #[must_use]
    pub fn started() -> Self {
        Self {
            data: Value::Null,
            error: None,
            status: true,
            streaming_status: StreamingStatus::Started,
            action: FrameAction::NoAction,
        }
    }

    /// Intermediate progress emitted by a pipeline stage
    #[must_use]
    pub fn progress(data: Value) -> Self {
        Self {
            data,
            error: None,
            status: true,
            streaming_status: StreamingStatus::InProgress,
            action: FrameAction::NoAction,
        }
    }

    /// Final tool result
    #[must_use]
    pub fn ai_response(data: Value) -> Self {
        Self {
            data,
            error: None,
            status: true,
            streaming_status: StreamingStatus::InProgress,
            action: FrameAction::AiResponse,
        }
    }

    /// Validation or execution failure
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            data: Value::Null,
            error: Some(message.into()),
            status: false,
            streaming_status: StreamingStatus::Error,
            action: FrameAction::Error,
        }
    }

    /// Terminal frame; sent after success and after errors alike
    #[must_use]
    pub fn completed() -> Self {
        Self {
            data: Value::Null,
            error: None,
            status: true,
            streaming_status: StreamingStatus::Completed,
            action: FrameAction::NoAction,
        }
    }

    /// Whether no frame may follow this one
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.streaming_status == StreamingStatus::Completed
    }
}

/// Item carried by the bridge channel
#[derive(Debug)]
enum Signal {
    Frame(Frame),
    End,
}

/// The consumer side of the bridge is gone
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("stream consumer disconnected")]
pub struct SinkClosed;

/// Write end of a bridge
#[derive(Debug, Clone)]
pub struct FrameSink {
    tx: mpsc::Sender<Signal>,
}

impl FrameSink {
    /// Queue a frame
    ///
    /// Suspends only if the buffer is full.
    ///
    /// # Errors
    ///
    /// Returns [`SinkClosed`] if the source has been dropped.
    pub async fn send(&self, frame: Frame) -> Result<(), SinkClosed> {
        self.tx.send(Signal::Frame(frame)).await.map_err(|_| SinkClosed)
    }

    /// Signal end of stream and release this sink
    pub async fn close(self) {
        let _ = self.tx.send(Signal::End).await;
    }

    /// Whether the source has been dropped
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Progress handle given to the validation and execution stages
///
/// Only progress frames (IN-PROGRESS, NO-ACTION) get through. Lifecycle,
/// result and error frames belong to the dispatcher and are dropped.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    sink: FrameSink,
}

impl ProgressSink {
    /// Wrap the write end of a bridge
    #[must_use]
    pub fn new(sink: FrameSink) -> Self {
        Self { sink }
    }

    /// Emit a progress frame carrying `data`
    ///
    /// # Errors
    ///
    /// Returns [`SinkClosed`] if the source has been dropped.
    pub async fn progress(&self, data: Value) -> Result<(), SinkClosed> {
        self.sink.send(Frame::progress(data)).await
    }

    /// Queue `frame` if it is a progress frame
    ///
    /// # Errors
    ///
    /// Returns [`SinkClosed`] if the source has been dropped.
    pub async fn send(&self, frame: Frame) -> Result<(), SinkClosed> {
        if frame.streaming_status != StreamingStatus::InProgress
            || frame.action != FrameAction::NoAction
        {
            warn!(
                streaming_status = ?frame.streaming_status,
                action = ?frame.action,
                "Dropping non-progress frame sent by a pipeline stage"
            );
            return Ok(());
        }
        self.sink.send(frame).await
    }

    /// Whether the source has been dropped
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sink.is_closed()
    }
}

/// Why a [`FrameSource`] stopped yielding frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// A terminal frame was delivered
    Terminal,
    /// The producer closed the sink (or dropped every handle)
    Closed,
    /// No frame arrived within the idle timeout; no terminal frame was sent
    IdleTimeout,
}

/// Read end of a bridge
#[derive(Debug)]
pub struct FrameSource {
    rx: mpsc::Receiver<Signal>,
    idle_timeout: Duration,
    ended: Option<EndReason>,
    /// Cancels the producer when the source is dropped
    cancel_guard: Option<DropGuard>,
}

impl FrameSource {
    /// Next frame, or `None` once the stream has ended
    ///
    /// Waits at most the idle timeout for each frame.
    pub async fn next(&mut self) -> Option<Frame> {
        if self.ended.is_some() {
            return None;
        }

        match tokio::time::timeout(self.idle_timeout, self.rx.recv()).await {
            Ok(Some(Signal::Frame(frame))) => {
                if frame.is_terminal() {
                    self.ended = Some(EndReason::Terminal);
                }
                Some(frame)
            }
            Ok(Some(Signal::End) | None) => {
                self.ended = Some(EndReason::Closed);
                None
            }
            Err(_) => {
                debug!(
                    idle_timeout_ms = self.idle_timeout.as_millis(),
                    "No frame within idle timeout, closing stream"
                );
                self.ended = Some(EndReason::IdleTimeout);
                None
            }
        }
    }

    /// Why the stream ended, if it has
    #[must_use]
    pub fn end_reason(&self) -> Option<EndReason> {
        self.ended
    }

    /// Cancel `token` when this source is dropped
    pub fn cancel_on_drop(&mut self, token: CancellationToken) {
        self.cancel_guard = Some(token.drop_guard());
    }

    /// Convert into a stream of frames
    pub fn into_stream(mut self) -> impl Stream<Item = Frame> + Send {
        stream! {
            while let Some(frame) = self.next().await {
                yield frame;
            }
        }
    }
}

/// Create a bridge with room for `buffer` queued frames
///
/// # Panics
///
/// Panics if `buffer` is zero.
#[must_use]
pub fn bridge(buffer: usize, idle_timeout: Duration) -> (FrameSink, FrameSource) {
    let (tx, rx) = mpsc::channel(buffer);
    (
        FrameSink { tx },
        FrameSource {
            rx,
            idle_timeout,
            ended: None,
            cancel_guard: None,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_frame_wire_format() {
        let frame = serde_json::to_value(Frame::ai_response(json!(42))).unwrap();
        assert_eq!(
            frame,
            json!({
                "Data": 42,
                "Error": null,
                "Status": true,
                "StreamingStatus": "IN-PROGRESS",
                "Action": "AI-RESPONSE"
            })
        );

        let frame = serde_json::to_value(Frame::error("boom")).unwrap();
        assert_eq!(frame["StreamingStatus"], "ERROR");
        assert_eq!(frame["Action"], "ERROR");
        assert_eq!(frame["Status"], false);
        assert_eq!(frame["Error"], "boom");

        let frame = serde_json::to_value(Frame::completed()).unwrap();
        assert_eq!(frame["StreamingStatus"], "COMPLETED");
        assert_eq!(frame["Action"], "NO-ACTION");
    }

    #[tokio::test]
    async fn test_frames_arrive_in_send_order() {
        let (sink, mut source) = bridge(16, Duration::from_secs(1));
        for i in 0..10 {
            sink.send(Frame::progress(json!(i))).await.unwrap();
        }
        sink.close().await;

        for i in 0..10 {
            assert_eq!(source.next().await.unwrap().data, json!(i));
        }
        assert!(source.next().await.is_none());
        assert_eq!(source.end_reason(), Some(EndReason::Closed));
    }

    #[tokio::test]
    async fn test_nothing_follows_terminal_frame() {
        let (sink, source) = bridge(16, Duration::from_secs(1));
        sink.send(Frame::started()).await.unwrap();
        sink.send(Frame::completed()).await.unwrap();
        sink.send(Frame::progress(json!("late"))).await.unwrap();
        sink.close().await;

        let frames: Vec<_> = source.into_stream().collect().await;
        assert_eq!(frames, vec![Frame::started(), Frame::completed()]);
    }

    #[tokio::test]
    async fn test_idle_timeout_ends_silently() {
        let (sink, mut source) = bridge(16, Duration::from_millis(50));
        sink.send(Frame::started()).await.unwrap();

        assert_eq!(source.next().await, Some(Frame::started()));
        assert!(source.next().await.is_none());
        assert_eq!(source.end_reason(), Some(EndReason::IdleTimeout));
        drop(sink);
    }

    #[tokio::test]
    async fn test_dropping_every_sink_ends_stream() {
        let (sink, mut source) = bridge(4, Duration::from_secs(5));
        let clone = sink.clone();
        drop(sink);
        drop(clone);
        assert!(source.next().await.is_none());
        assert_eq!(source.end_reason(), Some(EndReason::Closed));
    }

    #[tokio::test]
    async fn test_send_after_source_dropped_fails() {
        let (sink, source) = bridge(4, Duration::from_secs(1));
        drop(source);
        assert!(sink.is_closed());
        assert_eq!(sink.send(Frame::started()).await, Err(SinkClosed));
    }

    #[tokio::test]
    async fn test_progress_sink_only_passes_progress() {
        let (sink, source) = bridge(16, Duration::from_secs(1));
        let progress = ProgressSink::new(sink.clone());

        progress.send(Frame::started()).await.unwrap();
        progress.send(Frame::progress(json!(1))).await.unwrap();
        progress.send(Frame::ai_response(json!("early"))).await.unwrap();
        progress.send(Frame::error("early")).await.unwrap();
        progress.send(Frame::completed()).await.unwrap();
        progress.progress(json!(2)).await.unwrap();
        drop(progress);
        sink.close().await;

        let frames: Vec<_> = source.into_stream().collect().await;
        assert_eq!(frames, vec![Frame::progress(json!(1)), Frame::progress(json!(2))]);
    }

    #[tokio::test]
    async fn test_dropping_source_cancels_token() {
        let (_sink, mut source) = bridge(4, Duration::from_secs(1));
        let token = CancellationToken::new();
        source.cancel_on_drop(token.clone());
        assert!(!token.is_cancelled());
        drop(source);
        assert!(token.is_cancelled());
    }
}
