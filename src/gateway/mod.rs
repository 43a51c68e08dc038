//! Gateway server implementation

pub mod bridge;
mod dispatcher;
mod router;
mod server;
pub mod webhooks;

pub use bridge::{
    EndReason, Frame, FrameAction, FrameSink, FrameSource, ProgressSink, StreamingStatus, bridge,
};
pub use dispatcher::{DispatchResponse, Dispatcher};
pub use router::{AppState, create_router};
pub use server::Gateway;
pub use webhooks::{IngestReport, WebhookIngestor, verify_signature};
