//! WebSocket front end: upgrade, per-connection session state machine,
//! heartbeat, compression, frame limits, and graceful close.

mod compression;
mod frame;
mod handler;
mod message;
mod registry;
mod session;

pub use compression::{CompressionSnapshot, CompressionStats, Compressor, InflateError, Payload};
pub use frame::{FrameValidator, FrameVerdict, WsCloseReason};
pub use handler::{ws_handler, WsQuery};
pub use message::{ClientMessage, ServerMessage};
pub use registry::{CloseAllReport, SessionRegistry};
pub use session::{
    CloseOutcome, ConnectionInfo, LifecycleState, Outbound, WebSocketSession, WsSessionConfig,
};

#[cfg(test)]
pub(crate) use session::tests::{create_test_session, TestPeer};
