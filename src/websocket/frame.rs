use crate::config::WebSocketConfig;
use crate::metrics::WsMetrics;

/// Result of measuring one inbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameVerdict {
    Accepted,
    /// Allowed, but at or above the warning threshold
    Warning,
    TooLarge,
}

#[derive(Debug, Clone, Copy)]
pub struct FrameValidator {
    max_frame_size: usize,
    warn_threshold: usize,
}

impl FrameValidator {
    pub fn new(max_frame_size: usize, warn_threshold: usize) -> Self {
        Self {
            max_frame_size,
            warn_threshold,
        }
    }

    pub fn from_config(config: &WebSocketConfig) -> Self {
        Self::new(config.max_frame_size, config.warn_threshold)
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    fn classify(&self, len: usize) -> FrameVerdict {
        if len > self.max_frame_size {
            FrameVerdict::TooLarge
        } else if len >= self.warn_threshold {
            FrameVerdict::Warning
        } else {
            FrameVerdict::Accepted
        }
    }

    pub fn check(&self, len: usize) -> FrameVerdict {
        let verdict = self.classify(len);
        match verdict {
            FrameVerdict::TooLarge => WsMetrics::frame_rejected(),
            FrameVerdict::Warning => {
                WsMetrics::frame_warning();
                tracing::debug!(
                    frame_size = len,
                    warn_threshold = self.warn_threshold,
                    "Large inbound frame"
                );
            }
            FrameVerdict::Accepted => {}
        }
        verdict
    }

    /// Measure a frame the server is about to send. Nothing is refused:
    /// an oversized frame is logged and counted, and the peer applies its
    /// own limit.
    pub fn check_outbound(&self, len: usize) -> FrameVerdict {
        let verdict = self.classify(len);
        match verdict {
            FrameVerdict::TooLarge => {
                WsMetrics::outbound_frame("oversized");
                tracing::warn!(
                    frame_size = len,
                    max_frame_size = self.max_frame_size,
                    "Outbound frame exceeds the maximum frame size"
                );
            }
            FrameVerdict::Warning => {
                WsMetrics::outbound_frame("warning");
                tracing::debug!(
                    frame_size = len,
                    warn_threshold = self.warn_threshold,
                    "Large outbound frame"
                );
            }
            FrameVerdict::Accepted => {}
        }
        verdict
    }
}

/// Why the server closes a WebSocket connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsCloseReason {
    Normal,
    HeartbeatTimeout,
    ServerShutdown,
    /// Malformed message, or a binary frame on an uncompressed connection
    ProtocolViolation,
    /// Inflated payload is not valid UTF-8
    InvalidPayload,
    FrameTooLarge,
}

impl WsCloseReason {
    pub fn code(&self) -> u16 {
        match self {
            WsCloseReason::Normal => 1000,
            WsCloseReason::HeartbeatTimeout | WsCloseReason::ServerShutdown => 1001,
            WsCloseReason::ProtocolViolation => 1002,
            WsCloseReason::InvalidPayload => 1007,
            WsCloseReason::FrameTooLarge => 1009,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            WsCloseReason::Normal => "normal closure",
            WsCloseReason::HeartbeatTimeout => "heartbeat timeout",
            WsCloseReason::ServerShutdown => "server shutting down",
            WsCloseReason::ProtocolViolation => "protocol violation",
            WsCloseReason::InvalidPayload => "invalid payload",
            WsCloseReason::FrameTooLarge => "frame too large",
        }
    }
}
