use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum SshError {
    /// TCP, handshake, host key or authentication failure. Never retried automatically.
    #[error("SSH connect failed: {0}")]
    Connect(String),

    #[error("Channel limit exceeded ({max} open)")]
    ChannelLimitExceeded { max: u32 },

    #[error("Forward timed out after {0:?}")]
    ForwardTimeout(Duration),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Response exceeded {limit} bytes")]
    ResponseTooLarge { limit: usize },

    #[error("Session is closed")]
    SessionClosed,
}

impl SshError {
    /// Local backpressure, not a fault of the remote endpoint
    pub fn is_backpressure(&self) -> bool {
        matches!(self, SshError::ChannelLimitExceeded { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, SshError::ForwardTimeout(_))
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::Channel(err.to_string())
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::Connect(format!("key error: {}", err))
    }
}
