use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ssh::{ForwardRequest, ForwardResponse};

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Forward(ForwardRequest),
    Ping,
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Forward(_) => "forward",
            ClientMessage::Ping => "ping",
        }
    }
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        connection_id: Uuid,
        user_id: String,
        compression: bool,
    },
    Response {
        id: String,
        #[serde(flatten)]
        response: ForwardResponse,
    },
    /// The endpoint is isolated by the circuit breaker or the relay is stopping
    Unavailable {
        id: String,
        message: String,
    },
    Backpressure {
        id: String,
        retry_after_ms: u64,
        message: String,
    },
    RateLimited {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        retry_after_ms: u64,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        code: String,
        message: String,
    },
    Pong,
}

impl ServerMessage {
    pub fn error(id: Option<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            id,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn response(id: impl Into<String>, response: ForwardResponse) -> Self {
        Self::Response {
            id: id.into(),
            response,
        }
    }

    /// Label used for forward result metrics
    pub fn result_label(&self) -> &'static str {
        match self {
            ServerMessage::Response { .. } => "success",
            ServerMessage::Unavailable { .. } => "unavailable",
            ServerMessage::Backpressure { .. } => "backpressure",
            ServerMessage::RateLimited { .. } => "rate_limited",
            ServerMessage::Error { code, .. } if code == "FORWARD_TIMEOUT" => "timeout",
            ServerMessage::Error { .. } => "error",
            ServerMessage::Connected { .. } | ServerMessage::Pong => "other",
        }
    }
}
