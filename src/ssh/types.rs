use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// HTTP-like request relayed to the private endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardRequest {
    pub id: String,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// UTF-8 body; binary payloads are base64-encoded by the client
    #[serde(default)]
    pub body: String,
}

/// Response produced by the remote forward command
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForwardResponse {
    pub status_code: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: String,
}

/// Point-in-time view of one pooled SSH session
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub id: Uuid,
    pub user_id: String,
    pub channel_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub is_healthy: bool,
    pub total_forwards: u64,
}
