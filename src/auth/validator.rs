use serde::Serialize;

use crate::error::AppError;

/// Authenticated user bound to a WebSocket session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub user_id: String,
    pub tier: Option<String>,
}

/// Validates the token presented at upgrade time
pub trait TokenValidator: Send + Sync {
    fn validate(&self, token: &str) -> Result<Identity, AppError>;
}
