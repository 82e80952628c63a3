use serde::{Deserialize, Serialize};

use super::Identity;
use crate::error::AppError;

/// Claims carried by gateway access tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User whose endpoint the connection tunnels to
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
    /// Service tier selecting pool quota overrides
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,
}

impl Claims {
    pub fn is_expired(&self) -> bool {
        self.exp < chrono::Utc::now().timestamp()
    }

    /// Blank subjects are rejected; a blank tier means the default quota
    pub fn into_identity(self) -> Result<Identity, AppError> {
        let user_id = self.sub.trim();
        if user_id.is_empty() {
            return Err(AppError::Auth("Token has no subject".to_string()));
        }

        let tier = self
            .tier
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        Ok(Identity {
            user_id: user_id.to_string(),
            tier,
        })
    }
}
