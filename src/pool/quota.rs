use std::collections::HashMap;

use super::types::UserQuota;
use crate::config::{Settings, TierQuota};

/// Resolves a user's limits from the pool defaults and their tier
#[derive(Debug, Clone)]
pub struct QuotaResolver {
    default: UserQuota,
    tiers: HashMap<String, TierQuota>,
}

impl QuotaResolver {
    pub fn new(default: UserQuota, tiers: HashMap<String, TierQuota>) -> Self {
        Self { default, tiers }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            UserQuota {
                max_connections: settings.pool.max_connections_per_user,
                max_channels: settings.ssh.max_channels,
            },
            settings.tiers.clone(),
        )
    }

    pub fn default_quota(&self) -> UserQuota {
        self.default
    }

    pub fn resolve(&self, tier: Option<&str>) -> UserQuota {
        let Some(overrides) = tier.and_then(|t| self.tiers.get(t)) else {
            return self.default;
        };

        UserQuota {
            max_connections: overrides
                .max_connections_per_user
                .filter(|n| *n > 0)
                .unwrap_or(self.default.max_connections),
            max_channels: overrides
                .max_channels
                .filter(|n| *n > 0)
                .unwrap_or(self.default.max_channels),
        }
    }
}
