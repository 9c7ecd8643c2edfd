//! Authentication configuration.

use tracing::warn;

use crate::EntityId;

/// Authentication configuration.
#[derive(Clone, Debug)]
pub struct AuthConfig {
    /// Entity id this endpoint identifies as during key exchange.
    pub local_entity_id: EntityId,
    /// Number of slots in each peer's inbound UDP replay window.
    pub replay_slots: usize,
    /// Largest counter jump a replay slot accepts.
    pub replay_max_gap: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            local_entity_id: 0,
            replay_slots: 64,
            replay_max_gap: 1024,
        }
    }
}

impl AuthConfig {
    /// Create config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            local_entity_id: env_or("AUTH_LOCAL_ENTITY_ID", defaults.local_entity_id),
            replay_slots: env_or("AUTH_REPLAY_SLOTS", defaults.replay_slots),
            replay_max_gap: env_or("AUTH_REPLAY_MAX_GAP", defaults.replay_max_gap),
        }
    }
}

/// Parse `key` from the environment, keeping `default` when unset or invalid.
pub(crate) fn env_or<T: std::str::FromStr + std::fmt::Debug>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("Ignoring invalid {}={:?}, using {:?}", key, raw, default);
            default
        }),
        Err(_) => default,
    }
}
