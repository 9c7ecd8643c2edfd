//! Daemon configuration.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use tracing::warn;

use crate::auth::config::{env_or, AuthConfig};

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// UDP bind address.
    pub bind_addr: SocketAddr,
    /// JSON identity directory. `None` starts with an empty directory.
    pub directory_path: Option<PathBuf>,
    /// Maximum tracked remote addresses.
    pub max_connections: usize,
    /// Receive buffer size; longer datagrams are truncated and fail framing.
    pub recv_buffer: usize,
    /// Handshake settings.
    pub auth: AuthConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 7777)),
            directory_path: None,
            max_connections: 1000,
            recv_buffer: 2048,
            auth: AuthConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Create config from environment variables.
    ///
    /// | variable                | default        |
    /// |-------------------------|----------------|
    /// | `AUTHD_BIND_ADDR`       | `0.0.0.0:7777` |
    /// | `AUTHD_DIRECTORY`       | unset          |
    /// | `AUTHD_MAX_CONNECTIONS` | `1000`         |
    /// | `AUTHD_RECV_BUFFER`     | `2048`         |
    ///
    /// plus the `AUTH_*` variables read by [`AuthConfig::from_env`].
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let recv_buffer = env_or("AUTHD_RECV_BUFFER", defaults.recv_buffer);

        Self {
            bind_addr: env_or("AUTHD_BIND_ADDR", defaults.bind_addr),
            directory_path: std::env::var_os("AUTHD_DIRECTORY").map(PathBuf::from),
            max_connections: env_or("AUTHD_MAX_CONNECTIONS", defaults.max_connections),
            recv_buffer: if recv_buffer == 0 {
                warn!("AUTHD_RECV_BUFFER=0 ignored, using {}", defaults.recv_buffer);
                defaults.recv_buffer
            } else {
                recv_buffer
            },
            auth: AuthConfig::from_env(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), 7777);
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.recv_buffer, 2048);
        assert!(config.directory_path.is_none());
        assert_eq!(config.auth.replay_slots, 64);
    }
}
