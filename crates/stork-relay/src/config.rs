//! Relay configuration loaded from environment variables.
//!
//! Every setting has a default so the relay starts with zero configuration
//! for local development.

use std::net::SocketAddr;

use stork_shared::constants::{DEFAULT_RELAY_PORT, SERVICE_NAME};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Socket address for the combined HTTP + WebSocket listener.
    /// Env: `HTTP_ADDR`, or `PORT` to change only the port.
    /// Default: `0.0.0.0:3005`
    pub http_addr: SocketAddr,

    /// Name reported by the health endpoint.
    /// Env: `SERVICE_NAME`
    /// Default: `stork-signaling`
    pub service_name: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_RELAY_PORT).into(),
            service_name: SERVICE_NAME.to_string(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(port) = lookup("PORT") {
            match port.parse::<u16>() {
                Ok(port) => config.http_addr.set_port(port),
                Err(_) => tracing::warn!(value = %port, "Invalid PORT, using default"),
            }
        }

        // HTTP_ADDR wins over PORT when both are set.
        if let Some(addr) = lookup("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(
                    value = %addr,
                    "Invalid HTTP_ADDR, using default"
                );
            }
        }

        if let Some(name) = lookup("SERVICE_NAME") {
            if !name.is_empty() {
                config.service_name = name;
            }
        }

        config
    }
}
