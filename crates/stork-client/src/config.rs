//! Client runtime configuration loaded from environment variables.
//!
//! Timeouts and retry bounds come from a [`NetworkProfile`]; constrained
//! (mobile-class) networks get a shorter negotiation window and more,
//! faster reconnect attempts.

use std::path::PathBuf;
use std::time::Duration;

use stork_shared::constants::{DEFAULT_RELAY_PORT, DEFAULT_STUN_SERVERS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkProfile {
    #[default]
    Standard,
    Constrained,
}

impl NetworkProfile {
    pub fn negotiation_timeout(self) -> Duration {
        match self {
            NetworkProfile::Standard => Duration::from_secs(15),
            NetworkProfile::Constrained => Duration::from_secs(10),
        }
    }

    pub fn max_reconnect_attempts(self) -> u32 {
        match self {
            NetworkProfile::Standard => 5,
            NetworkProfile::Constrained => 10,
        }
    }

    /// Backoff unit; attempt `n` waits `n` steps.
    pub fn reconnect_step(self) -> Duration {
        match self {
            NetworkProfile::Standard => Duration::from_secs(2),
            NetworkProfile::Constrained => Duration::from_secs(1),
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "standard" | "desktop" => Some(NetworkProfile::Standard),
            "constrained" | "mobile" => Some(NetworkProfile::Constrained),
            _ => None,
        }
    }
}

/// A STUN or TURN server for direct-channel negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: &str) -> Self {
        Self {
            urls: vec![url.to_string()],
            username: None,
            credential: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay WebSocket URL. `None` runs in local-broadcast-only mode.
    /// Env: `STORK_RELAY_URL` (`off` or empty disables the relay)
    /// Default: `ws://127.0.0.1:3005`
    pub relay_url: Option<String>,

    /// Env: `STORK_NETWORK_PROFILE` (`standard` | `constrained`)
    pub profile: NetworkProfile,

    /// STUN servers plus an optional TURN server.
    /// Env: `STORK_TURN_URL`, `STORK_TURN_USER`, `STORK_TURN_PASS`
    pub ice_servers: Vec<IceServer>,

    pub negotiation_timeout: Duration,
    pub max_reconnect_attempts: u32,
    pub reconnect_step: Duration,

    /// Delay before an assumed (handshake-less) connection is reported.
    pub assumed_connect_delay: Duration,

    /// How often the local broadcast store is polled.
    pub broadcast_poll_interval: Duration,

    /// Shared directory for the local broadcast tier.
    /// Env: `STORK_BROADCAST_DIR`
    pub broadcast_dir: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::for_profile(NetworkProfile::Standard)
    }
}

impl ClientConfig {
    pub fn for_profile(profile: NetworkProfile) -> Self {
        Self {
            relay_url: Some(format!("ws://127.0.0.1:{DEFAULT_RELAY_PORT}")),
            profile,
            ice_servers: DEFAULT_STUN_SERVERS
                .iter()
                .map(|url| IceServer::stun(url))
                .collect(),
            negotiation_timeout: profile.negotiation_timeout(),
            max_reconnect_attempts: profile.max_reconnect_attempts(),
            reconnect_step: profile.reconnect_step(),
            assumed_connect_delay: Duration::from_millis(500),
            broadcast_poll_interval: Duration::from_millis(250),
            broadcast_dir: None,
        }
    }

    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let profile = match lookup("STORK_NETWORK_PROFILE") {
            Some(value) => NetworkProfile::parse(&value).unwrap_or_else(|| {
                tracing::warn!(value = %value, "Unknown STORK_NETWORK_PROFILE, using standard");
                NetworkProfile::Standard
            }),
            None => NetworkProfile::Standard,
        };

        let mut config = Self::for_profile(profile);

        if let Some(url) = lookup("STORK_RELAY_URL") {
            let url = url.trim();
            config.relay_url = if url.is_empty() || url.eq_ignore_ascii_case("off") {
                None
            } else {
                Some(url.to_string())
            };
        }

        if let (Some(url), Some(user), Some(pass)) = (
            lookup("STORK_TURN_URL"),
            lookup("STORK_TURN_USER"),
            lookup("STORK_TURN_PASS"),
        ) {
            config.ice_servers.push(IceServer {
                urls: vec![url],
                username: Some(user),
                credential: Some(pass),
            });
        }

        if let Some(dir) = lookup("STORK_BROADCAST_DIR") {
            if !dir.is_empty() {
                config.broadcast_dir = Some(PathBuf::from(dir));
            }
        }

        config
    }
}
