/// Service name reported by the relay health endpoint
pub const SERVICE_NAME: &str = "stork-signaling";

/// Default relay HTTP/WebSocket port
pub const DEFAULT_RELAY_PORT: u16 = 3005;

/// Largest serialized frame accepted on a direct channel (64 KiB)
pub const DIRECT_FRAME_CEILING: usize = 64 * 1024;

/// Maximum participants in a group conversation
pub const MAX_GROUP_PARTICIPANTS: usize = 100;

/// Data channel label used for direct channels
pub const DIRECT_CHANNEL_LABEL: &str = "stork";

/// Public STUN servers used when no ICE servers are configured
pub const DEFAULT_STUN_SERVERS: [&str; 3] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];
