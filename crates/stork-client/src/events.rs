use std::time::Duration;

use stork_shared::{ConversationId, GroupRosterUpdate, MessageEnvelope, PeerId, TransportTier};

/// Notifications sent *from* the orchestrator task to the application
/// (the conversation store and display layer).
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorEvent {
    /// An envelope arrived. Emitted once per received frame; the envelope
    /// id is untouched so the consumer can dedupe.
    Message {
        conversation_id: ConversationId,
        envelope: MessageEnvelope,
        tier: TransportTier,
    },

    /// A conversation with `remote` became usable.
    Connected {
        remote: PeerId,
        conversation_id: ConversationId,
        tier: TransportTier,
    },

    RosterUpdate(GroupRosterUpdate),

    AvatarUpdate {
        from: Option<PeerId>,
        avatar: Option<String>,
    },

    RelayStatus(RelayStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayStatus {
    /// Link open and identity registered.
    Online,
    /// Link lost; retry `attempt` is scheduled after `delay`.
    Reconnecting { attempt: u32, delay: Duration },
    /// No relay configured, or retries exhausted. Only local broadcast remains.
    Offline,
}
