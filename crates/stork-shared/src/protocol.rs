use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::types::{ConversationId, PeerId};

/// Frames a client sends to the relay. The data-carrying kinds are also
/// what travels over an open direct channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Claim an identity on this connection.
    #[serde(rename_all = "camelCase")]
    Register { peer_id: PeerId },

    /// Negotiation signal for a one-to-one conversation.
    #[serde(rename_all = "camelCase")]
    Signal {
        target_peer_id: PeerId,
        signal: Value,
        chat_id: ConversationId,
    },

    /// Negotiation signal for a group conversation. The relay forwards one
    /// copy per listed target.
    #[serde(rename_all = "camelCase")]
    GroupSignal {
        target_peer_ids: Vec<PeerId>,
        signal: Value,
        chat_id: ConversationId,
    },

    #[serde(rename_all = "camelCase")]
    DirectMessage {
        target_peer_id: PeerId,
        chat_id: ConversationId,
        payload: Value,
    },

    #[serde(rename_all = "camelCase")]
    GroupMessage {
        target_peer_id: PeerId,
        chat_id: ConversationId,
        payload: Value,
    },

    #[serde(rename_all = "camelCase")]
    GroupUpdate { target_peer_id: PeerId, data: Value },

    #[serde(rename_all = "camelCase")]
    AvatarUpdate {
        target_peer_id: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_peer_id: Option<PeerId>,
        #[serde(default)]
        avatar: Value,
    },
}

/// Frames the relay delivers to a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayFrame {
    #[serde(rename_all = "camelCase")]
    Registered { peer_id: PeerId },

    #[serde(rename_all = "camelCase")]
    Signal {
        from_peer_id: Option<PeerId>,
        signal: Value,
        chat_id: ConversationId,
    },

    #[serde(rename_all = "camelCase")]
    GroupSignal {
        from_peer_id: Option<PeerId>,
        signal: Value,
        chat_id: ConversationId,
        target_peer_id: PeerId,
    },

    #[serde(rename_all = "camelCase")]
    DirectMessage {
        target_peer_id: PeerId,
        chat_id: ConversationId,
        payload: Value,
    },

    #[serde(rename_all = "camelCase")]
    GroupMessage {
        target_peer_id: PeerId,
        chat_id: ConversationId,
        payload: Value,
    },

    #[serde(rename_all = "camelCase")]
    GroupUpdate { target_peer_id: PeerId, data: Value },

    #[serde(rename_all = "camelCase")]
    AvatarUpdate {
        target_peer_id: PeerId,
        from_peer_id: Option<PeerId>,
        #[serde(default)]
        avatar: Value,
    },
}

impl ClientFrame {
    pub fn to_text(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_text(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// The kind tag as it appears on the wire, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientFrame::Register { .. } => "register",
            ClientFrame::Signal { .. } => "signal",
            ClientFrame::GroupSignal { .. } => "group_signal",
            ClientFrame::DirectMessage { .. } => "direct_message",
            ClientFrame::GroupMessage { .. } => "group_message",
            ClientFrame::GroupUpdate { .. } => "group_update",
            ClientFrame::AvatarUpdate { .. } => "avatar_update",
        }
    }
}

impl RelayFrame {
    pub fn to_text(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_text(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Direct-channel negotiation signal, carried opaquely in `signal`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NegotiationSignal {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: IceCandidate },
}

/// Trickled ICE candidate in the browser's `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl NegotiationSignal {
    pub fn to_value(&self) -> Result<Value, ProtocolError> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_value(value)?)
    }
}
