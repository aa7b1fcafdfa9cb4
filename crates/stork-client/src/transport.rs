//! Tiered outbound delivery.
//!
//! Every outbound frame is offered to each [`Transport`] in order (direct,
//! relayed, local broadcast) until one accepts it.

use serde_json::Value;
use stork_shared::constants::DIRECT_FRAME_CEILING;
use stork_shared::{
    ClientFrame, ConversationId, GroupRosterUpdate, MessageEnvelope, PeerId, TransportTier,
};
use tracing::{debug, warn};

use crate::broadcast::{entry_key, BroadcastEntry, BroadcastStore};
use crate::direct::DirectChannel;
use crate::error::Result;
use crate::relay_link::RelayLink;

#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message {
        conversation: ConversationId,
        envelope: MessageEnvelope,
    },
    Roster(GroupRosterUpdate),
    Avatar(Option<String>),
}

impl Outbound {
    /// Encode as the frame addressed to `target`.
    pub fn to_frame(&self, local: &PeerId, target: &PeerId) -> Result<ClientFrame> {
        let frame = match self {
            Outbound::Message {
                conversation,
                envelope,
            } => {
                let payload = envelope.to_value()?;
                if envelope.is_group {
                    ClientFrame::GroupMessage {
                        target_peer_id: target.clone(),
                        chat_id: conversation.clone(),
                        payload,
                    }
                } else {
                    ClientFrame::DirectMessage {
                        target_peer_id: target.clone(),
                        chat_id: conversation.clone(),
                        payload,
                    }
                }
            }
            Outbound::Roster(update) => ClientFrame::GroupUpdate {
                target_peer_id: target.clone(),
                data: serde_json::to_value(update)?,
            },
            Outbound::Avatar(avatar) => ClientFrame::AvatarUpdate {
                target_peer_id: target.clone(),
                from_peer_id: Some(local.clone()),
                avatar: avatar.clone().map(Value::String).unwrap_or(Value::Null),
            },
        };
        Ok(frame)
    }

    fn is_message(&self) -> bool {
        matches!(self, Outbound::Message { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered(TransportTier),
    Failed,
}

impl Delivery {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Delivery::Delivered(_))
    }

    pub fn tier(&self) -> Option<TransportTier> {
        match self {
            Delivery::Delivered(tier) => Some(*tier),
            Delivery::Failed => None,
        }
    }
}

/// Everything a transport may use to deliver one frame.
pub struct SendContext<'a> {
    pub local: &'a PeerId,
    pub target: &'a PeerId,
    /// The open direct channel for this target, if its record is DIRECT.
    pub direct: Option<&'a dyn DirectChannel>,
    pub relay: &'a RelayLink,
    pub broadcast: &'a dyn BroadcastStore,
}

pub trait Transport: Send {
    fn tier(&self) -> TransportTier;

    fn try_send(
        &self,
        ctx: &SendContext<'_>,
        frame: &ClientFrame,
        outbound: &Outbound,
    ) -> Delivery;
}

pub struct DirectTransport;

impl Transport for DirectTransport {
    fn tier(&self) -> TransportTier {
        TransportTier::Direct
    }

    fn try_send(
        &self,
        ctx: &SendContext<'_>,
        frame: &ClientFrame,
        outbound: &Outbound,
    ) -> Delivery {
        let Some(channel) = ctx.direct.filter(|c| c.is_open()) else {
            return Delivery::Failed;
        };
        let text = match frame.to_text() {
            Ok(text) => text,
            Err(_) => return Delivery::Failed,
        };
        if outbound.is_message() && text.len() > DIRECT_FRAME_CEILING {
            debug!(
                size = text.len(),
                max = DIRECT_FRAME_CEILING,
                "Frame too large for direct channel"
            );
            return Delivery::Failed;
        }
        match channel.send_text(text) {
            Ok(()) => Delivery::Delivered(TransportTier::Direct),
            Err(e) => {
                debug!(error = %e, "Direct send failed");
                Delivery::Failed
            }
        }
    }
}

pub struct RelayedTransport;

impl Transport for RelayedTransport {
    fn tier(&self) -> TransportTier {
        TransportTier::Relayed
    }

    fn try_send(
        &self,
        ctx: &SendContext<'_>,
        frame: &ClientFrame,
        _outbound: &Outbound,
    ) -> Delivery {
        if ctx.relay.send_frame(frame) {
            Delivery::Delivered(TransportTier::Relayed)
        } else {
            Delivery::Failed
        }
    }
}

pub struct LocalBroadcastTransport;

impl Transport for LocalBroadcastTransport {
    fn tier(&self) -> TransportTier {
        TransportTier::LocalBroadcast
    }

    fn try_send(
        &self,
        ctx: &SendContext<'_>,
        frame: &ClientFrame,
        _outbound: &Outbound,
    ) -> Delivery {
        let entry = BroadcastEntry {
            target_peer_id: ctx.target.clone(),
            from_peer_id: ctx.local.clone(),
            frame: frame.clone(),
        };
        match ctx.broadcast.publish(&entry_key(frame), &entry) {
            Ok(()) => Delivery::Delivered(TransportTier::LocalBroadcast),
            Err(e) => {
                warn!(error = %e, "Local broadcast publish failed");
                Delivery::Failed
            }
        }
    }
}

pub fn default_transports() -> Vec<Box<dyn Transport>> {
    vec![
        Box::new(DirectTransport),
        Box::new(RelayedTransport),
        Box::new(LocalBroadcastTransport),
    ]
}

/// Offer `outbound` to each transport in turn; the first acceptance wins.
pub fn deliver(
    transports: &[Box<dyn Transport>],
    ctx: &SendContext<'_>,
    outbound: &Outbound,
) -> Delivery {
    let frame = match outbound.to_frame(ctx.local, ctx.target) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "Failed to encode outbound frame");
            return Delivery::Failed;
        }
    };

    for transport in transports {
        if let Delivery::Delivered(tier) = transport.try_send(ctx, &frame, outbound) {
            debug!(
                target = %ctx.target.short(),
                kind = frame.kind(),
                tier = %tier,
                "Frame delivered"
            );
            return Delivery::Delivered(tier);
        }
    }

    warn!(target = %ctx.target.short(), kind = frame.kind(), "No transport accepted frame");
    Delivery::Failed
}
