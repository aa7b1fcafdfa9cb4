//! Seam between the orchestrator and the peer-to-peer data channel.
//!
//! A [`DirectConnector`] creates one [`DirectChannel`] per connection
//! record. Everything the channel observes (locally produced negotiation
//! signals, open, inbound data, close) is reported back as a
//! [`ChannelEvent`] tagged with the record's [`ChannelKey`], so events
//! from a discarded attempt can be told apart from the current one.

use stork_shared::{ConversationId, NegotiationSignal, PeerId};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::negotiation::Role;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    pub remote: PeerId,
    pub conversation: ConversationId,
    /// Increments every time a record is (re)created for the pair.
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEventKind {
    /// A locally produced offer, answer or candidate to relay to the remote.
    Signal(NegotiationSignal),
    Open,
    Data(String),
    Closed,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEvent {
    pub key: ChannelKey,
    pub kind: ChannelEventKind,
}

impl ChannelEvent {
    pub fn new(key: ChannelKey, kind: ChannelEventKind) -> Self {
        Self { key, kind }
    }
}

pub type ChannelEventSender = mpsc::UnboundedSender<ChannelEvent>;

pub trait DirectChannel: Send {
    fn is_open(&self) -> bool;

    /// Feed a signal received from the remote end.
    fn apply_signal(&self, signal: NegotiationSignal);

    fn send_text(&self, text: String) -> Result<()>;

    fn close(&self);
}

pub trait DirectConnector: Send + Sync {
    /// Start a channel attempt. An initiator emits its offer through
    /// `events`; a responder waits for [`DirectChannel::apply_signal`].
    fn open(&self, role: Role, key: ChannelKey, events: ChannelEventSender)
        -> Box<dyn DirectChannel>;
}
