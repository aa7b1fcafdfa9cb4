use std::collections::{HashMap, HashSet};

use stork_shared::{ConversationId, MessageEnvelope};

/// Per-conversation message log that drops envelopes it has already seen.
///
/// The transport may deliver an envelope more than once (e.g. a retry
/// after a tier switch); this is where duplicates stop.
#[derive(Debug, Default)]
pub struct ConversationInbox {
    messages: HashMap<ConversationId, Vec<MessageEnvelope>>,
    seen: HashMap<ConversationId, HashSet<String>>,
}

impl ConversationInbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `envelope` under its conversation. Returns `false` if an
    /// envelope with the same id was already stored there.
    pub fn accept(&mut self, envelope: MessageEnvelope) -> bool {
        let conversation = envelope.conversation_id.clone();
        if !envelope.id.is_empty()
            && !self
                .seen
                .entry(conversation.clone())
                .or_default()
                .insert(envelope.id.clone())
        {
            return false;
        }
        self.messages.entry(conversation).or_default().push(envelope);
        true
    }

    pub fn messages(&self, conversation: &ConversationId) -> &[MessageEnvelope] {
        self.messages
            .get(conversation)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn conversations(&self) -> impl Iterator<Item = &ConversationId> {
        self.messages.keys()
    }
}
