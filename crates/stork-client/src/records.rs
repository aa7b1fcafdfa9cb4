//! Connection record tracking.
//!
//! Keeps one record per (remote identity, conversation) pair: the tier it
//! currently uses, its direct channel if any, and the timers pending on it.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use stork_shared::{ConversationId, PeerId, TransportTier};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::direct::{ChannelKey, DirectChannel};
use crate::negotiation::NegotiationSession;

pub struct ConnectionRecord {
    pub remote: PeerId,
    pub conversation: ConversationId,
    pub tier: TransportTier,
    pub connected: bool,
    pub is_group: bool,
    pub established_at: DateTime<Utc>,
    pub(crate) channel: Option<Box<dyn DirectChannel>>,
    pub(crate) negotiation: Option<NegotiationSession>,
    pub(crate) generation: u64,
    pub(crate) timers: Vec<JoinHandle<()>>,
}

impl ConnectionRecord {
    fn new(
        remote: PeerId,
        conversation: ConversationId,
        tier: TransportTier,
        generation: u64,
    ) -> Self {
        Self {
            remote,
            conversation,
            tier,
            connected: false,
            is_group: false,
            established_at: Utc::now(),
            channel: None,
            negotiation: None,
            generation,
            timers: Vec::new(),
        }
    }

    pub fn key(&self) -> ChannelKey {
        ChannelKey {
            remote: self.remote.clone(),
            conversation: self.conversation.clone(),
            generation: self.generation,
        }
    }

    pub fn channel_open(&self) -> bool {
        self.channel.as_ref().is_some_and(|c| c.is_open())
    }

    pub fn cancel_timers(&mut self) {
        for timer in self.timers.drain(..) {
            timer.abort();
        }
    }

    /// Cancel timers and close the channel. The record is unusable afterwards.
    pub fn shutdown(&mut self) {
        self.cancel_timers();
        if let Some(session) = self.negotiation.as_mut() {
            session.close();
        }
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
        self.connected = false;
    }

    pub fn snapshot(&self) -> RecordSnapshot {
        RecordSnapshot {
            remote: self.remote.clone(),
            conversation: self.conversation.clone(),
            tier: self.tier,
            connected: self.connected,
            is_group: self.is_group,
            established_at: self.established_at,
        }
    }
}

/// Read-only view of a record, handed out to callers.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordSnapshot {
    pub remote: PeerId,
    pub conversation: ConversationId,
    pub tier: TransportTier,
    pub connected: bool,
    pub is_group: bool,
    pub established_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct ConnectionTable {
    records: HashMap<(PeerId, ConversationId), ConnectionRecord>,
    next_generation: u64,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, remote: &PeerId, conversation: &ConversationId) -> bool {
        self.records
            .contains_key(&(remote.clone(), conversation.clone()))
    }

    /// Return the record for the pair, creating it at `tier` if absent.
    /// The flag is `true` when the record was created by this call.
    pub fn ensure(
        &mut self,
        remote: &PeerId,
        conversation: &ConversationId,
        tier: TransportTier,
    ) -> (&mut ConnectionRecord, bool) {
        match self.records.entry((remote.clone(), conversation.clone())) {
            Entry::Occupied(entry) => (entry.into_mut(), false),
            Entry::Vacant(entry) => {
                self.next_generation += 1;
                debug!(
                    remote = %remote.short(),
                    conversation = %conversation,
                    tier = %tier,
                    "Tracking new connection record"
                );
                let record = ConnectionRecord::new(
                    remote.clone(),
                    conversation.clone(),
                    tier,
                    self.next_generation,
                );
                (entry.insert(record), true)
            }
        }
    }

    pub fn get(&self, remote: &PeerId, conversation: &ConversationId) -> Option<&ConnectionRecord> {
        self.records.get(&(remote.clone(), conversation.clone()))
    }

    pub fn get_mut(
        &mut self,
        remote: &PeerId,
        conversation: &ConversationId,
    ) -> Option<&mut ConnectionRecord> {
        self.records.get_mut(&(remote.clone(), conversation.clone()))
    }

    /// The record `key` refers to, if it has not been replaced since.
    pub fn current_mut(&mut self, key: &ChannelKey) -> Option<&mut ConnectionRecord> {
        self.get_mut(&key.remote, &key.conversation)
            .filter(|record| record.generation == key.generation)
    }

    /// Any record with `remote` whose direct channel is open.
    pub fn open_direct_for(&self, remote: &PeerId) -> Option<&ConnectionRecord> {
        self.records.values().find(|record| {
            &record.remote == remote
                && record.tier == TransportTier::Direct
                && record.channel_open()
        })
    }

    pub fn remove(
        &mut self,
        remote: &PeerId,
        conversation: &ConversationId,
    ) -> Option<ConnectionRecord> {
        let removed = self.records.remove(&(remote.clone(), conversation.clone()));
        if removed.is_some() {
            debug!(
                remote = %remote.short(),
                conversation = %conversation,
                "Removed connection record"
            );
        }
        removed
    }

    pub fn remove_conversation(&mut self, conversation: &ConversationId) -> Vec<ConnectionRecord> {
        let keys: Vec<_> = self
            .records
            .keys()
            .filter(|(_, conv)| conv == conversation)
            .cloned()
            .collect();
        keys.into_iter()
            .filter_map(|key| self.records.remove(&key))
            .collect()
    }

    pub fn drain(&mut self) -> Vec<ConnectionRecord> {
        self.records.drain().map(|(_, record)| record).collect()
    }

    pub fn snapshots(&self) -> Vec<RecordSnapshot> {
        let mut snapshots: Vec<_> = self.records.values().map(ConnectionRecord::snapshot).collect();
        snapshots.sort_by(|a, b| {
            (&a.conversation, &a.remote).cmp(&(&b.conversation, &b.remote))
        });
        snapshots
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
