//! The connection orchestrator task.
//!
//! One spawned task owns the record table, the relay link, the reconnect
//! policy and every timer. Callers talk to it through an
//! [`OrchestratorHandle`] and listen on the returned event receiver.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use stork_shared::constants::MAX_GROUP_PARTICIPANTS;
use stork_shared::{
    ClientFrame, ConversationId, GroupRosterUpdate, MessageEnvelope, NegotiationSignal, Participant,
    PeerId, RelayFrame, TransportTier,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::broadcast::{self, BroadcastEntry, BroadcastStore};
use crate::config::ClientConfig;
use crate::direct::{
    ChannelEvent, ChannelEventKind, ChannelEventSender, ChannelKey, DirectConnector,
};
use crate::error::{ClientError, Result};
use crate::events::{OrchestratorEvent, RelayStatus};
use crate::negotiation::{NegotiationAction, NegotiationSession, Role};
use crate::reconnect::ReconnectPolicy;
use crate::records::{ConnectionTable, RecordSnapshot};
use crate::relay_link::{LinkEvent, LinkMessage, RelayLink};
use crate::transport::{self, default_transports, Delivery, Outbound, SendContext, Transport};

// ---------------------------------------------------------------------------
// Command / internal event types
// ---------------------------------------------------------------------------

/// Commands sent *into* the orchestrator task.
#[derive(Debug)]
enum Command {
    Connect {
        remote: PeerId,
        conversation: ConversationId,
        is_group: bool,
        reply: oneshot::Sender<()>,
    },
    Send {
        remote: PeerId,
        envelope: MessageEnvelope,
        reply: oneshot::Sender<Delivery>,
    },
    SendGroup {
        conversation: ConversationId,
        participants: Vec<Participant>,
        envelope: MessageEnvelope,
        reply: oneshot::Sender<Result<Vec<(PeerId, Delivery)>>>,
    },
    SendMeta {
        target: PeerId,
        outbound: Outbound,
        reply: oneshot::Sender<Delivery>,
    },
    Disconnect {
        conversation: ConversationId,
        reply: oneshot::Sender<usize>,
    },
    Records(oneshot::Sender<Vec<RecordSnapshot>>),
    RelayOnline(oneshot::Sender<bool>),
    Teardown(oneshot::Sender<()>),
}

#[derive(Debug)]
enum TimerEvent {
    NegotiationTimeout(ChannelKey),
    AssumedConnected(ChannelKey),
    Redial,
}

/// A data frame, whichever tier it arrived on.
enum Inbound {
    Message {
        target: PeerId,
        chat_id: ConversationId,
        payload: Value,
    },
    Roster {
        target: PeerId,
        data: Value,
    },
    Avatar {
        target: PeerId,
        from: Option<PeerId>,
        avatar: Value,
    },
}

impl Inbound {
    fn from_client_frame(frame: ClientFrame) -> Option<Self> {
        match frame {
            ClientFrame::DirectMessage {
                target_peer_id,
                chat_id,
                payload,
            }
            | ClientFrame::GroupMessage {
                target_peer_id,
                chat_id,
                payload,
            } => Some(Inbound::Message {
                target: target_peer_id,
                chat_id,
                payload,
            }),
            ClientFrame::GroupUpdate {
                target_peer_id,
                data,
            } => Some(Inbound::Roster {
                target: target_peer_id,
                data,
            }),
            ClientFrame::AvatarUpdate {
                target_peer_id,
                from_peer_id,
                avatar,
            } => Some(Inbound::Avatar {
                target: target_peer_id,
                from: from_peer_id,
                avatar,
            }),
            ClientFrame::Register { .. }
            | ClientFrame::Signal { .. }
            | ClientFrame::GroupSignal { .. } => None,
        }
    }
}

enum SignalRoute {
    Apply,
    Ignore(&'static str),
    Respond,
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable handle to a running orchestrator. Every call fails with
/// [`ClientError::Shutdown`] once the task has stopped.
#[derive(Clone)]
pub struct OrchestratorHandle {
    commands: mpsc::Sender<Command>,
    local: PeerId,
}

impl OrchestratorHandle {
    pub fn local_peer(&self) -> &PeerId {
        &self.local
    }

    /// Ensure a connection record exists for (remote, conversation).
    /// Calling it again for the same pair is a no-op.
    pub async fn connect(&self, remote: PeerId, conversation: ConversationId) -> Result<()> {
        self.request(|reply| Command::Connect {
            remote,
            conversation,
            is_group: false,
            reply,
        })
        .await
    }

    /// Connect to every participant of a group conversation except self.
    /// Negotiation for these records travels as `group_signal`.
    pub async fn connect_group(
        &self,
        conversation: ConversationId,
        participants: Vec<Participant>,
    ) -> Result<()> {
        for participant in participants {
            if participant.identity == self.local {
                continue;
            }
            let conversation = conversation.clone();
            self.request(|reply| Command::Connect {
                remote: participant.identity,
                conversation,
                is_group: true,
                reply,
            })
            .await?;
        }
        Ok(())
    }

    pub async fn send(&self, remote: PeerId, envelope: MessageEnvelope) -> Result<Delivery> {
        self.request(|reply| Command::Send {
            remote,
            envelope,
            reply,
        })
        .await
    }

    /// Send `envelope` to every participant except self. Returns one outcome
    /// per target.
    pub async fn send_group(
        &self,
        conversation: ConversationId,
        participants: Vec<Participant>,
        envelope: MessageEnvelope,
    ) -> Result<Vec<(PeerId, Delivery)>> {
        self.request(|reply| Command::SendGroup {
            conversation,
            participants,
            envelope,
            reply,
        })
        .await?
    }

    pub async fn send_roster_update(
        &self,
        target: PeerId,
        update: GroupRosterUpdate,
    ) -> Result<Delivery> {
        self.request(|reply| Command::SendMeta {
            target,
            outbound: Outbound::Roster(update),
            reply,
        })
        .await
    }

    pub async fn send_avatar_update(
        &self,
        target: PeerId,
        avatar: Option<String>,
    ) -> Result<Delivery> {
        self.request(|reply| Command::SendMeta {
            target,
            outbound: Outbound::Avatar(avatar),
            reply,
        })
        .await
    }

    /// Close and forget every record of `conversation`. Returns how many
    /// records were removed.
    pub async fn disconnect(&self, conversation: ConversationId) -> Result<usize> {
        self.request(|reply| Command::Disconnect {
            conversation,
            reply,
        })
        .await
    }

    pub async fn records(&self) -> Result<Vec<RecordSnapshot>> {
        self.request(Command::Records).await
    }

    pub async fn is_relay_online(&self) -> Result<bool> {
        self.request(Command::RelayOnline).await
    }

    /// Disconnect everything, close the relay link and stop the task.
    pub async fn teardown(&self) -> Result<()> {
        self.request(Command::Teardown).await
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| ClientError::Shutdown)?;
        rx.await.map_err(|_| ClientError::Shutdown)
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    local: PeerId,
    config: ClientConfig,
    connector: Arc<dyn DirectConnector>,
    broadcast: Arc<dyn BroadcastStore>,
    transports: Vec<Box<dyn Transport>>,
    records: ConnectionTable,
    link: RelayLink,
    reconnect: ReconnectPolicy,
    redial: Option<JoinHandle<()>>,
    events: mpsc::UnboundedSender<OrchestratorEvent>,
    channel_tx: ChannelEventSender,
    timer_tx: mpsc::UnboundedSender<TimerEvent>,
}

impl Orchestrator {
    /// Spawn the orchestrator on the current tokio runtime.
    ///
    /// Returns the command handle and the event receiver.
    pub fn spawn(
        local: PeerId,
        config: ClientConfig,
        connector: Arc<dyn DirectConnector>,
        broadcast: Arc<dyn BroadcastStore>,
    ) -> (OrchestratorHandle, mpsc::UnboundedReceiver<OrchestratorEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel::<Command>(256);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (channel_tx, channel_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();

        let orchestrator = Orchestrator {
            local: local.clone(),
            link: RelayLink::new(config.relay_url.clone(), link_tx),
            reconnect: ReconnectPolicy::new(config.max_reconnect_attempts, config.reconnect_step),
            config,
            connector,
            broadcast,
            transports: default_transports(),
            records: ConnectionTable::new(),
            redial: None,
            events: event_tx,
            channel_tx,
            timer_tx,
        };

        tokio::spawn(orchestrator.run(cmd_rx, link_rx, channel_rx, timer_rx));

        (
            OrchestratorHandle {
                commands: cmd_tx,
                local,
            },
            event_rx,
        )
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut link_rx: mpsc::UnboundedReceiver<LinkMessage>,
        mut channel_rx: mpsc::UnboundedReceiver<ChannelEvent>,
        mut timer_rx: mpsc::UnboundedReceiver<TimerEvent>,
    ) {
        info!(peer = %self.local, relay = ?self.config.relay_url, "Orchestrator started");

        if self.link.is_configured() {
            self.link.dial();
        } else {
            info!("No relay configured, using local broadcast only");
            self.emit(OrchestratorEvent::RelayStatus(RelayStatus::Offline));
        }

        let (batch_tx, mut batch_rx) = mpsc::channel(64);
        let poller = broadcast::spawn_poller(
            self.broadcast.clone(),
            self.local.clone(),
            self.config.broadcast_poll_interval,
            batch_tx,
        );

        loop {
            tokio::select! {
                // --- Incoming commands ---
                cmd = commands.recv() => {
                    match cmd {
                        Some(Command::Teardown(reply)) => {
                            self.teardown();
                            let _ = reply.send(());
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd),
                        None => {
                            info!("Command channel closed, shutting down orchestrator");
                            self.teardown();
                            break;
                        }
                    }
                }

                Some(message) = link_rx.recv() => self.handle_link(message),

                Some(event) = channel_rx.recv() => self.handle_channel(event),

                Some(timer) = timer_rx.recv() => self.handle_timer(timer),

                Some(entries) = batch_rx.recv() => self.handle_broadcast(entries),
            }
        }

        poller.abort();

        info!("Orchestrator event loop terminated");
    }

    fn emit(&self, event: OrchestratorEvent) {
        let _ = self.events.send(event);
    }

    fn schedule(&self, delay: Duration, event: TimerEvent) -> JoinHandle<()> {
        let timers = self.timer_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = timers.send(event);
        })
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect {
                remote,
                conversation,
                is_group,
                reply,
            } => {
                self.connect(remote, conversation, is_group);
                let _ = reply.send(());
            }
            Command::Send {
                remote,
                envelope,
                reply,
            } => {
                let delivery = self.send_envelope(&remote, envelope, false);
                let _ = reply.send(delivery);
            }
            Command::SendGroup {
                conversation,
                participants,
                envelope,
                reply,
            } => {
                let _ = reply.send(self.send_group(conversation, participants, envelope));
            }
            Command::SendMeta {
                target,
                outbound,
                reply,
            } => {
                let _ = reply.send(self.dispatch(&target, None, &outbound));
            }
            Command::Disconnect {
                conversation,
                reply,
            } => {
                let _ = reply.send(self.disconnect(&conversation));
            }
            Command::Records(reply) => {
                let _ = reply.send(self.records.snapshots());
            }
            Command::RelayOnline(reply) => {
                let _ = reply.send(self.link.is_open());
            }
            Command::Teardown(reply) => {
                self.teardown();
                let _ = reply.send(());
            }
        }
    }

    // --- Connection records ------------------------------------------------

    fn connect(&mut self, remote: PeerId, conversation: ConversationId, is_group: bool) {
        if remote == self.local {
            debug!(conversation = %conversation, "Ignoring connect to own identity");
            return;
        }
        if self.records.contains(&remote, &conversation) {
            debug!(
                remote = %remote.short(),
                conversation = %conversation,
                "Connection record already exists"
            );
            return;
        }

        if self.link.is_open() {
            self.start_negotiation(&remote, &conversation, Role::Initiator, is_group);
            return;
        }

        let key = {
            let (record, _) = self.records.ensure(&remote, &conversation, TransportTier::Relayed);
            record.connected = true;
            record.is_group = is_group;
            record.key()
        };
        let timer = self.schedule(
            self.config.assumed_connect_delay,
            TimerEvent::AssumedConnected(key.clone()),
        );
        if let Some(record) = self.records.current_mut(&key) {
            record.timers.push(timer);
        }
        info!(
            remote = %remote.short(),
            conversation = %conversation,
            "Relay not open, assuming relayed connection"
        );
    }

    fn start_negotiation(
        &mut self,
        remote: &PeerId,
        conversation: &ConversationId,
        role: Role,
        is_group: bool,
    ) {
        let key = {
            let (record, _) = self.records.ensure(remote, conversation, TransportTier::Negotiating);
            record.is_group = is_group;
            record.negotiation = Some(NegotiationSession::new(role));
            record.key()
        };

        let channel = self.connector.open(role, key.clone(), self.channel_tx.clone());
        let timer = self.schedule(
            self.config.negotiation_timeout,
            TimerEvent::NegotiationTimeout(key.clone()),
        );
        if let Some(record) = self.records.current_mut(&key) {
            record.channel = Some(channel);
            record.timers.push(timer);
        }

        info!(
            remote = %remote.short(),
            conversation = %conversation,
            role = ?role,
            "Starting direct channel negotiation"
        );
    }

    /// Drop the record `key` refers to, unless it has been replaced.
    fn discard(&mut self, key: &ChannelKey, reason: &str) {
        if self.records.current_mut(key).is_none() {
            return;
        }
        if let Some(mut record) = self.records.remove(&key.remote, &key.conversation) {
            info!(
                remote = %key.remote.short(),
                conversation = %key.conversation,
                reason,
                "Discarding connection record"
            );
            record.shutdown();
        }
    }

    fn disconnect(&mut self, conversation: &ConversationId) -> usize {
        let removed = self.records.remove_conversation(conversation);
        let count = removed.len();
        for mut record in removed {
            record.shutdown();
        }
        info!(conversation = %conversation, records = count, "Disconnected conversation");
        count
    }

    fn teardown(&mut self) {
        for mut record in self.records.drain() {
            record.shutdown();
        }
        self.reconnect.disable();
        if let Some(redial) = self.redial.take() {
            redial.abort();
        }
        self.link.close();
        info!("Orchestrator torn down");
    }

    // --- Outbound ----------------------------------------------------------

    fn send_envelope(
        &mut self,
        remote: &PeerId,
        envelope: MessageEnvelope,
        is_group: bool,
    ) -> Delivery {
        let conversation = envelope.conversation_id.clone();
        let initial_tier = if self.link.is_open() {
            TransportTier::Relayed
        } else {
            TransportTier::LocalBroadcast
        };
        let (record, created) = self.records.ensure(remote, &conversation, initial_tier);
        if created {
            record.connected = true;
            record.is_group = is_group || envelope.is_group;
        }

        let outbound = Outbound::Message {
            conversation: conversation.clone(),
            envelope,
        };
        let delivery = self.dispatch(remote, Some(&conversation), &outbound);

        if let (Delivery::Delivered(tier), Some(record)) =
            (delivery, self.records.get_mut(remote, &conversation))
        {
            let pinned = matches!(record.tier, TransportTier::Direct | TransportTier::Negotiating);
            if !pinned && record.tier != tier {
                debug!(
                    remote = %remote.short(),
                    conversation = %conversation,
                    from = %record.tier,
                    to = %tier,
                    "Re-tiering connection record"
                );
                record.tier = tier;
            }
        }

        delivery
    }

    fn send_group(
        &mut self,
        conversation: ConversationId,
        participants: Vec<Participant>,
        mut envelope: MessageEnvelope,
    ) -> Result<Vec<(PeerId, Delivery)>> {
        if participants.len() > MAX_GROUP_PARTICIPANTS {
            return Err(ClientError::GroupTooLarge {
                count: participants.len(),
                max: MAX_GROUP_PARTICIPANTS,
            });
        }

        envelope.conversation_id = conversation;
        envelope.is_group = true;

        let mut seen = HashSet::new();
        let targets: Vec<PeerId> = participants
            .into_iter()
            .map(|participant| participant.identity)
            .filter(|identity| identity != &self.local && seen.insert(identity.clone()))
            .collect();

        let mut outcomes = Vec::with_capacity(targets.len());
        for target in targets {
            let delivery = self.send_envelope(&target, envelope.clone(), true);
            outcomes.push((target, delivery));
        }
        Ok(outcomes)
    }

    /// Run `outbound` through the tiers. With a conversation, only that
    /// record's channel counts for the direct tier; without one, any open
    /// direct channel to `target` does.
    fn dispatch(
        &self,
        target: &PeerId,
        conversation: Option<&ConversationId>,
        outbound: &Outbound,
    ) -> Delivery {
        let direct_record = match conversation {
            Some(conversation) => self
                .records
                .get(target, conversation)
                .filter(|record| record.tier == TransportTier::Direct),
            None => self.records.open_direct_for(target),
        };

        let ctx = SendContext {
            local: &self.local,
            target,
            direct: direct_record.and_then(|record| record.channel.as_deref()),
            relay: &self.link,
            broadcast: self.broadcast.as_ref(),
        };
        transport::deliver(&self.transports, &ctx, outbound)
    }

    // --- Relay link --------------------------------------------------------

    fn handle_link(&mut self, message: LinkMessage) {
        let Some(event) = self.link.accept(message) else {
            trace!("Dropping event from abandoned relay dial");
            return;
        };

        match event {
            LinkEvent::Opened => {
                self.reconnect.on_open();
                let register = ClientFrame::Register {
                    peer_id: self.local.clone(),
                };
                if !self.link.send_frame(&register) {
                    warn!("Failed to queue relay registration");
                }
            }
            LinkEvent::Frame(text) => match RelayFrame::from_text(&text) {
                Ok(frame) => self.handle_relay_frame(frame),
                Err(e) => warn!(error = %e, "Dropping malformed relay frame"),
            },
            LinkEvent::Closed => self.schedule_redial(),
        }
    }

    fn schedule_redial(&mut self) {
        match self.reconnect.on_closed() {
            Some((attempt, delay)) => {
                info!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Relay link down, scheduling reconnect"
                );
                self.emit(OrchestratorEvent::RelayStatus(RelayStatus::Reconnecting {
                    attempt,
                    delay,
                }));
                if let Some(previous) = self.redial.take() {
                    previous.abort();
                }
                self.redial = Some(self.schedule(delay, TimerEvent::Redial));
            }
            None => {
                warn!(
                    attempts = self.reconnect.attempts(),
                    "Relay unreachable, falling back to local broadcast"
                );
                self.emit(OrchestratorEvent::RelayStatus(RelayStatus::Offline));
            }
        }
    }

    fn handle_relay_frame(&mut self, frame: RelayFrame) {
        match frame {
            RelayFrame::Registered { peer_id } => {
                info!(peer = %peer_id, "Registered with relay");
                self.emit(OrchestratorEvent::RelayStatus(RelayStatus::Online));
            }
            RelayFrame::Signal {
                from_peer_id,
                signal,
                chat_id,
            } => self.handle_remote_signal(from_peer_id, chat_id, signal, false),
            RelayFrame::GroupSignal {
                from_peer_id,
                signal,
                chat_id,
                target_peer_id,
            } => {
                if target_peer_id != self.local {
                    debug!(
                        target = %target_peer_id.short(),
                        "Ignoring group signal addressed elsewhere"
                    );
                    return;
                }
                self.handle_remote_signal(from_peer_id, chat_id, signal, true);
            }
            RelayFrame::DirectMessage {
                target_peer_id,
                chat_id,
                payload,
            }
            | RelayFrame::GroupMessage {
                target_peer_id,
                chat_id,
                payload,
            } => self.handle_inbound(
                Inbound::Message {
                    target: target_peer_id,
                    chat_id,
                    payload,
                },
                TransportTier::Relayed,
            ),
            RelayFrame::GroupUpdate {
                target_peer_id,
                data,
            } => self.handle_inbound(
                Inbound::Roster {
                    target: target_peer_id,
                    data,
                },
                TransportTier::Relayed,
            ),
            RelayFrame::AvatarUpdate {
                target_peer_id,
                from_peer_id,
                avatar,
            } => self.handle_inbound(
                Inbound::Avatar {
                    target: target_peer_id,
                    from: from_peer_id,
                    avatar,
                },
                TransportTier::Relayed,
            ),
        }
    }

    // --- Negotiation -------------------------------------------------------

    fn handle_remote_signal(
        &mut self,
        from: Option<PeerId>,
        conversation: ConversationId,
        value: Value,
        is_group: bool,
    ) {
        let Some(remote) = from else {
            warn!(conversation = %conversation, "Dropping signal from unregistered sender");
            return;
        };
        let signal = match NegotiationSignal::from_value(value) {
            Ok(signal) => signal,
            Err(e) => {
                warn!(
                    remote = %remote.short(),
                    error = %e,
                    "Dropping malformed negotiation signal"
                );
                return;
            }
        };
        let local_wins = self.local > remote;

        let route = match self.records.get_mut(&remote, &conversation) {
            None => SignalRoute::Respond,
            Some(record) => match record.negotiation.as_mut() {
                Some(session) => match session.on_remote_signal(&signal, local_wins) {
                    NegotiationAction::Apply => SignalRoute::Apply,
                    NegotiationAction::Ignore(reason) => SignalRoute::Ignore(reason),
                    NegotiationAction::Restart => SignalRoute::Respond,
                },
                // An assumed record upgrades when the remote offers a channel.
                None if matches!(signal, NegotiationSignal::Offer { .. }) => SignalRoute::Respond,
                None => SignalRoute::Ignore("no negotiation in progress"),
            },
        };

        match route {
            SignalRoute::Apply => {
                if let Some(channel) = self
                    .records
                    .get(&remote, &conversation)
                    .and_then(|record| record.channel.as_ref())
                {
                    channel.apply_signal(signal);
                }
            }
            SignalRoute::Ignore(reason) => {
                debug!(
                    remote = %remote.short(),
                    conversation = %conversation,
                    reason,
                    "Ignoring negotiation signal"
                );
            }
            SignalRoute::Respond => {
                if let Some(mut previous) = self.records.remove(&remote, &conversation) {
                    previous.shutdown();
                }
                self.start_negotiation(&remote, &conversation, Role::Responder, is_group);
                if let Some(record) = self.records.get_mut(&remote, &conversation) {
                    if let Some(session) = record.negotiation.as_mut() {
                        session.on_remote_signal(&signal, local_wins);
                    }
                    if let Some(channel) = record.channel.as_ref() {
                        channel.apply_signal(signal);
                    }
                }
            }
        }
    }

    fn handle_channel(&mut self, event: ChannelEvent) {
        let ChannelEvent { key, kind } = event;
        if self.records.current_mut(&key).is_none() {
            trace!(
                remote = %key.remote.short(),
                generation = key.generation,
                "Ignoring event from stale channel"
            );
            return;
        }

        match kind {
            ChannelEventKind::Signal(signal) => self.relay_local_signal(&key, signal),
            ChannelEventKind::Open => self.on_channel_open(&key),
            ChannelEventKind::Data(text) => self.on_direct_data(&text),
            ChannelEventKind::Closed => self.discard(&key, "direct channel closed"),
            ChannelEventKind::Failed(reason) => {
                warn!(remote = %key.remote.short(), reason = %reason, "Direct channel failed");
                self.discard(&key, "direct channel failed");
            }
        }
    }

    fn relay_local_signal(&mut self, key: &ChannelKey, signal: NegotiationSignal) {
        let value = match signal.to_value() {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "Failed to encode negotiation signal");
                return;
            }
        };
        let Some(record) = self.records.current_mut(key) else {
            return;
        };
        if let Some(session) = record.negotiation.as_mut() {
            session.on_local_signal(&signal);
        }

        let frame = if record.is_group {
            ClientFrame::GroupSignal {
                target_peer_ids: vec![key.remote.clone()],
                signal: value,
                chat_id: key.conversation.clone(),
            }
        } else {
            ClientFrame::Signal {
                target_peer_id: key.remote.clone(),
                signal: value,
                chat_id: key.conversation.clone(),
            }
        };

        if !self.link.send_frame(&frame) {
            debug!(remote = %key.remote.short(), "Relay link down, negotiation signal dropped");
        }
    }

    fn on_channel_open(&mut self, key: &ChannelKey) {
        let Some(record) = self.records.current_mut(key) else {
            return;
        };
        record.cancel_timers();
        record.tier = TransportTier::Direct;
        record.connected = true;
        record.established_at = Utc::now();
        let role = record.negotiation.as_mut().map(|session| {
            session.on_open();
            session.role()
        });

        info!(
            remote = %key.remote.short(),
            conversation = %key.conversation,
            role = ?role,
            "Direct channel open"
        );
        self.emit(OrchestratorEvent::Connected {
            remote: key.remote.clone(),
            conversation_id: key.conversation.clone(),
            tier: TransportTier::Direct,
        });
    }

    fn on_direct_data(&mut self, text: &str) {
        match ClientFrame::from_text(text) {
            Ok(frame) => match Inbound::from_client_frame(frame) {
                Some(inbound) => self.handle_inbound(inbound, TransportTier::Direct),
                None => debug!("Ignoring control frame on direct channel"),
            },
            Err(e) => warn!(error = %e, "Dropping malformed direct frame"),
        }
    }

    // --- Timers ------------------------------------------------------------

    fn handle_timer(&mut self, timer: TimerEvent) {
        match timer {
            TimerEvent::NegotiationTimeout(key) => {
                let expired = self
                    .records
                    .current_mut(&key)
                    .filter(|record| record.tier == TransportTier::Negotiating)
                    .map(|record| record.negotiation.as_ref().map(NegotiationSession::elapsed));
                if let Some(elapsed) = expired {
                    warn!(
                        remote = %key.remote.short(),
                        conversation = %key.conversation,
                        elapsed_ms = elapsed.map(|e| e.as_millis() as u64),
                        "Direct channel negotiation timed out"
                    );
                    self.discard(&key, "negotiation timed out");
                }
            }
            TimerEvent::AssumedConnected(key) => {
                let tier = match self.records.current_mut(&key) {
                    Some(record) => record.tier,
                    None => return,
                };
                self.emit(OrchestratorEvent::Connected {
                    remote: key.remote,
                    conversation_id: key.conversation,
                    tier,
                });
            }
            TimerEvent::Redial => {
                self.redial = None;
                self.link.dial();
            }
        }
    }

    // --- Inbound -----------------------------------------------------------

    fn handle_broadcast(&mut self, entries: Vec<BroadcastEntry>) {
        for entry in entries {
            let sender = entry.from_peer_id;
            match Inbound::from_client_frame(entry.frame) {
                Some(Inbound::Avatar {
                    target,
                    from: None,
                    avatar,
                }) => self.handle_inbound(
                    Inbound::Avatar {
                        target,
                        from: Some(sender),
                        avatar,
                    },
                    TransportTier::LocalBroadcast,
                ),
                Some(inbound) => self.handle_inbound(inbound, TransportTier::LocalBroadcast),
                None => debug!("Ignoring control frame in local broadcast store"),
            }
        }
    }

    fn handle_inbound(&mut self, inbound: Inbound, tier: TransportTier) {
        match inbound {
            Inbound::Message {
                target,
                chat_id,
                payload,
            } => {
                if target != self.local {
                    debug!(target = %target.short(), "Ignoring message addressed elsewhere");
                    return;
                }
                let mut envelope = match MessageEnvelope::from_value(payload) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!(
                            conversation = %chat_id,
                            error = %e,
                            "Dropping unparseable message payload"
                        );
                        return;
                    }
                };
                if envelope.conversation_id.is_empty() {
                    envelope.conversation_id = chat_id.clone();
                }
                let conversation_id = if chat_id.is_empty() {
                    envelope.conversation_id.clone()
                } else {
                    chat_id
                };

                debug!(
                    from = %envelope.sender.short(),
                    conversation = %conversation_id,
                    id = %envelope.id,
                    tier = %tier,
                    "Message received"
                );
                self.emit(OrchestratorEvent::Message {
                    conversation_id,
                    envelope,
                    tier,
                });
            }
            Inbound::Roster { target, data } => {
                if target != self.local {
                    debug!(target = %target.short(), "Ignoring roster update addressed elsewhere");
                    return;
                }
                match serde_json::from_value::<GroupRosterUpdate>(data) {
                    Ok(update) => {
                        debug!(
                            group = %update.conversation_id,
                            tier = %tier,
                            "Roster update received"
                        );
                        self.emit(OrchestratorEvent::RosterUpdate(update));
                    }
                    Err(e) => warn!(error = %e, "Dropping unparseable roster update"),
                }
            }
            Inbound::Avatar {
                target,
                from,
                avatar,
            } => {
                if target != self.local {
                    debug!(target = %target.short(), "Ignoring avatar update addressed elsewhere");
                    return;
                }
                self.emit(OrchestratorEvent::AvatarUpdate {
                    from,
                    avatar: avatar.as_str().map(str::to_string),
                });
            }
        }
    }
}
