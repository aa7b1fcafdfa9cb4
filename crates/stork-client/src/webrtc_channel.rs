//! [`DirectConnector`] backed by a WebRTC data channel.
//!
//! Each channel runs in its own task that owns the peer connection. The
//! orchestrator talks to it through a command queue and hears back through
//! [`ChannelEvent`]s. Remote candidates that arrive before the remote
//! description is set are held until it is.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use stork_shared::constants::DIRECT_CHANNEL_LABEL;
use stork_shared::{IceCandidate, NegotiationSignal};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::config::{ClientConfig, IceServer};
use crate::direct::{
    ChannelEvent, ChannelEventKind, ChannelEventSender, ChannelKey, DirectChannel, DirectConnector,
};
use crate::error::{ClientError, Result};
use crate::negotiation::Role;

pub struct WebRtcConnector {
    ice_servers: Vec<IceServer>,
}

impl WebRtcConnector {
    pub fn new(ice_servers: Vec<IceServer>) -> Self {
        Self { ice_servers }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.ice_servers.clone())
    }

    fn start(&self, role: Role, key: ChannelKey, events: ChannelEventSender) -> WebRtcChannel {
        let (commands, rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(false));

        let peer = PeerTask {
            role,
            ice_servers: self.ice_servers.clone(),
            hooks: ChannelHooks {
                key: key.clone(),
                events: events.clone(),
                open: open.clone(),
            },
            commands: commands.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = peer.run(rx).await {
                warn!(remote = %key.remote.short(), error = %e, "Direct channel failed");
                let failed = ChannelEventKind::Failed(e.to_string());
                let _ = events.send(ChannelEvent::new(key, failed));
            }
        });

        WebRtcChannel { commands, open }
    }
}

impl DirectConnector for WebRtcConnector {
    fn open(
        &self,
        role: Role,
        key: ChannelKey,
        events: ChannelEventSender,
    ) -> Box<dyn DirectChannel> {
        Box::new(self.start(role, key, events))
    }
}

enum Command {
    Remote(NegotiationSignal),
    Attach(Arc<RTCDataChannel>),
    Send(String),
    Close,
}

struct WebRtcChannel {
    commands: mpsc::UnboundedSender<Command>,
    open: Arc<AtomicBool>,
}

impl DirectChannel for WebRtcChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn apply_signal(&self, signal: NegotiationSignal) {
        let _ = self.commands.send(Command::Remote(signal));
    }

    fn send_text(&self, text: String) -> Result<()> {
        if !self.is_open() {
            return Err(ClientError::Direct("channel not open".into()));
        }
        self.commands
            .send(Command::Send(text))
            .map_err(|_| ClientError::Direct("channel task ended".into()))
    }

    fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }
}

impl Drop for WebRtcChannel {
    fn drop(&mut self) {
        // The peer task holds its own command sender, so it only stops on Close.
        let _ = self.commands.send(Command::Close);
    }
}

/// Bridges data channel callbacks into [`ChannelEvent`]s.
#[derive(Clone)]
struct ChannelHooks {
    key: ChannelKey,
    events: ChannelEventSender,
    open: Arc<AtomicBool>,
}

impl ChannelHooks {
    fn emit(&self, kind: ChannelEventKind) {
        let _ = self.events.send(ChannelEvent::new(self.key.clone(), kind));
    }

    fn mark_open(&self) {
        if !self.open.swap(true, Ordering::SeqCst) {
            self.emit(ChannelEventKind::Open);
        }
    }

    /// Register the open/close/message handlers on `dc`. A channel that is
    /// already open by the time its handlers land is reported open here.
    fn attach(&self, dc: &Arc<RTCDataChannel>) {
        let hooks = self.clone();
        dc.on_open(Box::new(move || {
            Box::pin(async move {
                hooks.mark_open();
            })
        }));

        let hooks = self.clone();
        dc.on_close(Box::new(move || {
            let hooks = hooks.clone();
            Box::pin(async move {
                hooks.open.store(false, Ordering::SeqCst);
                hooks.emit(ChannelEventKind::Closed);
            })
        }));

        let hooks = self.clone();
        dc.on_message(Box::new(move |message: DataChannelMessage| {
            let hooks = hooks.clone();
            Box::pin(async move {
                match String::from_utf8(message.data.to_vec()) {
                    Ok(text) => hooks.emit(ChannelEventKind::Data(text)),
                    Err(_) => warn!("Ignoring non-UTF-8 direct frame"),
                }
            })
        }));

        if dc.ready_state() == RTCDataChannelState::Open {
            self.mark_open();
        }
    }
}

struct PeerTask {
    role: Role,
    ice_servers: Vec<IceServer>,
    hooks: ChannelHooks,
    commands: mpsc::UnboundedSender<Command>,
}

impl PeerTask {
    /// Run the peer connection until the channel is closed or an error
    /// occurs. The peer connection is closed on every exit path.
    async fn run(self, commands: mpsc::UnboundedReceiver<Command>) -> webrtc::error::Result<()> {
        let pc = Arc::new(self.new_peer_connection().await?);
        let result = self.drive(&pc, commands).await;

        self.hooks.open.store(false, Ordering::SeqCst);
        let closed = pc.close().await;
        result.and(closed)
    }

    async fn drive(
        &self,
        pc: &Arc<RTCPeerConnection>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) -> webrtc::error::Result<()> {
        self.watch_peer_connection(pc);

        let mut channel: Option<Arc<RTCDataChannel>> = None;
        match self.role {
            Role::Initiator => {
                let dc = pc.create_data_channel(DIRECT_CHANNEL_LABEL, None).await?;
                self.hooks.attach(&dc);
                channel = Some(dc);

                // The offer goes out ahead of the candidates that setting it
                // starts gathering.
                let offer = pc.create_offer(None).await?;
                self.hooks.emit(ChannelEventKind::Signal(NegotiationSignal::Offer {
                    sdp: offer.sdp.clone(),
                }));
                pc.set_local_description(offer).await?;
            }
            Role::Responder => {
                // Handlers go on inside the callback so the channel's open
                // event cannot slip past before they are registered.
                let (hooks, attach) = (self.hooks.clone(), self.commands.clone());
                pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                    debug!(label = %dc.label(), "Remote opened data channel");
                    hooks.attach(&dc);
                    let _ = attach.send(Command::Attach(dc));
                    Box::pin(async {})
                }));
            }
        }

        let mut remote_set = false;
        let mut pending: Vec<RTCIceCandidateInit> = Vec::new();

        while let Some(command) = commands.recv().await {
            match command {
                Command::Remote(NegotiationSignal::Offer { sdp }) => {
                    pc.set_remote_description(RTCSessionDescription::offer(sdp)?).await?;
                    remote_set = true;
                    flush_candidates(pc, &mut pending).await;

                    let answer = pc.create_answer(None).await?;
                    self.hooks.emit(ChannelEventKind::Signal(NegotiationSignal::Answer {
                        sdp: answer.sdp.clone(),
                    }));
                    pc.set_local_description(answer).await?;
                }
                Command::Remote(NegotiationSignal::Answer { sdp }) => {
                    pc.set_remote_description(RTCSessionDescription::answer(sdp)?).await?;
                    remote_set = true;
                    flush_candidates(pc, &mut pending).await;
                }
                Command::Remote(NegotiationSignal::Candidate { candidate }) => {
                    let init = candidate_init(candidate);
                    if remote_set {
                        add_candidate(pc, init).await;
                    } else {
                        pending.push(init);
                    }
                }
                Command::Attach(dc) => channel = Some(dc),
                Command::Send(text) => match &channel {
                    Some(dc) => {
                        if let Err(e) = dc.send_text(text).await {
                            warn!(error = %e, "Direct send failed");
                        }
                    }
                    None => debug!("Dropping direct frame, no data channel yet"),
                },
                Command::Close => break,
            }
        }

        if let Some(dc) = channel {
            let _ = dc.close().await;
        }
        Ok(())
    }

    async fn new_peer_connection(&self) -> webrtc::error::Result<RTCPeerConnection> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        api.new_peer_connection(config).await
    }

    fn watch_peer_connection(&self, pc: &RTCPeerConnection) {
        let hooks = self.hooks.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let hooks = hooks.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let signal = NegotiationSignal::Candidate {
                            candidate: IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            },
                        };
                        hooks.emit(ChannelEventKind::Signal(signal));
                    }
                    Err(e) => warn!(error = %e, "Failed to encode local ICE candidate"),
                }
            })
        }));

        let hooks = self.hooks.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let hooks = hooks.clone();
            Box::pin(async move {
                debug!(
                    remote = %hooks.key.remote.short(),
                    state = %state,
                    "Peer connection state changed"
                );
                if state == RTCPeerConnectionState::Failed {
                    hooks.emit(ChannelEventKind::Failed("peer connection failed".into()));
                }
            })
        }));
    }
}

fn candidate_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

async fn add_candidate(pc: &RTCPeerConnection, init: RTCIceCandidateInit) {
    if let Err(e) = pc.add_ice_candidate(init).await {
        warn!(error = %e, "Rejected remote ICE candidate");
    }
}

async fn flush_candidates(pc: &RTCPeerConnection, pending: &mut Vec<RTCIceCandidateInit>) {
    for init in pending.drain(..) {
        add_candidate(pc, init).await;
    }
}
