//! Common test utilities for orchestrator integration tests.
//!
//! Provides an in-memory [`DirectConnector`] whose channels pair up through
//! a shared hub, a helper that runs a real relay on an ephemeral port, and
//! event-waiting helpers.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use stork_client::{
    BroadcastStore, ChannelEvent, ChannelEventKind, ChannelKey, ClientConfig, ClientError,
    DirectChannel, DirectConnector, Orchestrator, OrchestratorEvent, OrchestratorHandle,
    RecordSnapshot, RelayStatus, Role,
};
use stork_relay::{AppState, RelayConfig};
use stork_shared::{
    ClientFrame, ConversationId, MessageEnvelope, NegotiationSignal, PeerId, RelayFrame,
    TransportTier,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// Default timeout for waiting on an event.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to watch for an event that must not happen.
pub const QUIET_PERIOD: Duration = Duration::from_millis(300);

pub fn init_test_logging() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("stork_client=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Run a relay on 127.0.0.1 with an OS-assigned port and return its URL.
pub async fn spawn_relay() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(stork_relay::serve_listener(
        AppState::new(RelayConfig::default()),
        listener,
    ));
    format!("ws://{addr}")
}

/// Relay stand-in that acknowledges `register` and then drops the first
/// connection it accepted. Later connections stay up. Every registered
/// identity is reported on the returned receiver.
pub async fn spawn_dropping_relay() -> (String, mpsc::UnboundedReceiver<PeerId>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut accepted = 0usize;
        while let Ok((stream, _)) = listener.accept().await {
            accepted += 1;
            let drop_after_register = accepted == 1;
            let tx = tx.clone();
            tokio::spawn(async move {
                let Ok(mut socket) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(message)) = socket.next().await {
                    let Message::Text(text) = message else {
                        continue;
                    };
                    if let Ok(ClientFrame::Register { peer_id }) = ClientFrame::from_text(&text) {
                        let _ = tx.send(peer_id.clone());
                        let ack = RelayFrame::Registered { peer_id }.to_text().unwrap();
                        if socket.send(Message::Text(ack)).await.is_err() || drop_after_register {
                            return;
                        }
                    }
                }
            });
        }
    });

    (format!("ws://{addr}"), rx)
}

/// Client config with timers shrunk for tests.
pub fn test_config(relay_url: Option<String>) -> ClientConfig {
    ClientConfig {
        relay_url,
        ice_servers: Vec::new(),
        negotiation_timeout: Duration::from_secs(5),
        max_reconnect_attempts: 2,
        reconnect_step: Duration::from_millis(20),
        assumed_connect_delay: Duration::from_millis(50),
        broadcast_poll_interval: Duration::from_millis(20),
        ..ClientConfig::default()
    }
}

pub fn text_envelope(id: &str, conversation: &str, sender: &PeerId, text: &str) -> MessageEnvelope {
    MessageEnvelope::text(id, ConversationId::new(conversation), sender.clone(), text)
}

// ---------------------------------------------------------------------------
// Test peer
// ---------------------------------------------------------------------------

pub struct TestPeer {
    pub id: PeerId,
    pub handle: OrchestratorHandle,
    pub events: mpsc::UnboundedReceiver<OrchestratorEvent>,
}

pub fn spawn_peer(
    id: &str,
    config: ClientConfig,
    connector: &MemoryConnector,
    broadcast: Arc<dyn BroadcastStore>,
) -> TestPeer {
    spawn_peer_with(id, config, Arc::new(connector.clone()), broadcast)
}

pub fn spawn_peer_with(
    id: &str,
    config: ClientConfig,
    connector: Arc<dyn DirectConnector>,
    broadcast: Arc<dyn BroadcastStore>,
) -> TestPeer {
    let id = PeerId::new(id);
    let (handle, events) = Orchestrator::spawn(id.clone(), config, connector, broadcast);
    TestPeer { id, handle, events }
}

impl TestPeer {
    /// Wait for the first event matching `pred`, skipping others.
    pub async fn expect<F>(&mut self, pred: F) -> OrchestratorEvent
    where
        F: Fn(&OrchestratorEvent) -> bool,
    {
        tokio::time::timeout(TEST_TIMEOUT, async {
            loop {
                match self.events.recv().await {
                    Some(event) if pred(&event) => return event,
                    Some(_) => continue,
                    None => panic!("event stream closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    /// Fail if an event matching `pred` arrives within [`QUIET_PERIOD`].
    pub async fn assert_quiet<F>(&mut self, pred: F)
    where
        F: Fn(&OrchestratorEvent) -> bool,
    {
        let deadline = tokio::time::Instant::now() + QUIET_PERIOD;
        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, self.events.recv()).await {
            assert!(!pred(&event), "unexpected event: {event:?}");
        }
    }

    pub async fn expect_online(&mut self) {
        self.expect(|e| matches!(e, OrchestratorEvent::RelayStatus(RelayStatus::Online)))
            .await;
    }

    pub async fn expect_message(&mut self) -> (ConversationId, MessageEnvelope, TransportTier) {
        match self
            .expect(|e| matches!(e, OrchestratorEvent::Message { .. }))
            .await
        {
            OrchestratorEvent::Message {
                conversation_id,
                envelope,
                tier,
            } => (conversation_id, envelope, tier),
            _ => unreachable!(),
        }
    }
}

/// Poll `records()` until `pred` holds, returning the matching snapshot.
pub async fn wait_for_records<F>(handle: &OrchestratorHandle, pred: F) -> Vec<RecordSnapshot>
where
    F: Fn(&[RecordSnapshot]) -> bool,
{
    tokio::time::timeout(TEST_TIMEOUT, async {
        loop {
            let records = handle.records().await.unwrap();
            if pred(&records) {
                return records;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("timed out waiting for connection records")
}

pub fn is_direct_connected(event: &OrchestratorEvent) -> bool {
    matches!(
        event,
        OrchestratorEvent::Connected {
            tier: TransportTier::Direct,
            ..
        }
    )
}

pub fn is_message(event: &OrchestratorEvent) -> bool {
    matches!(event, OrchestratorEvent::Message { .. })
}

// ---------------------------------------------------------------------------
// In-memory direct channels
// ---------------------------------------------------------------------------

/// Pairs channels through a shared hub. The initiator's offer carries a hub
/// token; the responder that receives it links to the initiator, answers and
/// opens. In silent mode no signal is ever produced, so negotiation stalls.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    hub: Arc<Mutex<Hub>>,
    silent: bool,
}

#[derive(Default)]
struct Hub {
    pending: HashMap<String, Arc<Endpoint>>,
    next_token: u64,
    frames_sent: usize,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn silent() -> Self {
        Self {
            silent: true,
            ..Self::default()
        }
    }

    /// Frames written to any direct channel so far.
    pub fn frames_sent(&self) -> usize {
        self.hub.lock().unwrap().frames_sent
    }
}

impl DirectConnector for MemoryConnector {
    fn open(
        &self,
        role: Role,
        key: ChannelKey,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Box<dyn DirectChannel> {
        let endpoint = Arc::new(Endpoint {
            key,
            events,
            open: AtomicBool::new(false),
            peer: Mutex::new(None),
        });

        if role == Role::Initiator && !self.silent {
            let token = {
                let mut hub = self.hub.lock().unwrap();
                hub.next_token += 1;
                let token = format!("mem-{}", hub.next_token);
                hub.pending.insert(token.clone(), endpoint.clone());
                token
            };
            endpoint.emit(ChannelEventKind::Signal(NegotiationSignal::Offer { sdp: token }));
        }

        Box::new(MemoryChannel {
            endpoint,
            hub: self.hub.clone(),
            silent: self.silent,
        })
    }
}

struct Endpoint {
    key: ChannelKey,
    events: mpsc::UnboundedSender<ChannelEvent>,
    open: AtomicBool,
    peer: Mutex<Option<Weak<Endpoint>>>,
}

impl Endpoint {
    fn emit(&self, kind: ChannelEventKind) {
        let _ = self.events.send(ChannelEvent::new(self.key.clone(), kind));
    }

    fn peer(&self) -> Option<Arc<Endpoint>> {
        self.peer.lock().unwrap().as_ref().and_then(Weak::upgrade)
    }

    fn mark_open(&self) {
        if !self.open.swap(true, Ordering::SeqCst) {
            self.emit(ChannelEventKind::Open);
        }
    }
}

struct MemoryChannel {
    endpoint: Arc<Endpoint>,
    hub: Arc<Mutex<Hub>>,
    silent: bool,
}

impl DirectChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.endpoint.open.load(Ordering::SeqCst)
    }

    fn apply_signal(&self, signal: NegotiationSignal) {
        if self.silent {
            return;
        }
        match signal {
            NegotiationSignal::Offer { sdp } => {
                let initiator = self.hub.lock().unwrap().pending.remove(&sdp);
                if let Some(initiator) = initiator {
                    *self.endpoint.peer.lock().unwrap() = Some(Arc::downgrade(&initiator));
                    *initiator.peer.lock().unwrap() = Some(Arc::downgrade(&self.endpoint));
                    self.endpoint
                        .emit(ChannelEventKind::Signal(NegotiationSignal::Answer { sdp }));
                    self.endpoint.mark_open();
                }
            }
            NegotiationSignal::Answer { .. } => {
                if self.endpoint.peer().is_some() {
                    self.endpoint.mark_open();
                }
            }
            NegotiationSignal::Candidate { .. } => {}
        }
    }

    fn send_text(&self, text: String) -> Result<(), ClientError> {
        if !self.is_open() {
            return Err(ClientError::Direct("memory channel not open".into()));
        }
        self.hub.lock().unwrap().frames_sent += 1;
        if let Some(peer) = self.endpoint.peer() {
            peer.emit(ChannelEventKind::Data(text));
        }
        Ok(())
    }

    fn close(&self) {
        self.endpoint.open.store(false, Ordering::SeqCst);
        self.hub
            .lock()
            .unwrap()
            .pending
            .retain(|_, e| !Arc::ptr_eq(e, &self.endpoint));
        if let Some(peer) = self.endpoint.peer.lock().unwrap().take().and_then(|w| w.upgrade()) {
            if peer.open.swap(false, Ordering::SeqCst) {
                peer.emit(ChannelEventKind::Closed);
            }
        }
    }
}
