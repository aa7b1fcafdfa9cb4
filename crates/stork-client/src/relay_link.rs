//! WebSocket link from a client to the relay.
//!
//! Each dial spawns one task owning the socket. The task reports
//! [`LinkEvent`]s tagged with the dial's generation; events from an older
//! dial are dropped by [`RelayLink::accept`].

use futures::{SinkExt, StreamExt};
use stork_shared::ClientFrame;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Opened,
    Frame(String),
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkMessage {
    pub generation: u64,
    pub event: LinkEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Connecting,
    Open,
    Closed,
}

pub struct RelayLink {
    url: Option<String>,
    state: LinkState,
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<String>>,
    task: Option<JoinHandle<()>>,
    events: mpsc::UnboundedSender<LinkMessage>,
}

impl RelayLink {
    pub fn new(url: Option<String>, events: mpsc::UnboundedSender<LinkMessage>) -> Self {
        Self {
            url,
            state: LinkState::Idle,
            generation: 0,
            outbound: None,
            task: None,
            events,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.url.is_some()
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == LinkState::Open
            && self.outbound.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Start a new connection attempt, abandoning any previous one.
    pub fn dial(&mut self) {
        let Some(url) = self.url.clone() else {
            return;
        };
        self.stop_task();
        self.generation += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        self.outbound = Some(tx);
        self.state = LinkState::Connecting;

        debug!(url = %url, generation = self.generation, "Dialing relay");
        self.task = Some(tokio::spawn(run_link(
            url,
            self.generation,
            rx,
            self.events.clone(),
        )));
    }

    /// Filter and apply an event from the link task. Returns `None` for
    /// events belonging to an abandoned dial.
    pub fn accept(&mut self, message: LinkMessage) -> Option<LinkEvent> {
        if message.generation != self.generation {
            return None;
        }
        match &message.event {
            LinkEvent::Opened => self.state = LinkState::Open,
            LinkEvent::Closed => {
                self.state = LinkState::Closed;
                self.outbound = None;
                self.task = None;
            }
            LinkEvent::Frame(_) => {}
        }
        Some(message.event)
    }

    /// Queue a frame. Returns `false` when the link is not open.
    pub fn send_frame(&self, frame: &ClientFrame) -> bool {
        if !self.is_open() {
            return false;
        }
        let text = match frame.to_text() {
            Ok(text) => text,
            Err(e) => {
                warn!(kind = frame.kind(), error = %e, "Failed to encode frame");
                return false;
            }
        };
        self.outbound
            .as_ref()
            .is_some_and(|tx| tx.send(text).is_ok())
    }

    pub fn close(&mut self) {
        self.stop_task();
        self.state = LinkState::Closed;
    }

    fn stop_task(&mut self) {
        self.outbound = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run_link(
    url: String,
    generation: u64,
    mut outbound: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<LinkMessage>,
) {
    let emit = |event: LinkEvent| {
        let _ = events.send(LinkMessage { generation, event });
    };

    let socket = match connect_async(url.as_str()).await {
        Ok((socket, _response)) => socket,
        Err(e) => {
            debug!(url = %url, error = %e, "Relay dial failed");
            emit(LinkEvent::Closed);
            return;
        }
    };

    info!(url = %url, "Relay link open");
    emit(LinkEvent::Opened);

    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            queued = outbound.recv() => match queued {
                Some(text) => {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        debug!(error = %e, "Relay send failed");
                        break;
                    }
                }
                None => break,
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => emit(LinkEvent::Frame(text)),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => emit(LinkEvent::Frame(text)),
                    Err(_) => warn!("Ignoring non-UTF-8 binary frame from relay"),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "Relay read failed");
                    break;
                }
            },
        }
    }

    let _ = sink.close().await;
    info!(url = %url, "Relay link closed");
    emit(LinkEvent::Closed);
}
