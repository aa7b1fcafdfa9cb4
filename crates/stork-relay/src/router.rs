//! Stateless frame routing.
//!
//! Each inbound text frame from a client is parsed into a [`ClientFrame`]
//! and forwarded, verbatim apart from addressing tags, to the connection
//! registered for its target identity. Unknown or closed targets are
//! dropped without telling the sender: delivery is best-effort and
//! at-most-once.

use stork_shared::{ClientFrame, PeerId, RelayFrame};
use tracing::{debug, trace};

use crate::error::RelayError;
use crate::registry::{ConnectionHandle, PeerRegistry};

/// Per-connection routing state: the outbound handle and the identity the
/// connection registered, if any.
#[derive(Debug)]
pub struct ConnectionSession {
    handle: ConnectionHandle,
    peer_id: Option<PeerId>,
}

/// What happened to one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Registered { replaced: bool },
    /// Number of target connections the frame was queued on.
    Forwarded(usize),
}

impl ConnectionSession {
    pub fn new(handle: ConnectionHandle) -> Self {
        Self {
            handle,
            peer_id: None,
        }
    }

    pub fn peer_id(&self) -> Option<&PeerId> {
        self.peer_id.as_ref()
    }

    /// Parse and route one text frame.
    pub async fn route_text(
        &mut self,
        registry: &PeerRegistry,
        text: &str,
    ) -> Result<RouteOutcome, RelayError> {
        let frame = ClientFrame::from_text(text)?;
        trace!(kind = frame.kind(), "Routing frame");
        self.route(registry, frame).await
    }

    pub async fn route(
        &mut self,
        registry: &PeerRegistry,
        frame: ClientFrame,
    ) -> Result<RouteOutcome, RelayError> {
        match frame {
            ClientFrame::Register { peer_id } => self.register(registry, peer_id).await,

            ClientFrame::Signal {
                target_peer_id,
                signal,
                chat_id,
            } => {
                let frame = RelayFrame::Signal {
                    from_peer_id: self.peer_id.clone(),
                    signal,
                    chat_id,
                };
                forward(registry, &target_peer_id, &frame).await
            }

            ClientFrame::GroupSignal {
                target_peer_ids,
                signal,
                chat_id,
            } => {
                let mut delivered = 0;
                for target in target_peer_ids
                    .into_iter()
                    .filter(|id| Some(id) != self.peer_id.as_ref())
                {
                    let frame = RelayFrame::GroupSignal {
                        from_peer_id: self.peer_id.clone(),
                        signal: signal.clone(),
                        chat_id: chat_id.clone(),
                        target_peer_id: target.clone(),
                    };
                    if let RouteOutcome::Forwarded(n) = forward(registry, &target, &frame).await? {
                        delivered += n;
                    }
                }
                Ok(RouteOutcome::Forwarded(delivered))
            }

            ClientFrame::DirectMessage {
                target_peer_id,
                chat_id,
                payload,
            } => {
                let frame = RelayFrame::DirectMessage {
                    target_peer_id: target_peer_id.clone(),
                    chat_id,
                    payload,
                };
                forward(registry, &target_peer_id, &frame).await
            }

            ClientFrame::GroupMessage {
                target_peer_id,
                chat_id,
                payload,
            } => {
                let frame = RelayFrame::GroupMessage {
                    target_peer_id: target_peer_id.clone(),
                    chat_id,
                    payload,
                };
                forward(registry, &target_peer_id, &frame).await
            }

            ClientFrame::GroupUpdate {
                target_peer_id,
                data,
            } => {
                let frame = RelayFrame::GroupUpdate {
                    target_peer_id: target_peer_id.clone(),
                    data,
                };
                forward(registry, &target_peer_id, &frame).await
            }

            ClientFrame::AvatarUpdate {
                target_peer_id,
                from_peer_id,
                avatar,
            } => {
                let frame = RelayFrame::AvatarUpdate {
                    target_peer_id: target_peer_id.clone(),
                    from_peer_id: self.peer_id.clone().or(from_peer_id),
                    avatar,
                };
                forward(registry, &target_peer_id, &frame).await
            }
        }
    }

    async fn register(
        &mut self,
        registry: &PeerRegistry,
        peer_id: PeerId,
    ) -> Result<RouteOutcome, RelayError> {
        // A connection switching identities gives up its old one.
        if let Some(previous) = self.peer_id.take() {
            if previous != peer_id {
                registry.remove_connection(&previous, self.handle.id()).await;
            }
        }

        let replaced = registry
            .register(peer_id.clone(), self.handle.clone())
            .await
            .is_some();

        let ack = RelayFrame::Registered {
            peer_id: peer_id.clone(),
        }
        .to_text()?;
        self.handle.deliver(ack);
        self.peer_id = Some(peer_id);

        Ok(RouteOutcome::Registered { replaced })
    }

    /// Drop this connection's registry entry. Called once the socket closes.
    pub async fn close(&mut self, registry: &PeerRegistry) {
        if let Some(peer) = self.peer_id.take() {
            registry.remove_connection(&peer, self.handle.id()).await;
        }
    }
}

async fn forward(
    registry: &PeerRegistry,
    target: &PeerId,
    frame: &RelayFrame,
) -> Result<RouteOutcome, RelayError> {
    let Some(handle) = registry.lookup(target).await else {
        debug!(target = %target, "Target not registered, dropping frame");
        return Ok(RouteOutcome::Forwarded(0));
    };

    let text = frame.to_text()?;
    if handle.deliver(text) {
        Ok(RouteOutcome::Forwarded(1))
    } else {
        debug!(target = %target, "Target connection closed, dropping frame");
        Ok(RouteOutcome::Forwarded(0))
    }
}
