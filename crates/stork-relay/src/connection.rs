//! Per-connection event loop.
//!
//! Every accepted WebSocket gets an outbound queue drained by a writer task
//! and a single dispatch loop over its inbound frames. Frames are routed one
//! at a time, so a connection never re-enters its own handlers.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::RelayError;
use crate::registry::{ConnectionHandle, PeerRegistry};
use crate::router::{ConnectionSession, RouteOutcome};

pub async fn run_connection(socket: WebSocket, registry: Arc<PeerRegistry>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let handle = ConnectionHandle::new(registry.next_connection_id(), tx);
    let connection = handle.id();
    let mut session = ConnectionSession::new(handle);

    debug!(connection, "Relay connection opened");

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    warn!(connection, error = %RelayError::NotUtf8, "Ignoring frame");
                    continue;
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(connection, error = %e, "Relay connection errored");
                break;
            }
        };

        match session.route_text(&registry, &text).await {
            Ok(RouteOutcome::Registered { replaced }) => {
                info!(
                    connection,
                    peer = ?session.peer_id(),
                    replaced,
                    "Peer registered"
                );
            }
            Ok(RouteOutcome::Forwarded(_)) => {}
            Err(e) => {
                warn!(connection, error = %e, "Ignoring malformed frame");
            }
        }
    }

    let peer = session.peer_id().cloned();
    session.close(&registry).await;
    writer.abort();

    debug!(connection, peer = ?peer, "Relay connection closed");
}
