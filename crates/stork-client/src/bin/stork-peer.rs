//! Command-line peer: `stork-peer [REMOTE_PEER_ID [CONVERSATION_ID]]`
//!
//! Each stdin line is sent to the remote peer; inbound messages are printed.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use stork_client::{
    BroadcastStore, ClientConfig, ConversationInbox, DirBroadcastStore, FileIdentityStore,
    IdentityStore, Orchestrator, OrchestratorEvent, WebRtcConnector,
};
use stork_shared::{ConversationId, MessageEnvelope, PeerId};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,stork_client=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    // -----------------------------------------------------------------------
    // 2. Identity and configuration
    // -----------------------------------------------------------------------
    let identity_store = match std::env::var("STORK_IDENTITY_FILE") {
        Ok(path) => FileIdentityStore::new(path),
        Err(_) => FileIdentityStore::default_location()?,
    };
    let local = identity_store.load_or_create()?;

    let config = ClientConfig::from_env();
    info!(
        peer = %local,
        profile = ?config.profile,
        relay = ?config.relay_url,
        "Starting Stork peer"
    );

    let broadcast_dir = config
        .broadcast_dir
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join("stork-broadcast"));
    let broadcast: Arc<dyn BroadcastStore> = Arc::new(DirBroadcastStore::open(broadcast_dir)?);
    let connector = Arc::new(WebRtcConnector::from_config(&config));

    // -----------------------------------------------------------------------
    // 3. Spawn the orchestrator and connect to the requested peer
    // -----------------------------------------------------------------------
    let (handle, mut events) = Orchestrator::spawn(local.clone(), config, connector, broadcast);

    let mut args = std::env::args().skip(1);
    let remote = args.next().map(PeerId::new);
    let conversation = args
        .next()
        .map(ConversationId::new)
        .or_else(|| remote.as_ref().map(|r| ConversationId::new(format!("chat_{r}"))));

    println!("You are {local}");
    if let (Some(remote), Some(conversation)) = (&remote, &conversation) {
        handle.connect(remote.clone(), conversation.clone()).await?;
        println!("Chatting with {remote} in {conversation}");
    }

    // -----------------------------------------------------------------------
    // 4. Pump stdin and orchestrator events until EOF or Ctrl+C
    // -----------------------------------------------------------------------
    let mut inbox = ConversationInbox::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(text) = line? else { break };
                let text = text.trim();
                if text.is_empty() {
                    continue;
                }
                let (Some(remote), Some(conversation)) = (&remote, &conversation) else {
                    warn!("No remote peer given on the command line, not sending");
                    continue;
                };
                let envelope = MessageEnvelope::text(
                    Uuid::new_v4().to_string(),
                    conversation.clone(),
                    local.clone(),
                    text,
                );
                let delivery = handle.send(remote.clone(), envelope).await?;
                info!(?delivery, "Sent");
            }
            Some(event) = events.recv() => match event {
                OrchestratorEvent::Message { conversation_id, envelope, tier } => {
                    let sender = envelope
                        .sender_name
                        .clone()
                        .unwrap_or_else(|| envelope.sender.short().to_string());
                    let text = envelope
                        .body
                        .text
                        .clone()
                        .unwrap_or_else(|| "<attachment>".to_string());
                    if inbox.accept(envelope) {
                        println!("[{conversation_id} via {tier}] {sender}: {text}");
                    }
                }
                other => info!(event = ?other, "Orchestrator event"),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                break;
            }
        }
    }

    handle.teardown().await?;
    Ok(())
}
