// Client runtime: connection orchestration over direct, relayed and
// same-device transports.

pub mod broadcast;
pub mod config;
pub mod direct;
pub mod error;
pub mod events;
pub mod identity;
pub mod inbox;
pub mod negotiation;
pub mod orchestrator;
pub mod reconnect;
pub mod records;
pub mod relay_link;
pub mod transport;
pub mod webrtc_channel;

pub use broadcast::{BroadcastEntry, BroadcastStore, DirBroadcastStore, MemoryBroadcastStore};
pub use config::{ClientConfig, IceServer, NetworkProfile};
pub use direct::{ChannelEvent, ChannelEventKind, ChannelKey, DirectChannel, DirectConnector};
pub use error::{ClientError, Result};
pub use events::{OrchestratorEvent, RelayStatus};
pub use identity::{FileIdentityStore, IdentityStore};
pub use inbox::ConversationInbox;
pub use negotiation::Role;
pub use orchestrator::{Orchestrator, OrchestratorHandle};
pub use records::RecordSnapshot;
pub use transport::Delivery;
pub use webrtc_channel::WebRtcConnector;
