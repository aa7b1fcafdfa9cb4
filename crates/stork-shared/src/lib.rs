// Envelope and routing contract shared by the relay and the client runtime.

pub mod constants;
pub mod envelope;
pub mod error;
pub mod protocol;
pub mod types;

pub use envelope::{Attachment, GroupMeta, GroupRosterUpdate, MessageBody, MessageEnvelope};
pub use error::ProtocolError;
pub use protocol::{ClientFrame, IceCandidate, NegotiationSignal, RelayFrame};
pub use types::{ConversationId, Participant, PeerId, TransportTier};
