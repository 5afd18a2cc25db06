//! Wire protocol: typed messages and the validated envelope they travel in.

pub mod envelope;
pub mod message;

pub use envelope::Envelope;
pub use message::{ConnectionType, PeerStatus, ProtocolMessage, RosterEntry, TransportState, RELAYABLE_KINDS};
