//! Peer-to-peer networking: wire messages, known peers and transports.

pub mod message;
pub mod peers;
pub mod transport;

pub use message::{Command, InvKind, Message, Payload, MAX_MESSAGE_SIZE, PROTOCOL_VERSION};
pub use peers::{PeerNode, PeerSet, SyncMode};
pub use transport::{inbox, LocalNetwork, LocalTransport, TcpTransport, Transport};
