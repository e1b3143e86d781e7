//! Sync engine for Plutus: a CRDT-backed replica, its wire envelope codec,
//! an append-only event log, peer bookkeeping, a broadcaster bridging local
//! updates to the network, a WebSocket transport, and the hub that relays
//! between connected peers.
//!
//! This crate embeds the [`loro`] CRDT engine rather than reimplementing
//! conflict-free replication; everything here is the bookkeeping a swarm of
//! cooperating agents needs on top of it.

pub mod broadcaster;
pub mod envelope;
pub mod error;
pub mod event_log;
pub mod hub;
pub mod namespace;
pub mod peer;
pub mod replica;
pub mod transport;
pub mod value;

pub use broadcaster::Broadcaster;
pub use envelope::{Envelope, MessageKind, WIRE_VERSION};
pub use error::{PlutusError, PlutusResult};
pub use event_log::{EventLog, Retention};
pub use hub::{Hub, HubConfig};
pub use namespace::Namespace;
pub use peer::{PeerRecord, PeerRegistry};
pub use replica::{ChangeEvent, ContainerKind, KeyChange, NamespaceChange, Replica};
pub use transport::{ConnectOptions, Transport, WebSocketTransport, DEFAULT_MAX_FRAME_SIZE};
pub use value::PlutusValue;

/// Generate a new random 64-bit peer id.
///
/// Mirrors the swarm-level peer identity scheme (not the embedded CRDT
/// engine's own, unrelated internal peer id used for op attribution).
pub fn new_peer_id() -> u64 {
    rand::random()
}
