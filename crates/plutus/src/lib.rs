//! The consumer-facing surface of Plutus: an [`Agent`] joins a swarm, reads
//! and writes typed [`Namespace`](plutus_core::Namespace) state, and fires
//! lifecycle hooks as things happen around it. Everything else (the CRDT
//! engine, wire codec, hub, transport) lives in `plutus-core` and is
//! re-exported here for convenience.

mod agent;
mod lifecycle;

pub use agent::Agent;
pub use lifecycle::{HookId, LifecycleContext, LifecycleEvent, LifecycleManager};

pub use plutus_core::{
    new_peer_id, Broadcaster, ChangeEvent, ConnectOptions, ContainerKind, Envelope, EventLog,
    Hub, HubConfig, KeyChange, MessageKind, Namespace, NamespaceChange, PeerRecord, PeerRegistry,
    PlutusError, PlutusResult, PlutusValue, Replica, Retention, Transport, WebSocketTransport,
    DEFAULT_MAX_FRAME_SIZE, WIRE_VERSION,
};
