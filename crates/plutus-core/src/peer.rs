//! Tracks the set of peers currently known to a hub or agent, and their
//! liveness.

use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use serde_json::Value as JsonValue;

/// Everything known about a single peer.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    /// The peer's id.
    pub peer_id: u64,
    /// When this peer was first registered.
    pub connected_at: Instant,
    /// When the last heartbeat (or registration) was recorded for this peer.
    pub last_heartbeat: Instant,
    /// Arbitrary metadata the peer announced at join time.
    pub metadata: JsonValue,
}

/// Tracks connected peers and prunes ones that have gone quiet.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: FxHashMap<u64, PeerRecord>,
}

impl PeerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        PeerRegistry {
            peers: FxHashMap::default(),
        }
    }

    /// Register a peer, or refresh its metadata and heartbeat if already known.
    pub fn add_peer(&mut self, peer_id: u64, metadata: JsonValue) {
        let now = Instant::now();
        self.peers
            .entry(peer_id)
            .and_modify(|p| {
                p.metadata = metadata.clone();
                p.last_heartbeat = now;
            })
            .or_insert(PeerRecord {
                peer_id,
                connected_at: now,
                last_heartbeat: now,
                metadata,
            });
    }

    /// Remove a peer. No-op if the peer was not known.
    pub fn remove_peer(&mut self, peer_id: u64) {
        self.peers.remove(&peer_id);
    }

    /// Record a heartbeat for a known peer. Silently ignored for unknown peers,
    /// since a heartbeat racing a LEAVE/disconnect is expected, not an error.
    pub fn record_heartbeat(&mut self, peer_id: u64) {
        if let Some(peer) = self.peers.get_mut(&peer_id) {
            peer.last_heartbeat = Instant::now();
        }
    }

    /// Look up a peer's record.
    pub fn get_peer(&self, peer_id: u64) -> Option<&PeerRecord> {
        self.peers.get(&peer_id)
    }

    /// All currently known peer ids.
    pub fn peer_ids(&self) -> Vec<u64> {
        self.peers.keys().copied().collect()
    }

    /// Number of currently known peers.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Peer ids whose last heartbeat is older than `max_age`.
    pub fn stale_peers(&self, max_age: Duration) -> Vec<u64> {
        let now = Instant::now();
        self.peers
            .values()
            .filter(|p| now.duration_since(p.last_heartbeat) > max_age)
            .map(|p| p.peer_id)
            .collect()
    }

    /// Remove every peer whose last heartbeat is older than `max_age`, returning
    /// the ids that were pruned.
    pub fn prune_stale(&mut self, max_age: Duration) -> Vec<u64> {
        let stale = self.stale_peers(max_age);
        for peer_id in &stale {
            self.peers.remove(peer_id);
        }
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn add_then_lookup() {
        let mut reg = PeerRegistry::new();
        reg.add_peer(1, JsonValue::Null);
        assert!(reg.get_peer(1).is_some());
        assert_eq!(reg.peer_count(), 1);
    }

    #[test]
    fn remove_drops_peer() {
        let mut reg = PeerRegistry::new();
        reg.add_peer(1, JsonValue::Null);
        reg.remove_peer(1);
        assert!(reg.get_peer(1).is_none());
    }

    #[test]
    fn heartbeat_for_unknown_peer_is_ignored() {
        let mut reg = PeerRegistry::new();
        reg.record_heartbeat(999);
        assert_eq!(reg.peer_count(), 0);
    }

    #[test]
    fn stale_peers_detected_after_max_age() {
        let mut reg = PeerRegistry::new();
        reg.add_peer(1, JsonValue::Null);
        sleep(Duration::from_millis(20));
        let stale = reg.stale_peers(Duration::from_millis(5));
        assert_eq!(stale, vec![1]);
    }

    #[test]
    fn prune_stale_removes_and_returns_pruned_ids() {
        let mut reg = PeerRegistry::new();
        reg.add_peer(1, JsonValue::Null);
        reg.add_peer(2, JsonValue::Null);
        reg.record_heartbeat(2);
        sleep(Duration::from_millis(20));
        reg.record_heartbeat(2);
        let pruned = reg.prune_stale(Duration::from_millis(10));
        assert_eq!(pruned, vec![1]);
        assert_eq!(reg.peer_count(), 1);
        assert!(reg.get_peer(2).is_some());
    }
}
