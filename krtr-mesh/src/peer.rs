//! Peer table: tracks everything the mesh knows about a remote PeerId.

use krtr_proto::{Fingerprint, PeerId};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct Peer {
    pub peer_id: PeerId,
    pub nickname: Option<String>,
    pub last_seen_millis: u64,
    pub signal_strength: Option<i8>,
    pub connected: bool,
    pub authenticated: bool,
    pub fingerprint: Option<Fingerprint>,
}

impl Peer {
    pub fn new(peer_id: PeerId, now_millis: u64) -> Self {
        Self {
            peer_id,
            nickname: None,
            last_seen_millis: now_millis,
            signal_strength: None,
            connected: false,
            authenticated: false,
            fingerprint: None,
        }
    }

    /// A Peer is authenticated iff its Fingerprint has been verified via a
    /// completed handshake (I6).
    pub fn mark_authenticated(&mut self, fingerprint: Fingerprint) {
        self.fingerprint = Some(fingerprint);
        self.authenticated = true;
    }
}

/// Inactivity timeout after which a peer entry is removed from the table.
pub const PEER_INACTIVITY_TIMEOUT_MILLIS: u64 = 5 * 60 * 1_000;

#[derive(Default)]
pub struct PeerTable {
    peers: HashMap<PeerId, Peer>,
    /// Secondary index so a rotated PeerId can be resolved back to the same
    /// logical peer via its stable Fingerprint (scenario 5).
    fingerprint_index: HashMap<Fingerprint, PeerId>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&Peer> {
        self.peers.get(peer_id)
    }

    pub fn get_mut(&mut self, peer_id: &PeerId) -> Option<&mut Peer> {
        self.peers.get_mut(peer_id)
    }

    /// Updates (creating if absent) the entry for `peer_id`: last-seen,
    /// signal strength, and nickname if present (§4.9 step 4).
    pub fn observe(
        &mut self,
        peer_id: PeerId,
        now_millis: u64,
        signal_strength: Option<i8>,
        nickname: Option<String>,
    ) -> &mut Peer {
        let peer = self.peers.entry(peer_id).or_insert_with(|| Peer::new(peer_id, now_millis));
        peer.last_seen_millis = now_millis;
        if let Some(rssi) = signal_strength {
            peer.signal_strength = Some(rssi);
        }
        if let Some(name) = nickname {
            peer.nickname = Some(name);
        }
        if let Some(fp) = peer.fingerprint {
            self.fingerprint_index.insert(fp, peer_id);
        }
        self.peers.get_mut(&peer_id).expect("just inserted")
    }

    pub fn mark_connected(&mut self, peer_id: PeerId, now_millis: u64) {
        self.observe(peer_id, now_millis, None, None).connected = true;
    }

    pub fn mark_disconnected(&mut self, peer_id: &PeerId) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.connected = false;
        }
    }

    pub fn mark_authenticated(&mut self, peer_id: &PeerId, fingerprint: Fingerprint) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.mark_authenticated(fingerprint);
            self.fingerprint_index.insert(fingerprint, *peer_id);
        }
    }

    /// Resolves a fingerprint to whichever PeerId last announced it,
    /// surviving PeerId rotation (scenario 5).
    pub fn resolve_fingerprint(&self, fingerprint: &Fingerprint) -> Option<PeerId> {
        self.fingerprint_index.get(fingerprint).copied()
    }

    pub fn remove(&mut self, peer_id: &PeerId) -> Option<Peer> {
        self.peers.remove(peer_id)
    }

    pub fn connected_peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values().filter(|p| p.connected)
    }

    pub fn active_peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn connected_peer_count(&self) -> usize {
        self.connected_peers().count()
    }

    /// Drops peers not seen for `PEER_INACTIVITY_TIMEOUT_MILLIS`.
    pub fn sweep_inactive(&mut self, now_millis: u64) {
        let before = self.peers.len();
        self.peers
            .retain(|_, p| now_millis.saturating_sub(p.last_seen_millis) < PEER_INACTIVITY_TIMEOUT_MILLIS);
        let dropped = before - self.peers.len();
        if dropped > 0 {
            tracing::debug!(dropped, "dropped inactive peers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observing_unknown_peer_creates_entry() {
        let mut table = PeerTable::new();
        let id = PeerId::from_bytes([1; 8]);
        table.observe(id, 1_000, Some(-40), Some("alice".into()));
        let peer = table.get(&id).unwrap();
        assert_eq!(peer.nickname.as_deref(), Some("alice"));
        assert_eq!(peer.signal_strength, Some(-40));
    }

    #[test]
    fn fingerprint_survives_peer_id_change() {
        let mut table = PeerTable::new();
        let old_id = PeerId::from_bytes([1; 8]);
        let new_id = PeerId::from_bytes([2; 8]);
        let fp = Fingerprint::from_bytes([9; 16]);

        table.observe(old_id, 0, None, None);
        table.mark_authenticated(&old_id, fp);
        table.observe(new_id, 10_000, None, None);
        table.mark_authenticated(&new_id, fp);

        assert_eq!(table.resolve_fingerprint(&fp), Some(new_id));
    }

    #[test]
    fn inactive_peer_is_swept() {
        let mut table = PeerTable::new();
        let id = PeerId::from_bytes([3; 8]);
        table.observe(id, 0, None, None);
        table.sweep_inactive(PEER_INACTIVITY_TIMEOUT_MILLIS + 1);
        assert!(table.get(&id).is_none());
    }
}
