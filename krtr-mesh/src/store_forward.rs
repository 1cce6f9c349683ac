//! Store-and-forward cache (§4.8): holds undelivered packets for an offline
//! recipient, up to a TTL and a capacity that depends on favorite status.

use crate::clock::TimeProvider;
use krtr_proto::{Packet, PeerId};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_MAX_CACHED: usize = 100;
pub const DEFAULT_MAX_CACHED_FAVORITES: usize = 1_000;
pub const DEFAULT_STORE_TTL: Duration = Duration::from_secs(43_200);

pub struct StoredPacket {
    pub packet: Packet,
    pub inserted_at_millis: u64,
    pub message_id: u32,
    pub is_for_favorite: bool,
}

struct PerPeerQueue {
    entries: VecDeque<StoredPacket>,
}

impl PerPeerQueue {
    fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }
}

/// Time-bounded queue of undelivered packets with per-recipient tiered
/// retention (I5).
pub struct StoreForwardCache {
    clock: Arc<dyn TimeProvider>,
    per_peer: HashMap<PeerId, PerPeerQueue>,
    ttl: Duration,
    max_cached: usize,
    max_cached_favorites: usize,
}

impl StoreForwardCache {
    pub fn new(clock: Arc<dyn TimeProvider>, ttl: Duration, max_cached: usize, max_cached_favorites: usize) -> Self {
        Self {
            clock,
            per_peer: HashMap::new(),
            ttl,
            max_cached,
            max_cached_favorites,
        }
    }

    /// Inserts `packet` for a currently unreachable `recipient`, evicting
    /// the oldest entry for that recipient first if at the relevant
    /// capacity (I5).
    pub fn store(&mut self, recipient: PeerId, packet: Packet, message_id: u32, is_for_favorite: bool) {
        let now = self.clock.now_millis();
        let cap = if is_for_favorite {
            self.max_cached_favorites
        } else {
            self.max_cached
        };
        let queue = self.per_peer.entry(recipient).or_insert_with(PerPeerQueue::new);
        if queue.entries.len() >= cap {
            tracing::debug!(recipient = %recipient.to_hex(), cap, "store-forward cache full, evicting oldest");
            queue.entries.pop_front();
        }
        queue.entries.push_back(StoredPacket {
            packet,
            inserted_at_millis: now,
            message_id,
            is_for_favorite,
        });
    }

    /// Releases every packet cached for `recipient`, in insertion order, on
    /// reconnect (§4.8).
    pub fn release(&mut self, recipient: &PeerId) -> Vec<Packet> {
        match self.per_peer.remove(recipient) {
            Some(queue) => queue.entries.into_iter().map(|e| e.packet).collect(),
            None => Vec::new(),
        }
    }

    /// Drops every entry older than the configured TTL across all
    /// recipients.
    pub fn sweep_expired(&mut self) {
        let now = self.clock.now_millis();
        let ttl_millis = self.ttl.as_millis() as u64;
        let before = self.total_cached();
        self.per_peer.retain(|_, queue| {
            queue
                .entries
                .retain(|e| now.saturating_sub(e.inserted_at_millis) < ttl_millis);
            !queue.entries.is_empty()
        });
        let dropped = before - self.total_cached();
        if dropped > 0 {
            tracing::debug!(dropped, "swept expired store-forward entries");
        }
    }

    pub fn cached_count_for(&self, recipient: &PeerId) -> usize {
        self.per_peer.get(recipient).map(|q| q.entries.len()).unwrap_or(0)
    }

    pub fn total_cached(&self) -> usize {
        self.per_peer.values().map(|q| q.entries.len()).sum()
    }
}
