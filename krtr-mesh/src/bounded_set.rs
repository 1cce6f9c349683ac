//! Fixed-capacity, FIFO-evicting membership filter.
//!
//! Used both for de-duplicating floods (`SeenPackets`, §3) and anywhere else
//! the mesh needs "have I seen this before, bounded by memory" semantics.
//! Reads (`contains`) may run concurrently; writes (`insert`, `remove`) are
//! serialized behind a single exclusive lock, matching §5's reader/writer
//! discipline for the engine's shared collections.

use parking_lot::RwLock;
use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

struct Inner<T> {
    order: VecDeque<T>,
    members: HashSet<T>,
    capacity: usize,
}

impl<T: Eq + Hash + Clone> Inner<T> {
    fn insert(&mut self, value: T) -> bool {
        if self.members.contains(&value) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        self.order.push_back(value.clone());
        self.members.insert(value);
        true
    }

    fn remove(&mut self, value: &T) -> bool {
        if self.members.remove(value) {
            if let Some(pos) = self.order.iter().position(|v| v == value) {
                self.order.remove(pos);
            }
            true
        } else {
            false
        }
    }
}

/// A bounded, insertion-ordered set. At capacity, inserting a new element
/// evicts the oldest one first.
pub struct BoundedSet<T> {
    inner: RwLock<Inner<T>>,
}

impl<T: Eq + Hash + Clone> BoundedSet<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "BoundedSet capacity must be positive");
        Self {
            inner: RwLock::new(Inner {
                order: VecDeque::with_capacity(capacity),
                members: HashSet::with_capacity(capacity),
                capacity,
            }),
        }
    }

    /// Inserts `value`, evicting the oldest entry if at capacity. Returns
    /// `true` if the value was newly inserted, `false` if it was already a
    /// member (in which case no eviction happens).
    pub fn insert(&self, value: T) -> bool {
        self.inner.write().insert(value)
    }

    pub fn contains(&self, value: &T) -> bool {
        self.inner.read().members.contains(value)
    }

    pub fn remove(&self, value: &T) -> bool {
        self.inner.write().remove(value)
    }

    pub fn len(&self) -> usize {
        self.inner.read().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.read().capacity
    }
}

/// A 16-byte fingerprint over `(senderId, timestamp, type, first 16 bytes of
/// payload)`, used to deduplicate packets seen across the mesh regardless of
/// which path they arrived by.
pub type PacketFingerprint = [u8; 16];

pub fn packet_fingerprint(
    sender_id: &[u8],
    timestamp_millis: u64,
    message_type: u8,
    payload: &[u8],
) -> PacketFingerprint {
    const PAYLOAD_PREFIX: usize = 16;
    let mut hasher = blake3::Hasher::new();
    hasher.update(sender_id);
    hasher.update(&timestamp_millis.to_be_bytes());
    hasher.update(&[message_type]);
    hasher.update(&payload[..payload.len().min(PAYLOAD_PREFIX)]);
    let digest = hasher.finalize();
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest.as_bytes()[..16]);
    out
}

/// The process-global seen-packet filter (I3): capacity 1024 by default.
pub const DEFAULT_SEEN_CAPACITY: usize = 1024;

pub struct SeenPackets {
    set: BoundedSet<PacketFingerprint>,
}

impl SeenPackets {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            set: BoundedSet::with_capacity(capacity),
        }
    }

    /// Records `fp` if unseen. Returns `true` if this is the first sighting
    /// (the caller should deliver/relay); `false` if it is a duplicate (the
    /// caller must drop it silently, I3).
    pub fn record(&self, fp: PacketFingerprint) -> bool {
        self.set.insert(fp)
    }

    pub fn contains(&self, fp: &PacketFingerprint) -> bool {
        self.set.contains(fp)
    }
}

impl Default for SeenPackets {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_SEEN_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_on_overflow() {
        let set: BoundedSet<u32> = BoundedSet::with_capacity(3);
        for i in 0..3 {
            assert!(set.insert(i));
        }
        assert!(set.insert(3));
        assert!(!set.contains(&0), "oldest entry should have been evicted");
        assert!(set.contains(&1));
        assert!(set.contains(&2));
        assert!(set.contains(&3));
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn reinserting_existing_member_does_not_evict() {
        let set: BoundedSet<u32> = BoundedSet::with_capacity(2);
        set.insert(1);
        set.insert(2);
        assert!(!set.insert(1), "already present, should not count as fresh");
        assert!(set.contains(&1));
        assert!(set.contains(&2));
    }

    #[test]
    fn seen_packets_drops_duplicates() {
        let seen = SeenPackets::with_capacity(4);
        let fp = packet_fingerprint(b"sender1!", 1234, 0x02, b"hello");
        assert!(seen.record(fp));
        assert!(!seen.record(fp), "duplicate should report false");
        assert!(seen.contains(&fp));
    }

    #[test]
    fn fingerprint_only_considers_first_16_payload_bytes() {
        let short = packet_fingerprint(b"sender1!", 1, 0x02, b"0123456789ABCDEF");
        let long = packet_fingerprint(b"sender1!", 1, 0x02, b"0123456789ABCDEFGHIJK");
        assert_eq!(short, long);
    }
}
