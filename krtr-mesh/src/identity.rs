//! Ephemeral PeerId generation and rotation (§4.6).
//!
//! Deliberately has no notion of delegation or certificate chains: a single
//! long-lived `IdentityKeyPair` (crypto.rs) signs each rotation's binding
//! announcement directly, and peers trust it on first sight (trust-on-first-
//! use), same as the rest of the mesh's flat PeerId space.

use crate::crypto::IdentityKeyPair;
use krtr_proto::PeerId;
use rand::Rng;
use std::time::Duration;

pub const ROTATION_GRACE_PERIOD: Duration = Duration::from_secs(60);
const ROTATION_BASE_MIN_SECS: u64 = 3_600;
const ROTATION_BASE_MAX_SECS: u64 = 21_600;
const ROTATION_JITTER_SECS: i64 = 1_800;
const ROTATION_STAGGER_MAX_SECS: u64 = 300;
pub const IDENTITY_ANNOUNCE_DELAY: Duration = Duration::from_millis(500);

/// Generates a fresh PeerId: 8 random bytes, with the low 4 bytes
/// overwritten by the low 32 bits of `now_millis` (§4.6).
pub fn generate_peer_id(now_millis: u64) -> PeerId {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill(&mut bytes);
    let low32 = (now_millis & 0xFFFF_FFFF) as u32;
    bytes[4..8].copy_from_slice(&low32.to_be_bytes());
    PeerId::from_bytes(bytes)
}

/// Picks the next rotation interval: `U[3600, 21600] + U[-1800, 1800] +
/// U[0, 300]` seconds, unless `base_override_secs` (the §6 `rotationInterval`
/// config option) pins the base term to a fixed value instead of sampling it.
pub fn next_rotation_interval(base_override_secs: Option<u64>) -> Duration {
    let mut rng = rand::thread_rng();
    let base = match base_override_secs {
        Some(secs) => secs as i64,
        None => rng.gen_range(ROTATION_BASE_MIN_SECS..=ROTATION_BASE_MAX_SECS) as i64,
    };
    let jitter = rng.gen_range(-ROTATION_JITTER_SECS..=ROTATION_JITTER_SECS);
    let stagger = rng.gen_range(0..=ROTATION_STAGGER_MAX_SECS) as i64;
    let total = (base + jitter + stagger).max(0) as u64;
    Duration::from_secs(total)
}

/// Tracks the locally owned PeerId across rotations, honoring the previous
/// id for `ROTATION_GRACE_PERIOD` after each rotation (I7).
pub struct IdentityRotation {
    current: PeerId,
    previous: Option<(PeerId, u64)>,
    grace_period: Duration,
}

impl IdentityRotation {
    pub fn new(current: PeerId) -> Self {
        Self {
            current,
            previous: None,
            grace_period: ROTATION_GRACE_PERIOD,
        }
    }

    pub fn with_grace_period(current: PeerId, grace_period: Duration) -> Self {
        Self {
            current,
            previous: None,
            grace_period,
        }
    }

    pub fn current(&self) -> PeerId {
        self.current
    }

    /// The PeerId being retired by the most recent rotation, if any.
    pub fn previous(&self) -> Option<PeerId> {
        self.previous.map(|(id, _)| id)
    }

    /// Rotates to `new_id`, remembering the outgoing id as valid for the
    /// grace period starting at `now_millis`.
    pub fn rotate(&mut self, new_id: PeerId, now_millis: u64) {
        self.previous = Some((self.current, now_millis));
        self.current = new_id;
    }

    /// Whether `sender` may be honored as a valid sender identity at
    /// `now_millis`: the current id always is; the previous id is, until
    /// the grace period elapses (I7).
    pub fn accepts_sender(&self, sender: &PeerId, now_millis: u64) -> bool {
        if *sender == self.current {
            return true;
        }
        match self.previous {
            Some((prev, rotated_at)) if prev == *sender => {
                now_millis.saturating_sub(rotated_at) <= self.grace_period.as_millis() as u64
            }
            _ => false,
        }
    }
}

/// Produces the signed binding payload for a `noiseIdentityAnnounce`: a
/// signature over `newPeerId || timestamp` (§4.6 step 4).
pub fn sign_rotation_announce(identity: &IdentityKeyPair, new_peer_id: &PeerId, timestamp_millis: u64) -> [u8; 64] {
    identity.sign_identity_announce(new_peer_id.as_bytes(), timestamp_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_peer_id_embeds_low_32_bits_of_timestamp() {
        let id = generate_peer_id(0x1122_3344_5566_7788);
        assert_eq!(&id.as_bytes()[4..8], &0x5566_7788u32.to_be_bytes());
    }

    #[test]
    fn rotation_interval_is_within_expected_bounds() {
        for _ in 0..50 {
            let interval = next_rotation_interval(None);
            assert!(interval.as_secs() <= ROTATION_BASE_MAX_SECS + 1_800 + 300);
        }
    }

    #[test]
    fn rotation_interval_override_pins_the_base_term() {
        for _ in 0..50 {
            let interval = next_rotation_interval(Some(60)).as_secs();
            assert!(interval <= 60 + 1_800 + 300);
        }
    }

    #[test]
    fn previous_peer_id_accepted_within_grace_period() {
        let old_id = generate_peer_id(1_000);
        let new_id = generate_peer_id(2_000);
        let mut rotation = IdentityRotation::new(old_id);
        rotation.rotate(new_id, 100_000);

        assert!(rotation.accepts_sender(&new_id, 100_001));
        assert!(rotation.accepts_sender(&old_id, 100_001));
        assert!(rotation.accepts_sender(&old_id, 100_000 + 60_000));
        assert!(!rotation.accepts_sender(&old_id, 100_000 + 60_001));
    }

    #[test]
    fn unrelated_sender_never_accepted() {
        let old_id = generate_peer_id(1_000);
        let new_id = generate_peer_id(2_000);
        let stranger = generate_peer_id(3_000);
        let mut rotation = IdentityRotation::new(old_id);
        rotation.rotate(new_id, 0);
        assert!(!rotation.accepts_sender(&stranger, 0));
    }
}
