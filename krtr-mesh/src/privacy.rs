//! Privacy shaping: send-time jitter and cover traffic (§4.7).
//!
//! The shaper is a delay line, not a reorder buffer: entries drain in the
//! order they were enqueued once their individual deadlines have passed
//! (§5's ordering guarantee).

use crate::clock::TimeProvider;
use krtr_proto::PeerId;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Prefix marking a cover-traffic message. Filtering happens after
/// decryption so on-wire bytes stay indistinguishable from real traffic.
pub const COVER_SENTINEL: &str = "__COVER__";

pub fn is_cover_message(plaintext: &[u8]) -> bool {
    plaintext.starts_with(COVER_SENTINEL.as_bytes())
}

const COVER_PHRASES: &[&str] = &["on my way", "got it, thanks", "sounds good", "brb", "ok will do"];

pub fn make_cover_payload(rng: &mut impl Rng) -> Vec<u8> {
    let phrase = COVER_PHRASES[rng.gen_range(0..COVER_PHRASES.len())];
    format!("{COVER_SENTINEL}{phrase}").into_bytes()
}

struct QueuedSend {
    deadline: Instant,
    payload: Vec<u8>,
}

/// Delay-line + cover-traffic emitter. `min_delay`/`max_delay` of zero with
/// `jitter_enabled = false` (ultraLowPower) sends immediately.
pub struct PrivacyShaper {
    clock: Arc<dyn TimeProvider>,
    queue: VecDeque<QueuedSend>,
    min_delay: Duration,
    max_delay: Duration,
    jitter_enabled: bool,
    cover_interval: Option<(Duration, Duration)>,
    next_cover_fire: Option<Instant>,
    pub stats: PrivacyStats,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PrivacyStats {
    pub sent: u64,
    pub cover_sent: u64,
    pub cover_received: u64,
}

impl PrivacyShaper {
    pub fn new(
        clock: Arc<dyn TimeProvider>,
        min_delay: Duration,
        max_delay: Duration,
        jitter_enabled: bool,
        cover_interval: Option<(Duration, Duration)>,
    ) -> Self {
        let next_cover_fire = cover_interval.map(|(min, max)| {
            clock.now_instant() + random_between(min, max, &mut rand::thread_rng())
        });
        Self {
            clock,
            queue: VecDeque::new(),
            min_delay,
            max_delay,
            jitter_enabled,
            cover_interval,
            next_cover_fire,
            stats: PrivacyStats::default(),
        }
    }

    /// Enqueues `payload` with a random delay drawn from `[min_delay,
    /// max_delay]`, or immediately if jitter is disabled.
    pub fn enqueue(&mut self, payload: Vec<u8>) {
        let now = self.clock.now_instant();
        let delay = if self.jitter_enabled {
            random_between(self.min_delay, self.max_delay, &mut rand::thread_rng())
        } else {
            Duration::ZERO
        };
        self.queue.push_back(QueuedSend {
            deadline: now + delay,
            payload,
        });
    }

    /// Drains every entry whose deadline has passed, in enqueue order.
    pub fn drain_ready(&mut self) -> Vec<Vec<u8>> {
        let now = self.clock.now_instant();
        let mut ready = Vec::new();
        while let Some(front) = self.queue.front() {
            if front.deadline > now {
                break;
            }
            let entry = self.queue.pop_front().unwrap();
            self.stats.sent += 1;
            ready.push(entry.payload);
        }
        ready
    }

    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    /// If cover traffic is enabled and due, and at least one peer is
    /// connected, picks a uniformly random connected peer as the cover
    /// target and reschedules the next fire.
    pub fn maybe_fire_cover(&mut self, connected: &[PeerId]) -> Option<PeerId> {
        let (min, max) = self.cover_interval?;
        let now = self.clock.now_instant();
        let due = self.next_cover_fire.map(|t| now >= t).unwrap_or(false);
        if !due || connected.is_empty() {
            return None;
        }

        let mut rng = rand::thread_rng();
        self.next_cover_fire = Some(now + random_between(min, max, &mut rng));
        self.stats.cover_sent += 1;
        let target = connected[rng.gen_range(0..connected.len())];
        tracing::trace!(peer = %target.to_hex(), "firing cover traffic");
        Some(target)
    }

    pub fn record_cover_received(&mut self) {
        self.stats.cover_received += 1;
    }
}

fn random_between(min: Duration, max: Duration, rng: &mut impl Rng) -> Duration {
    if max <= min {
        return min;
    }
    let span = (max - min).as_millis() as u64;
    min + Duration::from_millis(rng.gen_range(0..=span))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualTimeProvider;

    #[test]
    fn immediate_send_when_jitter_disabled() {
        let clock = Arc::new(ManualTimeProvider::new(0));
        let mut shaper = PrivacyShaper::new(clock, Duration::ZERO, Duration::ZERO, false, None);
        shaper.enqueue(b"hi".to_vec());
        assert_eq!(shaper.drain_ready(), vec![b"hi".to_vec()]);
    }

    #[test]
    fn delayed_entry_waits_until_deadline() {
        let clock = Arc::new(ManualTimeProvider::new(0));
        let mut shaper = PrivacyShaper::new(
            clock.clone(),
            Duration::from_millis(500),
            Duration::from_millis(500),
            true,
            None,
        );
        shaper.enqueue(b"delayed".to_vec());
        assert!(shaper.drain_ready().is_empty());
        clock.advance(Duration::from_millis(500));
        assert_eq!(shaper.drain_ready(), vec![b"delayed".to_vec()]);
    }

    #[test]
    fn drain_preserves_enqueue_order() {
        let clock = Arc::new(ManualTimeProvider::new(0));
        let mut shaper = PrivacyShaper::new(clock, Duration::ZERO, Duration::ZERO, false, None);
        shaper.enqueue(b"1".to_vec());
        shaper.enqueue(b"2".to_vec());
        shaper.enqueue(b"3".to_vec());
        assert_eq!(shaper.drain_ready(), vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]);
    }

    #[test]
    fn cover_traffic_does_not_fire_with_no_connected_peers() {
        let clock = Arc::new(ManualTimeProvider::new(0));
        let mut shaper = PrivacyShaper::new(
            clock.clone(),
            Duration::ZERO,
            Duration::ZERO,
            false,
            Some((Duration::from_secs(30), Duration::from_secs(30))),
        );
        clock.advance(Duration::from_secs(31));
        assert_eq!(shaper.maybe_fire_cover(&[]), None);
    }

    #[test]
    fn cover_traffic_fires_when_due_and_peer_connected() {
        let clock = Arc::new(ManualTimeProvider::new(0));
        let mut shaper = PrivacyShaper::new(
            clock.clone(),
            Duration::ZERO,
            Duration::ZERO,
            false,
            Some((Duration::from_secs(30), Duration::from_secs(30))),
        );
        clock.advance(Duration::from_secs(31));
        let peer = PeerId::from_bytes([1; 8]);
        assert_eq!(shaper.maybe_fire_cover(&[peer]), Some(peer));
        assert_eq!(shaper.stats.cover_sent, 1);
    }

    #[test]
    fn sentinel_detection_matches_prefix_only() {
        let cover = make_cover_payload(&mut rand::thread_rng());
        assert!(is_cover_message(&cover));
        assert!(!is_cover_message(b"hello there"));
    }
}
