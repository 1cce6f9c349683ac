//! Splits payloads larger than the link MTU into fragments, and reassembles
//! fragments back into a payload on the receiving side.
//!
//! The fragment header is encoded as a small binary TLV rather than JSON:
//! the wire budget here is a handful of bytes per fragment on a sub-500-byte
//! MTU, where JSON's per-field overhead would eat a meaningful fraction of
//! every frame. The header is prefixed by its own 2-byte length so a future
//! revision can grow it without breaking framing.

use crate::clock::TimeProvider;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_MAX_FRAGMENT_SIZE: usize = 500;
pub const DEFAULT_FRAGMENT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub message_id: u32,
    pub index: u16,
    pub total: u16,
    pub is_first: bool,
    pub is_last: bool,
}

impl FragmentHeader {
    const ENCODED_LEN: usize = 4 + 2 + 2 + 1;

    fn encode(self) -> [u8; Self::ENCODED_LEN] {
        let mut buf = [0u8; Self::ENCODED_LEN];
        buf[0..4].copy_from_slice(&self.message_id.to_be_bytes());
        buf[4..6].copy_from_slice(&self.index.to_be_bytes());
        buf[6..8].copy_from_slice(&self.total.to_be_bytes());
        buf[8] = (self.is_first as u8) | ((self.is_last as u8) << 1);
        buf
    }

    fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() != Self::ENCODED_LEN {
            return None;
        }
        let message_id = u32::from_be_bytes(buf[0..4].try_into().ok()?);
        let index = u16::from_be_bytes(buf[4..6].try_into().ok()?);
        let total = u16::from_be_bytes(buf[6..8].try_into().ok()?);
        let flags = buf[8];
        Some(Self {
            message_id,
            index,
            total,
            is_first: flags & 0b01 != 0,
            is_last: flags & 0b10 != 0,
        })
    }
}

/// Splits `payload` into fragments no larger than `max_fragment_size`,
/// each prefixed with a 2-byte header length and the TLV header itself.
pub fn fragment(message_id: u32, payload: &[u8], max_fragment_size: usize) -> Vec<Vec<u8>> {
    assert!(max_fragment_size > 0);
    if payload.is_empty() {
        let header = FragmentHeader {
            message_id,
            index: 0,
            total: 1,
            is_first: true,
            is_last: true,
        };
        return vec![frame(header, &[])];
    }

    let chunks: Vec<&[u8]> = payload.chunks(max_fragment_size).collect();
    let total = chunks.len() as u16;
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            let header = FragmentHeader {
                message_id,
                index: i as u16,
                total,
                is_first: i == 0,
                is_last: i as u16 + 1 == total,
            };
            frame(header, chunk)
        })
        .collect()
}

fn frame(header: FragmentHeader, chunk: &[u8]) -> Vec<u8> {
    let encoded = header.encode();
    let mut out = Vec::with_capacity(2 + encoded.len() + chunk.len());
    out.extend_from_slice(&(encoded.len() as u16).to_be_bytes());
    out.extend_from_slice(&encoded);
    out.extend_from_slice(chunk);
    out
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FragmentError {
    #[error("frame too short to contain a header length prefix")]
    Truncated,
    #[error("malformed fragment header")]
    BadHeader,
    #[error("fragment index {index} out of range for total {total}")]
    IndexOutOfRange { index: u16, total: u16 },
    #[error("fragment declares total=0")]
    ZeroTotal,
    #[error("fragment's total ({declared}) disagrees with buffer's ({existing})")]
    InconsistentTotal { declared: u16, existing: u16 },
}

/// Parses a single on-wire fragment frame into its header and payload chunk.
pub fn parse_fragment(frame: &[u8]) -> Result<(FragmentHeader, &[u8]), FragmentError> {
    if frame.len() < 2 {
        return Err(FragmentError::Truncated);
    }
    let header_len = u16::from_be_bytes([frame[0], frame[1]]) as usize;
    if frame.len() < 2 + header_len {
        return Err(FragmentError::Truncated);
    }
    let header = FragmentHeader::decode(&frame[2..2 + header_len]).ok_or(FragmentError::BadHeader)?;
    if header.total == 0 {
        return Err(FragmentError::ZeroTotal);
    }
    if header.index >= header.total {
        return Err(FragmentError::IndexOutOfRange {
            index: header.index,
            total: header.total,
        });
    }
    Ok((header, &frame[2 + header_len..]))
}

struct ReassemblyBuffer {
    total: u16,
    slots: Vec<Option<Vec<u8>>>,
    received_count: u16,
    first_seen: std::time::Instant,
}

impl ReassemblyBuffer {
    fn new(total: u16, now: std::time::Instant) -> Self {
        Self {
            total,
            slots: vec![None; total as usize],
            received_count: 0,
            first_seen: now,
        }
    }

    fn is_complete(&self) -> bool {
        self.received_count == self.total
    }

    fn assemble(self) -> Vec<u8> {
        let mut out = Vec::new();
        for slot in self.slots {
            out.extend_from_slice(&slot.expect("buffer reported complete"));
        }
        out
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ReassemblyStats {
    pub timeouts: u64,
    pub completed: u64,
    pub duplicates_dropped: u64,
}

/// Tracks in-flight reassembly buffers, one per `(sender, message_id)`,
/// expiring any buffer older than `timeout`. Keying on sender as well as
/// message id matters because each peer's message-id counter starts fresh,
/// so two peers' fragments can legitimately collide on the same id.
pub struct Reassembler {
    buffers: HashMap<(u64, u32), ReassemblyBuffer>,
    timeout: Duration,
    clock: Arc<dyn TimeProvider>,
    stats: ReassemblyStats,
}

impl Reassembler {
    pub fn new(clock: Arc<dyn TimeProvider>, timeout: Duration) -> Self {
        Self {
            buffers: HashMap::new(),
            timeout,
            clock,
            stats: ReassemblyStats::default(),
        }
    }

    pub fn stats(&self) -> ReassemblyStats {
        self.stats
    }

    /// Feeds one on-wire fragment frame in from `sender`. Returns
    /// `Ok(Some(payload))` once every fragment for its `message_id` has
    /// arrived; `Ok(None)` while still waiting (including for a
    /// silently-dropped duplicate).
    pub fn accept(&mut self, sender: [u8; 8], frame: &[u8]) -> Result<Option<Vec<u8>>, FragmentError> {
        let (header, chunk) = parse_fragment(frame)?;
        let now = self.clock.now_instant();
        let key = (u64::from_be_bytes(sender), header.message_id);

        let buffer = self
            .buffers
            .entry(key)
            .or_insert_with(|| ReassemblyBuffer::new(header.total, now));

        if buffer.total != header.total {
            return Err(FragmentError::InconsistentTotal {
                declared: header.total,
                existing: buffer.total,
            });
        }

        if buffer.slots[header.index as usize].is_some() {
            self.stats.duplicates_dropped += 1;
            return Ok(None);
        }

        buffer.slots[header.index as usize] = Some(chunk.to_vec());
        buffer.received_count += 1;

        if buffer.is_complete() {
            let buffer = self.buffers.remove(&key).expect("just inserted");
            self.stats.completed += 1;
            return Ok(Some(buffer.assemble()));
        }

        Ok(None)
    }

    /// Discards any buffer whose age exceeds `timeout`, counting each as a
    /// reassembly timeout.
    pub fn sweep(&mut self) {
        let now = self.clock.now_instant();
        let timeout = self.timeout;
        let before = self.buffers.len();
        self.buffers
            .retain(|_, buf| now.duration_since(buf.first_seen) < timeout);
        let dropped = before - self.buffers.len();
        if dropped > 0 {
            tracing::debug!(dropped, "dropped incomplete fragment buffers on timeout");
        }
        self.stats.timeouts += dropped as u64;
    }

    pub fn pending_count(&self) -> usize {
        self.buffers.len()
    }
}
