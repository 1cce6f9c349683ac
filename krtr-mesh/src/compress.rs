//! Entropy-gated LZ compression for outbound payloads.
//!
//! Compression is skipped for payloads that are small or already
//! high-entropy (already compressed or encrypted), since running the
//! compressor on such data wastes CPU and usually grows the payload.

pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 100;
pub const LOW_POWER_COMPRESSION_THRESHOLD: usize = 50;
pub const DEFAULT_MAX_COMPRESSION_RATIO: f64 = 0.9;
pub const MAX_ENTROPY_BITS_PER_BYTE: f64 = 7.5;
const ENTROPY_SAMPLE_LEN: usize = 64;

/// Shannon entropy, in bits/byte, over the first `ENTROPY_SAMPLE_LEN` bytes
/// of `data` (or all of it, if shorter).
pub fn sample_entropy(data: &[u8]) -> f64 {
    let sample = &data[..data.len().min(ENTROPY_SAMPLE_LEN)];
    if sample.is_empty() {
        return 0.0;
    }
    let mut counts = [0u32; 256];
    for &b in sample {
        counts[b as usize] += 1;
    }
    let len = sample.len() as f64;
    counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / len;
            -p * p.log2()
        })
        .sum()
}

/// Outcome of attempting compression: either the compressed form was kept,
/// or the original was kept because compression didn't help (or wasn't
/// attempted).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionOutcome {
    Compressed,
    KeptOriginal,
}

/// Applies entropy-gated compression to `payload`. Returns the bytes to
/// actually send and whether compression was applied; on any internal
/// failure of the compressor, falls back to the original bytes (compression
/// failures are non-fatal).
pub fn compress(payload: &[u8], threshold: usize, max_ratio: f64) -> (Vec<u8>, CompressionOutcome) {
    if payload.len() < threshold {
        return (payload.to_vec(), CompressionOutcome::KeptOriginal);
    }
    if sample_entropy(payload) > MAX_ENTROPY_BITS_PER_BYTE {
        return (payload.to_vec(), CompressionOutcome::KeptOriginal);
    }

    let compressed = lz4_flex::compress_prepend_size(payload);
    let ratio = compressed.len() as f64 / payload.len() as f64;
    if ratio <= max_ratio {
        tracing::trace!(before = payload.len(), after = compressed.len(), "compressed outbound payload");
        (compressed, CompressionOutcome::Compressed)
    } else {
        (payload.to_vec(), CompressionOutcome::KeptOriginal)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecompressError {
    #[error("lz4 decompression failed: {0}")]
    Lz4(String),
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>, DecompressError> {
    lz4_flex::decompress_size_prepended(data).map_err(|e| DecompressError::Lz4(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_payload_is_left_uncompressed() {
        let payload = vec![b'a'; 10];
        let (out, outcome) = compress(&payload, DEFAULT_COMPRESSION_THRESHOLD, DEFAULT_MAX_COMPRESSION_RATIO);
        assert_eq!(outcome, CompressionOutcome::KeptOriginal);
        assert_eq!(out, payload);
    }

    #[test]
    fn low_entropy_payload_compresses_and_round_trips() {
        let payload = vec![b'x'; 500];
        let (out, outcome) = compress(&payload, DEFAULT_COMPRESSION_THRESHOLD, DEFAULT_MAX_COMPRESSION_RATIO);
        assert_eq!(outcome, CompressionOutcome::Compressed);
        assert!(out.len() < payload.len());
        assert_eq!(decompress(&out).unwrap(), payload);
    }

    #[test]
    fn high_entropy_payload_is_kept_original() {
        // Pseudo-random bytes via a simple LCG: high entropy, should not
        // compress favorably.
        let mut state: u32 = 0x12345678;
        let payload: Vec<u8> = (0..500)
            .map(|_| {
                state = state.wrapping_mul(1664525).wrapping_add(1013904223);
                (state >> 24) as u8
            })
            .collect();
        let (out, outcome) = compress(&payload, DEFAULT_COMPRESSION_THRESHOLD, DEFAULT_MAX_COMPRESSION_RATIO);
        assert_eq!(outcome, CompressionOutcome::KeptOriginal);
        assert_eq!(out, payload);
    }

    #[test]
    fn entropy_of_constant_bytes_is_zero() {
        assert_eq!(sample_entropy(&[7u8; 100]), 0.0);
    }
}
