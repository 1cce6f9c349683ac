use thiserror::Error;

/// Decode/encode failures for the wire format. These are never surfaced to
/// the user; the engine's pipeline drops the offending frame silently.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtoError {
    #[error("frame shorter than its fixed header")]
    Truncated,
    #[error("declared length {declared} exceeds remaining buffer of {remaining}")]
    LengthOverflow { declared: usize, remaining: usize },
    #[error("unknown message type tag {0:#04x}")]
    UnknownMessageType(u8),
    #[error("recipient id length {0} is neither a sentinel (4) nor a peer id (8)")]
    BadRecipientLen(usize),
    #[error("sender id length {0} must be 8")]
    BadSenderLen(usize),
    #[error("ttl {0} outside the valid range 0..=7")]
    InvalidTtl(u8),
}
