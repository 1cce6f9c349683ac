//! Mesh-level error taxonomy.
//!
//! Grouped by kind rather than by source type: most of these are expected
//! to be logged and swallowed by the engine rather than propagated, per the
//! propagation policy (only user-addressable failures reach the delegate).

use krtr_proto::ProtoError;

#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("malformed frame: {0}")]
    Codec(#[from] ProtoError),

    #[error("fragment error: {0}")]
    Fragment(#[from] crate::fragment::FragmentError),

    #[error("cryptographic failure: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),

    #[error("no established session with peer {peer}")]
    NoSession { peer: String },

    #[error("handshake with peer {peer} timed out")]
    HandshakeTimeout { peer: String },

    #[error("could not establish secure channel to {peer}")]
    SecureChannelFailed { peer: String },

    #[error("unknown recipient for store-and-forward release")]
    UnknownRecipient,

    #[error("link layer write failed: {0}")]
    LinkWrite(String),
}

pub type MeshResult<T> = Result<T, MeshError>;
