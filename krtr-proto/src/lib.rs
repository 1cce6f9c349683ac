//! Binary wire format for the KRTR mesh: packet framing, message type tags,
//! and the fixed-size identifiers that travel over the link layer.
//!
//! Deliberately independent of any transport or crypto crate: encoding and
//! decoding here are pure functions over byte slices, with no allocation
//! beyond the produced or copied-out buffer.

pub mod error;
pub mod ids;
pub mod message;
pub mod packet;

pub use error::ProtoError;
pub use ids::{Fingerprint, PeerId, Recipient, BROADCAST_RECIPIENT, CHANNEL_RECIPIENT};
pub use message::MessageType;
pub use packet::{Packet, MAX_TTL};
