//! Fixed-size identifiers used throughout the mesh wire protocol.
//!
//! Mirrors the newtype-per-id style of the protocol layer this crate was
//! modeled on: every identifier is a thin wrapper over a byte array so that
//! the type system -- not a convention -- keeps a [`PeerId`] from being
//! confused with a [`Fingerprint`].

use std::fmt;

/// Declares a fixed-size byte-array newtype with hex `Debug`/`Display`.
macro_rules! krtr_id {
    ($name:ident, $len:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            pub const LEN: usize = $len;

            pub const fn from_bytes(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            pub fn from_hex(s: &str) -> Option<Self> {
                let bytes = hex::decode(s).ok()?;
                let arr: [u8; $len] = bytes.try_into().ok()?;
                Some(Self(arr))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }

        impl From<[u8; $len]> for $name {
            fn from(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }
    };
}

krtr_id!(
    PeerId,
    8,
    "An 8-byte ephemeral mesh identifier, displayed as 16 lowercase hex characters."
);
krtr_id!(
    Fingerprint,
    16,
    "A stable 16-byte hash of a peer's long-lived IdentityKey public half."
);

/// Reserved recipient values that do not name a concrete [`PeerId`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Recipient {
    Peer(PeerId),
    Broadcast,
    Channel,
}

pub const BROADCAST_RECIPIENT: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];
pub const CHANNEL_RECIPIENT: [u8; 4] = [0xFE, 0xFE, 0xFE, 0xFE];

impl Recipient {
    /// Encodes to the wire representation: sentinels are 4 bytes, peers are 8.
    pub fn to_wire_bytes(self) -> Vec<u8> {
        match self {
            Recipient::Peer(id) => id.0.to_vec(),
            Recipient::Broadcast => BROADCAST_RECIPIENT.to_vec(),
            Recipient::Channel => CHANNEL_RECIPIENT.to_vec(),
        }
    }

    pub fn from_wire_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes.len() {
            4 if bytes == BROADCAST_RECIPIENT => Some(Recipient::Broadcast),
            4 if bytes == CHANNEL_RECIPIENT => Some(Recipient::Channel),
            8 => {
                let arr: [u8; 8] = bytes.try_into().ok()?;
                Some(Recipient::Peer(PeerId(arr)))
            }
            _ => None,
        }
    }

    pub fn wire_len(self) -> usize {
        match self {
            Recipient::Peer(_) => 8,
            Recipient::Broadcast | Recipient::Channel => 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_hex_round_trips() {
        let id = PeerId::from_bytes([1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(id.to_hex(), "0102030405060708");
        assert_eq!(PeerId::from_hex(&id.to_hex()), Some(id));
    }

    #[test]
    fn recipient_sentinels_round_trip() {
        for r in [Recipient::Broadcast, Recipient::Channel] {
            let bytes = r.to_wire_bytes();
            assert_eq!(Recipient::from_wire_bytes(&bytes), Some(r));
        }
        let peer = Recipient::Peer(PeerId::from_bytes([9; 8]));
        assert_eq!(
            Recipient::from_wire_bytes(&peer.to_wire_bytes()),
            Some(peer)
        );
    }
}
