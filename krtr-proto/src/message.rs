//! Single-byte message type tags carried in every [`crate::packet::Packet`].

use crate::error::ProtoError;

/// The `type` field of the wire frame (offset 0, 1 byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Announce = 0x01,
    Message = 0x02,
    Leave = 0x03,
    DeliveryAck = 0x04,
    ReadReceipt = 0x05,
    NoiseHandshakeInit = 0x10,
    NoiseHandshakeResp = 0x11,
    NoiseEncrypted = 0x12,
    NoiseIdentityAnnounce = 0x13,
    VersionHello = 0x20,
    VersionAck = 0x21,
    ChannelKeyVerifyReq = 0x30,
    ChannelKeyVerifyResp = 0x31,
    ChannelPasswordUpdate = 0x32,
    ChannelMetadata = 0x33,
    ZkProof = 0x40,
    ZkChallenge = 0x41,
    ZkResponse = 0x42,
}

impl MessageType {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn try_from_u8(tag: u8) -> Result<Self, ProtoError> {
        use MessageType::*;
        Ok(match tag {
            0x01 => Announce,
            0x02 => Message,
            0x03 => Leave,
            0x04 => DeliveryAck,
            0x05 => ReadReceipt,
            0x10 => NoiseHandshakeInit,
            0x11 => NoiseHandshakeResp,
            0x12 => NoiseEncrypted,
            0x13 => NoiseIdentityAnnounce,
            0x20 => VersionHello,
            0x21 => VersionAck,
            0x30 => ChannelKeyVerifyReq,
            0x31 => ChannelKeyVerifyResp,
            0x32 => ChannelPasswordUpdate,
            0x33 => ChannelMetadata,
            0x40 => ZkProof,
            0x41 => ZkChallenge,
            0x42 => ZkResponse,
            other => return Err(ProtoError::UnknownMessageType(other)),
        })
    }

    /// True for types that establish or maintain a session rather than
    /// carrying application content; used by the engine to decide whether a
    /// packet should bump a peer's `last_seen` without being treated as chat
    /// traffic.
    pub fn is_handshake(self) -> bool {
        matches!(
            self,
            MessageType::NoiseHandshakeInit
                | MessageType::NoiseHandshakeResp
                | MessageType::NoiseIdentityAnnounce
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_tag_round_trips() {
        let tags = [
            0x01, 0x02, 0x03, 0x04, 0x05, 0x10, 0x11, 0x12, 0x13, 0x20, 0x21, 0x30, 0x31, 0x32,
            0x33, 0x40, 0x41, 0x42,
        ];
        for tag in tags {
            let ty = MessageType::try_from_u8(tag).unwrap();
            assert_eq!(ty.as_u8(), tag);
        }
    }

    #[test]
    fn unknown_tag_rejected() {
        assert!(matches!(
            MessageType::try_from_u8(0x99),
            Err(ProtoError::UnknownMessageType(0x99))
        ));
    }
}
