//! Big-endian, unpadded binary framing for the on-wire `Packet`.
//!
//! ```text
//! offset  size  field
//! 0       1     type
//! 1       1     ttl
//! 2       1     senderIdLen        (8)
//! 3       1     recipientIdLen     (4 for sentinels, 8 for a peer)
//! 4       L_s   senderId
//! 4+L_s   L_r   recipientId
//! +8            timestampMillis (u64)
//! +4            payloadLen (u32)
//! +P            payload
//! +2            signatureLen (u16, 0 if absent)
//! +S            signature
//! ```
//!
//! Encoding and decoding are pure functions: no allocation beyond the
//! produced buffer (encode) or the copied-out fields (decode).

use crate::error::ProtoError;
use crate::ids::{PeerId, Recipient};
use crate::message::MessageType;

pub const MAX_TTL: u8 = 7;

/// The on-wire packet. `signature` covers sender-authenticated message types
/// (announce, identity announce); most traffic leaves it empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub message_type: MessageType,
    pub ttl: u8,
    pub sender: PeerId,
    pub recipient: Recipient,
    pub timestamp_millis: u64,
    pub payload: Vec<u8>,
    pub signature: Vec<u8>,
}

impl Packet {
    pub fn new(
        message_type: MessageType,
        ttl: u8,
        sender: PeerId,
        recipient: Recipient,
        timestamp_millis: u64,
        payload: Vec<u8>,
    ) -> Result<Self, ProtoError> {
        if ttl > MAX_TTL {
            return Err(ProtoError::InvalidTtl(ttl));
        }
        Ok(Self {
            message_type,
            ttl,
            sender,
            recipient,
            timestamp_millis,
            payload,
            signature: Vec::new(),
        })
    }

    pub fn with_signature(mut self, signature: Vec<u8>) -> Self {
        self.signature = signature;
        self
    }

    /// Returns a copy of `self` with `ttl - 1`, for relaying. Panics if
    /// `ttl == 0`; callers must check `can_relay()` first (I2).
    pub fn decremented(&self) -> Self {
        assert!(self.ttl > 0, "attempted to decrement ttl on a dead packet");
        let mut next = self.clone();
        next.ttl -= 1;
        next
    }

    pub fn can_relay(&self) -> bool {
        self.ttl > 0
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtoError> {
        if self.ttl > MAX_TTL {
            return Err(ProtoError::InvalidTtl(self.ttl));
        }
        let recipient_bytes = self.recipient.to_wire_bytes();
        let sig_len: u16 = self
            .signature
            .len()
            .try_into()
            .map_err(|_| ProtoError::LengthOverflow {
                declared: self.signature.len(),
                remaining: u16::MAX as usize,
            })?;
        let payload_len: u32 =
            self.payload
                .len()
                .try_into()
                .map_err(|_| ProtoError::LengthOverflow {
                    declared: self.payload.len(),
                    remaining: u32::MAX as usize,
                })?;

        let mut buf = Vec::with_capacity(
            4 + PeerId::LEN
                + recipient_bytes.len()
                + 8
                + 4
                + self.payload.len()
                + 2
                + self.signature.len(),
        );
        buf.push(self.message_type.as_u8());
        buf.push(self.ttl);
        buf.push(PeerId::LEN as u8);
        buf.push(recipient_bytes.len() as u8);
        buf.extend_from_slice(self.sender.as_bytes());
        buf.extend_from_slice(&recipient_bytes);
        buf.extend_from_slice(&self.timestamp_millis.to_be_bytes());
        buf.extend_from_slice(&payload_len.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf.extend_from_slice(&sig_len.to_be_bytes());
        buf.extend_from_slice(&self.signature);
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        let mut cursor = Cursor::new(buf);
        let type_tag = cursor.take_u8()?;
        let ttl = cursor.take_u8()?;
        if ttl > MAX_TTL {
            return Err(ProtoError::InvalidTtl(ttl));
        }
        let sender_len = cursor.take_u8()? as usize;
        let recipient_len = cursor.take_u8()? as usize;
        if sender_len != PeerId::LEN {
            return Err(ProtoError::BadSenderLen(sender_len));
        }
        if recipient_len != 4 && recipient_len != PeerId::LEN {
            return Err(ProtoError::BadRecipientLen(recipient_len));
        }

        let sender_bytes = cursor.take(sender_len)?;
        let sender = PeerId::from_bytes(sender_bytes.try_into().expect("checked len"));

        let recipient_bytes = cursor.take(recipient_len)?;
        let recipient = Recipient::from_wire_bytes(recipient_bytes)
            .ok_or(ProtoError::BadRecipientLen(recipient_len))?;

        let timestamp_millis = cursor.take_u64()?;

        let payload_len = cursor.take_u32()? as usize;
        let payload = cursor.take(payload_len)?.to_vec();

        let sig_len = cursor.take_u16()? as usize;
        let signature = cursor.take(sig_len)?.to_vec();

        Ok(Packet {
            message_type: MessageType::try_from_u8(type_tag)?,
            ttl,
            sender,
            recipient,
            timestamp_millis,
            payload,
            signature,
        })
    }
}

/// Minimal bounds-checked reader; kept private since it exists only to keep
/// `decode` free of repeated range checks.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtoError> {
        if n > self.remaining() {
            return Err(ProtoError::LengthOverflow {
                declared: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8, ProtoError> {
        Ok(self.take(1)?[0])
    }

    fn take_u16(&mut self) -> Result<u16, ProtoError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes(b.try_into().unwrap()))
    }

    fn take_u32(&mut self) -> Result<u32, ProtoError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes(b.try_into().unwrap()))
    }

    fn take_u64(&mut self) -> Result<u64, ProtoError> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes(b.try_into().unwrap()))
    }
}
