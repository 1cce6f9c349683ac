//! Exercises a packet's TTL lifecycle end to end, the way a packet would
//! actually be treated while it hops across several relays: decode what
//! came off the wire, decrement once per hop, re-encode, and stop relaying
//! the moment the TTL is spent (I2).

use krtr_proto::{MessageType, Packet, PeerId, ProtoError, Recipient, MAX_TTL};

#[test]
fn packet_survives_max_ttl_hops_then_is_not_relayed() {
    let origin = Packet::new(
        MessageType::Message,
        MAX_TTL,
        PeerId::from_bytes([1; 8]),
        Recipient::Broadcast,
        1_700_000_000_000,
        b"relay me".to_vec(),
    )
    .unwrap();

    let mut on_wire = origin.encode().unwrap();
    let mut hops = 0;
    loop {
        let received = Packet::decode(&on_wire).unwrap();
        assert_eq!(received.payload, b"relay me");
        if !received.can_relay() {
            break;
        }
        let relayed = received.decremented();
        on_wire = relayed.encode().unwrap();
        hops += 1;
    }

    assert_eq!(hops, MAX_TTL as usize, "a packet should cross exactly MAX_TTL links before dying");
    let last = Packet::decode(&on_wire).unwrap();
    assert_eq!(last.ttl, 0);
    assert!(!last.can_relay());
}

#[test]
fn signed_identity_announce_keeps_its_signature_across_a_relay_hop() {
    let announce = Packet::new(
        MessageType::NoiseIdentityAnnounce,
        3,
        PeerId::from_bytes([2; 8]),
        Recipient::Broadcast,
        1_700_000_000_500,
        b"new-peer-id".to_vec(),
    )
    .unwrap()
    .with_signature(vec![0xCD; 64]);

    let relayed = announce.decremented();
    let on_wire = relayed.encode().unwrap();
    let received = Packet::decode(&on_wire).unwrap();

    assert_eq!(received.signature, vec![0xCD; 64]);
    assert_eq!(received.ttl, 2);
}

#[test]
fn decode_rejects_a_frame_whose_trailing_signature_was_sheared_off() {
    let pkt = Packet::new(
        MessageType::Announce,
        5,
        PeerId::from_bytes([3; 8]),
        Recipient::Channel,
        1,
        b"hi".to_vec(),
    )
    .unwrap()
    .with_signature(vec![0xAA; 64]);
    let mut on_wire = pkt.encode().unwrap();

    // A relay that truncates the buffer mid-signature (a corrupt link, not
    // a protocol-conformant hop) must not be decodable as something else.
    on_wire.truncate(on_wire.len() - 10);
    assert!(matches!(Packet::decode(&on_wire), Err(ProtoError::LengthOverflow { .. })));
}
