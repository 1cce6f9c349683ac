//! Top-level mesh coordinator (§4.9): peer table, identity rotation,
//! announce/leave lifecycle, adaptive TTL, flood routing, and per-type
//! packet handling.
//!
//! `MeshEngine` owns all mutable state and runs on a single logical task
//! (§5): every external event enters through one of the `handle_*`/`tick`
//! methods and returns a list of [`Effect`]s for the host to carry out
//! (writing frames to the link layer, emitting delegate events, scheduling
//! the next wakeup). The engine never calls out to the link layer or
//! delegate directly, which keeps it testable without either.

use crate::clock::TimeProvider;
use crate::compress::{self, CompressionOutcome};
use crate::config::{adaptive_ttl, MeshConfig};
use crate::crypto::{IdentityKeyPair, IdentityPublicKey};
use crate::fragment::{self, Reassembler};
use crate::identity::{self, IdentityRotation};
use crate::privacy::{self, PrivacyShaper};
use crate::session::{self, EphemeralKeys, Role, Session};
use crate::store_forward::StoreForwardCache;
use crate::transport::{ConnectionHandle, DelegateEvent};
use crate::bounded_set::{packet_fingerprint, SeenPackets};
use crate::peer::PeerTable;
use krtr_proto::{Fingerprint, MessageType, Packet, PeerId, Recipient};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Task {
    RotationCheck,
    FragmentSweep,
    CacheSweep,
    HandshakeTimeoutCheck,
    PrivacyDrain,
    CoverTick,
    PendingSendTimeoutCheck,
    IdentityAnnounceFire,
}

/// Something the host must do on the engine's behalf. The engine is
/// otherwise side-effect free.
#[derive(Debug, Clone)]
pub enum Effect {
    SendFrame { connection: ConnectionHandle, frame: Vec<u8> },
    BroadcastFrame { frame: Vec<u8>, except: Option<ConnectionHandle> },
    Emit(DelegateEvent),
    ScheduleWakeup { task: Task, after: Duration },
}

struct PendingSend {
    recipient: PeerId,
    plaintext: Vec<u8>,
    deadline: Instant,
}

pub struct MeshEngine {
    identity: IdentityKeyPair,
    ephemeral: EphemeralKeys,
    rotation: IdentityRotation,
    config: MeshConfig,
    clock: Arc<dyn TimeProvider>,

    peers: PeerTable,
    favorites: HashSet<Fingerprint>,
    seen: SeenPackets,
    reassembler: Reassembler,
    sessions: HashMap<PeerId, Session>,
    pending_sends: HashMap<PeerId, Vec<PendingSend>>,
    store_forward: StoreForwardCache,
    privacy: PrivacyShaper,
    connections: HashMap<PeerId, ConnectionHandle>,
    connection_peers: HashMap<ConnectionHandle, PeerId>,

    next_message_id: u32,
    nickname: Option<String>,
    rotation_deadline: Instant,
    pending_identity_announce: Option<(PeerId, Instant)>,
}

impl MeshEngine {
    pub fn new(identity: IdentityKeyPair, config: MeshConfig, clock: Arc<dyn TimeProvider>, now_millis: u64) -> Self {
        let profile = config.power_mode.profile();
        let peer_id = identity::generate_peer_id(now_millis);
        let cover_interval = if config.cover_traffic_enabled() {
            profile.cover_interval.map(|(min, max)| (Duration::from_millis(min), Duration::from_millis(max)))
        } else {
            None
        };
        let privacy = PrivacyShaper::new(
            clock.clone(),
            Duration::from_millis(profile.min_delay_millis),
            Duration::from_millis(profile.max_delay_millis),
            profile.jitter_enabled,
            cover_interval,
        );
        let rotation_deadline = clock.now_instant() + identity::next_rotation_interval(config.rotation_interval_secs);
        let store_ttl = config.store_ttl();
        Self {
            identity,
            ephemeral: EphemeralKeys::generate(),
            rotation: IdentityRotation::new(peer_id),
            config,
            clock: clock.clone(),
            peers: PeerTable::new(),
            favorites: HashSet::new(),
            seen: SeenPackets::default(),
            reassembler: Reassembler::new(clock.clone(), fragment::DEFAULT_FRAGMENT_TIMEOUT),
            sessions: HashMap::new(),
            pending_sends: HashMap::new(),
            store_forward: StoreForwardCache::new(
                clock,
                store_ttl,
                crate::store_forward::DEFAULT_MAX_CACHED,
                crate::store_forward::DEFAULT_MAX_CACHED_FAVORITES,
            ),
            privacy,
            connections: HashMap::new(),
            connection_peers: HashMap::new(),
            next_message_id: 1,
            nickname: None,
            rotation_deadline,
            pending_identity_announce: None,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.rotation.current()
    }

    pub fn set_nickname(&mut self, nickname: Option<String>) {
        self.nickname = nickname;
    }

    /// Loads the host's persisted favorite set (§6's `favorites.v1`). Favorite
    /// status is keyed by the stable Fingerprint, never by PeerId, so it
    /// survives rotation.
    pub fn set_favorites(&mut self, favorites: impl IntoIterator<Item = Fingerprint>) {
        self.favorites = favorites.into_iter().collect();
    }

    pub fn add_favorite(&mut self, fingerprint: Fingerprint) {
        self.favorites.insert(fingerprint);
    }

    pub fn remove_favorite(&mut self, fingerprint: Fingerprint) {
        self.favorites.remove(&fingerprint);
    }

    pub fn is_favorite(&self, fingerprint: &Fingerprint) -> bool {
        self.favorites.contains(fingerprint)
    }

    fn peer_is_favorite(&self, peer_id: &PeerId) -> bool {
        self.peers
            .get(peer_id)
            .and_then(|p| p.fingerprint)
            .is_some_and(|fp| self.favorites.contains(&fp))
    }

    /// The Fingerprint this engine has on record for `peer_id`, if any
    /// session (directly or via rotation relinking) has authenticated one.
    pub fn peer_fingerprint(&self, peer_id: PeerId) -> Option<krtr_proto::Fingerprint> {
        self.peers.get(&peer_id).and_then(|p| p.fingerprint)
    }

    pub fn privacy_stats(&self) -> privacy::PrivacyStats {
        self.privacy.stats
    }

    fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    fn now_instant(&self) -> Instant {
        self.clock.now_instant()
    }

    fn estimated_peer_count(&self) -> usize {
        self.peers.active_peer_count().max(self.peers.connected_peer_count())
    }

    fn current_ttl(&self) -> u8 {
        adaptive_ttl(self.estimated_peer_count())
    }

    fn next_message_id(&mut self) -> u32 {
        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);
        id
    }

    /// Emits the startup `announce` broadcast (§4.9: "on startServices,
    /// after link layer reports ready").
    pub fn start_services(&mut self) -> Vec<Effect> {
        self.announce()
    }

    fn announce(&mut self) -> Vec<Effect> {
        let packet = Packet::new(
            MessageType::Announce,
            self.current_ttl(),
            self.peer_id(),
            Recipient::Broadcast,
            self.now_millis(),
            self.nickname.clone().unwrap_or_default().into_bytes(),
        )
        .expect("ttl within range");
        self.record_own_fingerprint(&packet);
        let frame = packet.encode().expect("valid packet");
        vec![Effect::BroadcastFrame { frame, except: None }]
    }

    /// Emits a `leave` packet and tells the host to wait before tearing
    /// down the link (§4.9).
    pub fn shutdown(&mut self) -> Vec<Effect> {
        let packet = Packet::new(
            MessageType::Leave,
            self.current_ttl(),
            self.peer_id(),
            Recipient::Broadcast,
            self.now_millis(),
            Vec::new(),
        )
        .expect("ttl within range");
        self.record_own_fingerprint(&packet);
        let frame = packet.encode().expect("valid packet");
        vec![Effect::BroadcastFrame { frame, except: None }]
    }

    /// Records a self-originated broadcast's fingerprint so a copy that
    /// loops back around the mesh is dropped at `handle_inbound_frame`
    /// instead of being redelivered to our own delegate (§8 scenario 4).
    fn record_own_fingerprint(&mut self, packet: &Packet) {
        self.seen.record(packet_fingerprint(
            packet.sender.as_bytes(),
            packet.timestamp_millis,
            packet.message_type.as_u8(),
            &packet.payload,
        ));
    }

    pub fn handle_peer_connected(&mut self, peer_id: PeerId, connection: ConnectionHandle) -> Vec<Effect> {
        let now = self.now_millis();
        self.peers.mark_connected(peer_id, now);
        self.connections.insert(peer_id, connection);
        self.connection_peers.insert(connection, peer_id);

        let mut effects = vec![Effect::Emit(DelegateEvent::PeerConnected { peer_id })];
        for packet in self.store_forward.release(&peer_id) {
            let frame = packet.encode().expect("valid cached packet");
            effects.push(Effect::SendFrame { connection, frame });
        }
        effects.extend(self.retry_pending_handshake(peer_id, connection));
        effects.push(self.network_status_effect());
        effects
    }

    /// A connected-peer-count change is the one network-health signal the
    /// delegate gets (§6 `networkStatusChanged`).
    fn network_status_effect(&self) -> Effect {
        Effect::Emit(DelegateEvent::NetworkStatusChanged {
            connected_peers: self.peers.connected_peer_count(),
            active_peers: self.peers.active_peer_count(),
        })
    }

    /// A message queued for `peer_id` before it became reachable now has a
    /// live link to retry the handshake over, rather than waiting on a
    /// broadcast that may never land (§8 scenario 3).
    fn retry_pending_handshake(&mut self, peer_id: PeerId, connection: ConnectionHandle) -> Vec<Effect> {
        if self.sessions.contains_key(&peer_id) || !self.pending_sends.contains_key(&peer_id) {
            return Vec::new();
        }
        match session::initiator_role(&self.peer_id(), &peer_id) {
            Role::Initiator => self.start_initiator_handshake(peer_id),
            Role::Responder => {
                let packet = self.identity_nudge_packet(peer_id);
                vec![Effect::SendFrame {
                    connection,
                    frame: packet.encode().expect("valid packet"),
                }]
            }
        }
    }

    pub fn handle_peer_disconnected(&mut self, peer_id: PeerId) -> Vec<Effect> {
        if let Some(connection) = self.connections.remove(&peer_id) {
            self.connection_peers.remove(&connection);
        }
        self.peers.mark_disconnected(&peer_id);
        self.sessions.remove(&peer_id);
        vec![
            Effect::Emit(DelegateEvent::PeerDisconnected { peer_id }),
            self.network_status_effect(),
        ]
    }

    /// The full incoming packet pipeline (§4.9).
    pub fn handle_inbound_frame(&mut self, connection: ConnectionHandle, bytes: &[u8]) -> Vec<Effect> {
        let Ok(packet) = Packet::decode(bytes) else {
            tracing::debug!(connection, len = bytes.len(), "dropping malformed frame");
            return Vec::new();
        };

        let fp = packet_fingerprint(
            packet.sender.as_bytes(),
            packet.timestamp_millis,
            packet.message_type.as_u8(),
            &packet.payload,
        );
        if !self.seen.record(fp) {
            tracing::trace!(sender = %packet.sender.to_hex(), "dropping duplicate packet");
            return Vec::new();
        }

        let now = self.now_millis();
        let is_new_peer = self.peers.get(&packet.sender).is_none();
        self.peers.observe(packet.sender, now, None, None);
        let mut effects = Vec::new();
        if is_new_peer {
            tracing::debug!(peer = %packet.sender.to_hex(), "discovered new peer");
            effects.push(Effect::Emit(DelegateEvent::PeerDiscovered {
                peer_id: packet.sender,
                nickname: None,
                rssi: None,
            }));
        }

        // A Peer-addressed packet is "for self" either under the current
        // PeerId or, within the grace period, the previous one (I7).
        let for_self = matches!(packet.recipient, Recipient::Peer(id) if self.rotation.accepts_sender(&id, now))
            || matches!(packet.recipient, Recipient::Broadcast | Recipient::Channel);

        if for_self {
            effects.extend(self.dispatch(connection, packet.clone()));
        }

        match packet.recipient {
            Recipient::Peer(target) if !self.rotation.accepts_sender(&target, now) => {
                if packet.can_relay() {
                    let relayed = packet.decremented();
                    let frame = relayed.encode().expect("valid packet");
                    if let Some(&conn) = self.connections.get(&target) {
                        effects.push(Effect::SendFrame { connection: conn, frame });
                    } else if self.peers.get(&target).is_some() {
                        let is_favorite = self.peer_is_favorite(&target);
                        self.store_forward.store(target, relayed, 0, is_favorite);
                    } else {
                        effects.push(Effect::BroadcastFrame {
                            frame,
                            except: Some(connection),
                        });
                    }
                }
            }
            Recipient::Broadcast if packet.can_relay() => {
                let relayed = packet.decremented();
                let frame = relayed.encode().expect("valid packet");
                effects.push(Effect::BroadcastFrame {
                    frame,
                    except: Some(connection),
                });
            }
            _ => {}
        }

        effects
    }

    fn dispatch(&mut self, connection: ConnectionHandle, packet: Packet) -> Vec<Effect> {
        match packet.message_type {
            MessageType::Announce => self.on_announce(packet),
            MessageType::Leave => self.on_leave(packet),
            MessageType::NoiseHandshakeInit => self.on_handshake_init(connection, packet),
            MessageType::NoiseHandshakeResp => self.on_handshake_resp(connection, packet),
            MessageType::NoiseEncrypted => self.on_noise_encrypted(packet),
            MessageType::NoiseIdentityAnnounce => self.on_identity_announce(packet),
            MessageType::Message => self.on_plaintext_message(packet),
            MessageType::DeliveryAck | MessageType::ReadReceipt => self.on_receipt(packet),
            other => vec![Effect::Emit(DelegateEvent::OpaqueMessage {
                message_type: other.as_u8(),
                peer_id: packet.sender,
                payload: packet.payload,
            })],
        }
    }

    fn on_announce(&mut self, packet: Packet) -> Vec<Effect> {
        if !packet.payload.is_empty() {
            if let Ok(nickname) = String::from_utf8(packet.payload.clone()) {
                self.peers.observe(packet.sender, self.now_millis(), None, Some(nickname));
            }
        }
        Vec::new()
    }

    fn on_leave(&mut self, packet: Packet) -> Vec<Effect> {
        self.peers.mark_disconnected(&packet.sender);
        self.sessions.remove(&packet.sender);
        Vec::new()
    }

    fn on_receipt(&mut self, packet: Packet) -> Vec<Effect> {
        if packet.payload.len() < 4 {
            return Vec::new();
        }
        let message_id = u32::from_be_bytes(packet.payload[..4].try_into().unwrap());
        let event = if packet.message_type == MessageType::DeliveryAck {
            DelegateEvent::DeliveryAck {
                message_id,
                peer_id: packet.sender,
            }
        } else {
            DelegateEvent::ReadReceipt {
                message_id,
                peer_id: packet.sender,
            }
        };
        vec![Effect::Emit(event)]
    }

    /// Plaintext `message` frames only occur for broadcast/channel traffic
    /// in this engine (private traffic always rides `noiseEncrypted`).
    fn on_plaintext_message(&mut self, packet: Packet) -> Vec<Effect> {
        let Some(delivered) = self.decode_envelope(&packet, packet.payload.clone()) else {
            return Vec::new();
        };
        vec![Effect::Emit(DelegateEvent::MessageReceived { message: delivered })]
    }

    fn on_handshake_init(&mut self, connection: ConnectionHandle, packet: Packet) -> Vec<Effect> {
        let now = self.now_instant();
        match Session::respond(packet.sender, &self.ephemeral, &self.identity, &packet.payload, now) {
            Ok((session, resp_payload)) => {
                self.sessions.insert(packet.sender, session);
                let resp = Packet::new(
                    MessageType::NoiseHandshakeResp,
                    self.current_ttl(),
                    self.peer_id(),
                    Recipient::Peer(packet.sender),
                    self.now_millis(),
                    resp_payload,
                )
                .expect("ttl in range");
                vec![Effect::SendFrame {
                    connection,
                    frame: resp.encode().expect("valid packet"),
                }]
            }
            Err(_) => Vec::new(),
        }
    }

    /// Handles message 2 (responder -> initiator) and message 3 (initiator
    /// -> responder, final) of Noise XX: both ride `noiseHandshakeResp`,
    /// disambiguated by which role the local session is playing rather than
    /// by a separate wire tag.
    fn on_handshake_resp(&mut self, connection: ConnectionHandle, packet: Packet) -> Vec<Effect> {
        let Some(session) = self.sessions.get_mut(&packet.sender) else {
            return Vec::new();
        };
        let now = self.now_instant();
        match session.role {
            Role::Initiator => match session.complete_as_initiator(&packet.payload, &self.identity, &self.ephemeral, now) {
                Ok((final_payload, fingerprint)) => {
                    self.peers.mark_authenticated(&packet.sender, fingerprint);
                    tracing::debug!(peer = %packet.sender.to_hex(), "handshake established (initiator)");
                    let mut effects = vec![Effect::Emit(DelegateEvent::PeerAuthenticated {
                        peer_id: packet.sender,
                        fingerprint,
                    })];
                    if !final_payload.is_empty() {
                        let follow_up = Packet::new(
                            MessageType::NoiseHandshakeResp,
                            self.current_ttl(),
                            self.peer_id(),
                            Recipient::Peer(packet.sender),
                            self.now_millis(),
                            final_payload,
                        )
                        .expect("ttl in range");
                        effects.push(Effect::SendFrame {
                            connection,
                            frame: follow_up.encode().expect("valid packet"),
                        });
                    }
                    effects.extend(self.flush_pending_sends(packet.sender, connection));
                    effects
                }
                Err(err) => {
                    tracing::debug!(peer = %packet.sender.to_hex(), %err, "handshake failed (initiator)");
                    Vec::new()
                }
            },
            Role::Responder => match session.complete_as_responder(&packet.payload, now) {
                Ok(fingerprint) => {
                    self.peers.mark_authenticated(&packet.sender, fingerprint);
                    tracing::debug!(peer = %packet.sender.to_hex(), "handshake established (responder)");
                    let mut effects = vec![Effect::Emit(DelegateEvent::PeerAuthenticated {
                        peer_id: packet.sender,
                        fingerprint,
                    })];
                    effects.extend(self.flush_pending_sends(packet.sender, connection));
                    effects
                }
                Err(err) => {
                    tracing::debug!(peer = %packet.sender.to_hex(), %err, "handshake failed (responder)");
                    Vec::new()
                }
            },
        }
    }

    fn on_noise_encrypted(&mut self, packet: Packet) -> Vec<Effect> {
        // Each noiseEncrypted packet carries one TLV-framed fragment of a
        // single sealed ciphertext (§4.4); only once every fragment for its
        // message id has arrived is there a ciphertext to open.
        let ciphertext = match self.reassembler.accept(*packet.sender.as_bytes(), &packet.payload) {
            Ok(Some(ciphertext)) => ciphertext,
            Ok(None) | Err(_) => return Vec::new(),
        };
        let Some(session) = self.sessions.get_mut(&packet.sender) else {
            return Vec::new();
        };
        let Some(recv) = session.established_mut().map(|s| &mut s.recv) else {
            return Vec::new();
        };
        let Ok(plaintext) = recv.open(&ciphertext) else {
            tracing::debug!(peer = %packet.sender.to_hex(), "AEAD open failed, dropping");
            return Vec::new();
        };

        if privacy::is_cover_message(&plaintext) {
            self.privacy.record_cover_received();
            return Vec::new();
        }

        match self.decode_envelope(&packet, plaintext) {
            Some(message) => vec![Effect::Emit(DelegateEvent::PrivateMessageReceived { message })],
            None => Vec::new(),
        }
    }

    fn on_identity_announce(&mut self, packet: Packet) -> Vec<Effect> {
        if packet.signature.len() != 64 {
            return Vec::new();
        }

        // Targeted at us specifically: this is the tie-breaker nudge (§4.5),
        // not a rotation binding. The sender has deferred to us as initiator;
        // act on it immediately if we have anything queued for them. There is
        // no identity bound to this PeerId yet to verify against, so this
        // nudge is trusted only to kick off a handshake, which carries its
        // own identity binding (session.rs).
        if matches!(packet.recipient, Recipient::Peer(_)) {
            if !self.sessions.contains_key(&packet.sender) && self.pending_sends.contains_key(&packet.sender) {
                return self.start_initiator_handshake(packet.sender);
            }
            return Vec::new();
        }

        // Broadcast rotation binding: packet.sender is already the
        // rotated-to PeerId (§4.6 step 4). The payload carries the PeerId it
        // replaces plus the signer's IdentityPublicKey, so the signature can
        // actually be checked instead of merely length-gated.
        if packet.payload.len() != PeerId::LEN + 32 {
            return Vec::new();
        }
        let previous_peer_id = PeerId::from_bytes(packet.payload[..PeerId::LEN].try_into().unwrap());
        let pubkey_bytes: [u8; 32] = packet.payload[PeerId::LEN..].try_into().expect("checked length above");
        let Ok(pubkey) = IdentityPublicKey::from_bytes(&pubkey_bytes) else {
            return Vec::new();
        };
        let sig: [u8; 64] = packet.signature.as_slice().try_into().expect("checked length above");
        if pubkey
            .verify_identity_announce(packet.sender.as_bytes(), packet.timestamp_millis, &sig)
            .is_err()
        {
            tracing::debug!(peer = %packet.sender.to_hex(), "dropping identity announce with bad signature");
            return Vec::new();
        }
        self.relink_fingerprint(previous_peer_id, packet.sender, pubkey.fingerprint());
        Vec::new()
    }

    /// Carries a peer's Fingerprint forward onto its newly rotated PeerId
    /// (I7, scenario 5): both ids keep resolving to the same Fingerprint.
    /// Refuses to relink if `previous` already has a different Fingerprint
    /// on record, which would mean the announce is impersonating someone
    /// else's rotation rather than continuing it.
    fn relink_fingerprint(&mut self, previous: PeerId, new_peer_id: PeerId, fingerprint: Fingerprint) {
        if let Some(known) = self.peers.get(&previous).and_then(|p| p.fingerprint) {
            if known != fingerprint {
                tracing::debug!(peer = %previous.to_hex(), "identity announce fingerprint does not match prior session, ignoring");
                return;
            }
        }
        let now = self.now_millis();
        self.peers.observe(new_peer_id, now, None, None);
        self.peers.mark_authenticated(&new_peer_id, fingerprint);
    }

    /// Strips the compression flag byte prepended in `send_message`,
    /// decompressing the remainder if it's set, then decodes the envelope.
    fn decode_envelope(&self, packet: &Packet, raw: Vec<u8>) -> Option<crate::transport::DeliveredMessage> {
        let (&compressed_flag, rest) = raw.split_first()?;
        let plain = if compressed_flag != 0 {
            compress::decompress(rest).ok()?
        } else {
            rest.to_vec()
        };
        let envelope = MessageEnvelope::decode(&plain)?;
        Some(crate::transport::DeliveredMessage {
            message_id: envelope.message_id,
            sender_id: packet.sender,
            sender_nickname: self.peers.get(&packet.sender).and_then(|p| p.nickname.clone()),
            content: envelope.content,
            timestamp_millis: packet.timestamp_millis,
            channel: envelope.channel,
        })
    }

    /// Outgoing application send (§4.9): compose, compress, encrypt,
    /// fragment, enqueue in the privacy shaper.
    pub fn send_message(&mut self, recipient: Recipient, content: &str, channel: Option<String>) -> Vec<Effect> {
        let message_id = self.next_message_id();
        let envelope = MessageEnvelope {
            message_id,
            channel,
            content: content.to_string(),
        }
        .encode();

        let profile = self.config.power_mode.profile();
        let (body, outcome) = compress::compress(&envelope, profile.compression_threshold, compress::DEFAULT_MAX_COMPRESSION_RATIO);
        let compressed_flag = matches!(outcome, CompressionOutcome::Compressed);
        let mut framed = vec![compressed_flag as u8];
        framed.extend_from_slice(&body);

        match recipient {
            Recipient::Peer(peer_id) => self.send_private(peer_id, framed, self.config.fragment_size()),
            Recipient::Broadcast | Recipient::Channel => self.send_broadcast(framed, recipient),
        }
    }

    fn send_broadcast(&mut self, payload: Vec<u8>, recipient: Recipient) -> Vec<Effect> {
        let timestamp = self.now_millis();
        let packet = Packet::new(MessageType::Message, self.current_ttl(), self.peer_id(), recipient, timestamp, payload)
            .expect("ttl in range");
        self.record_own_fingerprint(&packet);
        self.privacy.enqueue(packet.encode().expect("valid packet"));
        Vec::new()
    }

    fn send_private(&mut self, peer_id: PeerId, plaintext: Vec<u8>, max_fragment_size: usize) -> Vec<Effect> {
        if let Some(session) = self.sessions.get_mut(&peer_id) {
            if let Some(established) = session.established_mut() {
                if let Ok(ciphertext) = established.send.seal(&plaintext) {
                    for frame in fragment::fragment(self.next_message_id(), &ciphertext, max_fragment_size) {
                        let packet = Packet::new(
                            MessageType::NoiseEncrypted,
                            self.current_ttl(),
                            self.peer_id(),
                            Recipient::Peer(peer_id),
                            self.now_millis(),
                            frame,
                        )
                        .expect("ttl in range");
                        self.privacy.enqueue(packet.encode().expect("valid packet"));
                    }
                    return Vec::new();
                }
            }
        }

        // No established session yet: queue the plaintext and kick off the
        // handshake per the tie-breaker rule (§4.9).
        let deadline = self.now_instant() + crate::config::HANDSHAKE_PENDING_DEADLINE;
        self.pending_sends.entry(peer_id).or_default().push(PendingSend {
            recipient: peer_id,
            plaintext,
            deadline,
        });

        if self.sessions.contains_key(&peer_id) {
            return Vec::new();
        }

        match session::initiator_role(&self.peer_id(), &peer_id) {
            Role::Initiator => self.start_initiator_handshake(peer_id),
            Role::Responder => {
                // Send a targeted identity announce to prompt the peer to
                // initiate (§4.5 tie-breaker).
                let packet = self.identity_nudge_packet(peer_id);
                vec![Effect::BroadcastFrame {
                    frame: packet.encode().expect("valid packet"),
                    except: None,
                }]
            }
        }
    }

    /// Builds the signed targeted identity-announce nudge used to prompt a
    /// peer into the initiator role under the tie-breaker rule (§4.5).
    fn identity_nudge_packet(&self, peer_id: PeerId) -> Packet {
        let sig = identity::sign_rotation_announce(&self.identity, &self.peer_id(), self.now_millis());
        let mut payload = self.peer_id().as_bytes().to_vec();
        payload.extend_from_slice(&self.now_millis().to_be_bytes());
        Packet::new(
            MessageType::NoiseIdentityAnnounce,
            self.current_ttl(),
            self.peer_id(),
            Recipient::Peer(peer_id),
            self.now_millis(),
            payload,
        )
        .expect("ttl in range")
        .with_signature(sig.to_vec())
    }

    /// Starts a Noise XX handshake as initiator toward `peer_id`, either
    /// because we hold the lexicographically smaller PeerId (§4.5) or
    /// because the peer just nudged us to via a targeted identity announce.
    fn start_initiator_handshake(&mut self, peer_id: PeerId) -> Vec<Effect> {
        let now = self.now_instant();
        if let Ok((session, init_payload)) = Session::start_initiator(peer_id, &self.ephemeral, now) {
            self.sessions.insert(peer_id, session);
            let packet = Packet::new(
                MessageType::NoiseHandshakeInit,
                self.current_ttl(),
                self.peer_id(),
                Recipient::Peer(peer_id),
                self.now_millis(),
                init_payload,
            )
            .expect("ttl in range");
            if let Some(&conn) = self.connections.get(&peer_id) {
                return vec![Effect::SendFrame {
                    connection: conn,
                    frame: packet.encode().expect("valid packet"),
                }];
            }
            return vec![Effect::BroadcastFrame {
                frame: packet.encode().expect("valid packet"),
                except: None,
            }];
        }
        Vec::new()
    }

    fn flush_pending_sends(&mut self, peer_id: PeerId, connection: ConnectionHandle) -> Vec<Effect> {
        let Some(pending) = self.pending_sends.remove(&peer_id) else {
            return Vec::new();
        };
        let mut effects = Vec::new();
        let max_fragment_size = self.config.fragment_size();
        for send in pending {
            if let Some(session) = self.sessions.get_mut(&send.recipient) {
                if let Some(established) = session.established_mut() {
                    if let Ok(ciphertext) = established.send.seal(&send.plaintext) {
                        for frame in fragment::fragment(self.next_message_id(), &ciphertext, max_fragment_size) {
                            let packet = Packet::new(
                                MessageType::NoiseEncrypted,
                                self.current_ttl(),
                                self.peer_id(),
                                Recipient::Peer(send.recipient),
                                self.now_millis(),
                                frame,
                            )
                            .expect("ttl in range");
                            effects.push(Effect::SendFrame {
                                connection,
                                frame: packet.encode().expect("valid packet"),
                            });
                        }
                    }
                }
            }
        }
        effects
    }

    /// Periodic housekeeping: drains the privacy shaper, fires cover
    /// traffic, sweeps reassembly/store-forward, checks rotation and
    /// handshake deadlines. The host calls this on every timer tick (§5).
    pub fn tick(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();

        for frame in self.privacy.drain_ready() {
            effects.push(Effect::BroadcastFrame { frame, except: None });
        }

        let connected: Vec<PeerId> = self.peers.connected_peers().map(|p| p.peer_id).collect();
        if let Some(target) = self.privacy.maybe_fire_cover(&connected) {
            effects.extend(self.send_private_cover(target));
        }

        self.reassembler.sweep();
        self.store_forward.sweep_expired();
        self.peers.sweep_inactive(self.now_millis());

        let now = self.now_instant();
        self.sessions.retain(|_, session| !session.has_timed_out(now, session::HANDSHAKE_TIMEOUT));
        self.pending_sends.retain(|peer_id, sends| {
            let before = sends.len();
            sends.retain(|s| s.deadline > now);
            if sends.len() < before {
                tracing::debug!(peer = %peer_id.to_hex(), "pending send timed out waiting on handshake");
                effects.push(Effect::Emit(DelegateEvent::SendFailed {
                    peer_id: *peer_id,
                    reason: format!("could not establish secure channel to {}", peer_id.to_hex()),
                }));
            }
            !sends.is_empty()
        });

        if now >= self.rotation_deadline {
            self.rotate_identity();
        }
        if let Some((new_peer_id, fire_at)) = self.pending_identity_announce {
            if now >= fire_at {
                self.pending_identity_announce = None;
                effects.extend(self.emit_identity_announce(new_peer_id));
            } else {
                effects.push(Effect::ScheduleWakeup {
                    task: Task::IdentityAnnounceFire,
                    after: fire_at.saturating_duration_since(now),
                });
            }
        }
        effects.push(Effect::ScheduleWakeup {
            task: Task::RotationCheck,
            after: self.rotation_deadline.saturating_duration_since(now),
        });

        effects
    }

    /// Rotation (§4.6): snapshot the current PeerId as `previousPeerId`,
    /// generate a new one, and schedule the signed binding announcement a
    /// short delay later.
    fn rotate_identity(&mut self) {
        let now_millis = self.now_millis();
        let new_peer_id = identity::generate_peer_id(now_millis);
        tracing::info!(from = %self.peer_id().to_hex(), to = %new_peer_id.to_hex(), "rotating peer id");
        self.rotation.rotate(new_peer_id, now_millis);
        self.pending_identity_announce = Some((new_peer_id, self.now_instant() + identity::IDENTITY_ANNOUNCE_DELAY));
        self.rotation_deadline = self.now_instant() + identity::next_rotation_interval(self.config.rotation_interval_secs);
    }

    fn emit_identity_announce(&mut self, new_peer_id: PeerId) -> Vec<Effect> {
        let timestamp = self.now_millis();
        let sig = identity::sign_rotation_announce(&self.identity, &new_peer_id, timestamp);
        // Payload carries the retiring PeerId so observers can carry its
        // Fingerprint forward onto `new_peer_id`, which is the packet's own
        // sender (§4.6 step 4), plus the signer's IdentityPublicKey so that
        // Fingerprint and the signature above can actually be verified
        // rather than trusted on length alone.
        let previous_peer_id = self.rotation.previous().unwrap_or(new_peer_id);
        let mut payload = previous_peer_id.as_bytes().to_vec();
        payload.extend_from_slice(&self.identity.public().to_bytes());
        let packet = Packet::new(
            MessageType::NoiseIdentityAnnounce,
            self.current_ttl(),
            new_peer_id,
            Recipient::Broadcast,
            timestamp,
            payload,
        )
        .expect("ttl in range")
        .with_signature(sig.to_vec());
        self.record_own_fingerprint(&packet);
        vec![Effect::BroadcastFrame {
            frame: packet.encode().expect("valid packet"),
            except: None,
        }]
    }

    fn send_private_cover(&mut self, target: PeerId) -> Vec<Effect> {
        let payload = privacy::make_cover_payload(&mut rand::thread_rng());
        self.send_private(target, payload, self.config.fragment_size())
    }
}

/// Inner application-level envelope carried as the plaintext of a `message`
/// or decrypted `noiseEncrypted` packet: message id, optional channel name,
/// and UTF-8 content.
struct MessageEnvelope {
    message_id: u32,
    channel: Option<String>,
    content: String,
}

impl MessageEnvelope {
    fn encode(&self) -> Vec<u8> {
        let channel_bytes = self.channel.as_deref().unwrap_or("").as_bytes();
        let mut out = Vec::with_capacity(4 + 1 + channel_bytes.len() + self.content.len());
        out.extend_from_slice(&self.message_id.to_be_bytes());
        out.push(channel_bytes.len() as u8);
        out.extend_from_slice(channel_bytes);
        out.extend_from_slice(self.content.as_bytes());
        out
    }

    fn decode(raw: &[u8]) -> Option<Self> {
        if raw.len() < 5 {
            return None;
        }
        let message_id = u32::from_be_bytes(raw[0..4].try_into().ok()?);
        let channel_len = raw[4] as usize;
        if raw.len() < 5 + channel_len {
            return None;
        }
        let channel = if channel_len == 0 {
            None
        } else {
            Some(String::from_utf8(raw[5..5 + channel_len].to_vec()).ok()?)
        };
        let content = String::from_utf8(raw[5 + channel_len..].to_vec()).ok()?;
        Some(Self {
            message_id,
            channel,
            content,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualTimeProvider;
    use crate::config::MeshConfig;

    fn make_engine(seed: u8) -> MeshEngine {
        let clock = Arc::new(ManualTimeProvider::new(0));
        let identity = IdentityKeyPair::from_bytes(&[seed; 32]);
        MeshEngine::new(identity, MeshConfig::default(), clock, 1_000)
    }

    #[test]
    fn broadcast_announce_is_emitted_on_start() {
        let mut engine = make_engine(1);
        let effects = engine.start_services();
        assert!(matches!(effects[0], Effect::BroadcastFrame { .. }));
    }

    #[test]
    fn favorite_set_is_keyed_by_fingerprint_not_peer_id() {
        let mut engine = make_engine(1);
        let fp = krtr_proto::Fingerprint::from_bytes([7; 16]);
        assert!(!engine.is_favorite(&fp));

        engine.add_favorite(fp);
        assert!(engine.is_favorite(&fp));

        engine.remove_favorite(fp);
        assert!(!engine.is_favorite(&fp));

        engine.set_favorites(vec![fp]);
        assert!(engine.is_favorite(&fp));
    }

    #[test]
    fn duplicate_inbound_frame_is_dropped() {
        let mut engine = make_engine(1);
        let packet = Packet::new(
            MessageType::Message,
            4,
            PeerId::from_bytes([9; 8]),
            Recipient::Broadcast,
            1,
            b"hi".to_vec(),
        )
        .unwrap();
        let frame = packet.encode().unwrap();
        let first = engine.handle_inbound_frame(1, &frame);
        let second = engine.handle_inbound_frame(1, &frame);
        assert!(!first.is_empty());
        assert!(second.is_empty());
    }
}
