//! Per-peer authenticated session establishment (§4.5).
//!
//! The handshake proper is Noise XX over `snow`; what this module owns is
//! the typestate wrapper around it (IDLE/WAIT_RESP/WAIT_FINAL/ESTABLISHED),
//! the tie-breaker rule for who initiates, and binding the Noise static key
//! to the peer's long-lived `IdentityKeyPair` via a signature carried in the
//! handshake payload.

use crate::crypto::{CryptoError, DirectionalKey, IdentityKeyPair, IdentityPublicKey};
use krtr_proto::{Fingerprint, PeerId};
use snow::Builder;
use std::time::{Duration, Instant};

/// "Noise_XX_25519_ChaChaPoly_BLAKE2s": XX pattern, X25519 DH, ChaCha20-Poly1305
/// AEAD, BLAKE2s for the Noise transcript hash. Application-layer framing
/// after the handshake uses `crypto::DirectionalKey` (ChaCha20-Poly1305 over
/// a 64-bit counter nonce), independent of Noise's own transport keys.
const NOISE_PARAMS: &str = "Noise_XX_25519_ChaChaPoly_BLAKE2s";

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("snow handshake error: {0}")]
    Noise(String),
    #[error("identity binding payload missing or malformed")]
    MissingBinding,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("handshake message received in wrong state")]
    WrongState,
}

impl From<snow::Error> for SessionError {
    fn from(e: snow::Error) -> Self {
        SessionError::Noise(e.to_string())
    }
}

/// A per-process X25519 static keypair used for the Noise static key.
/// Generated at startup, never persisted (§3).
pub struct EphemeralKeys {
    private: Vec<u8>,
    public: Vec<u8>,
}

impl EphemeralKeys {
    pub fn generate() -> Self {
        let keypair = Builder::new(NOISE_PARAMS.parse().expect("static params string"))
            .generate_keypair()
            .expect("keypair generation");
        Self {
            private: keypair.private,
            public: keypair.public,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Deterministic tie-breaker (§4.5): the lexicographically smaller hex
/// PeerId initiates.
pub fn initiator_role(my_id: &PeerId, peer_id: &PeerId) -> Role {
    if my_id.to_hex() < peer_id.to_hex() {
        Role::Initiator
    } else {
        Role::Responder
    }
}

/// Builds the `IdentityPublicKey || signature` binding carried in a
/// handshake message: a self-contained proof that whoever holds
/// `identity`'s private key also controls the Noise static key
/// (`ephemeral_public`) just revealed in this handshake.
fn identity_binding_payload(identity: &IdentityKeyPair, ephemeral_public: &[u8]) -> Vec<u8> {
    let mut payload = identity.public().to_bytes().to_vec();
    payload.extend_from_slice(&identity.sign_identity_announce(ephemeral_public, 0));
    payload
}

/// Verifies a binding built by [`identity_binding_payload`] against the
/// Noise static key `snow` just revealed for the peer on the other end
/// (`remote_static`), trusting whichever IdentityPublicKey is presented on
/// first sight (§3: trust-on-first-use, same as the rest of the mesh's flat
/// PeerId space) but never accepting one whose signature doesn't check out.
fn verify_identity_binding(payload: &[u8], remote_static: &[u8]) -> Result<Fingerprint, SessionError> {
    if payload.len() < 96 {
        return Err(SessionError::MissingBinding);
    }
    let pubkey = IdentityPublicKey::from_bytes(payload[..32].try_into().unwrap())?;
    let sig: [u8; 64] = payload[32..96].try_into().unwrap();
    pubkey.verify_identity_announce(remote_static, 0, &sig)?;
    Ok(pubkey.fingerprint())
}

pub struct EstablishedSession {
    pub send: DirectionalKey,
    pub recv: DirectionalKey,
    pub peer_fingerprint: Fingerprint,
}

enum Inner {
    Idle,
    WaitResp(snow::HandshakeState),
    WaitFinal(snow::HandshakeState),
    Established(EstablishedSession),
}

/// One peer's handshake/session state, per §4.5's state diagram.
pub struct Session {
    pub peer_id: PeerId,
    pub role: Role,
    inner: Inner,
    started_at: Instant,
}

impl Session {
    fn new(peer_id: PeerId, role: Role, inner: Inner, now: Instant) -> Self {
        Self {
            peer_id,
            role,
            inner,
            started_at: now,
        }
    }

    pub fn is_established(&self) -> bool {
        matches!(self.inner, Inner::Established(_))
    }

    pub fn established(&self) -> Option<&EstablishedSession> {
        match &self.inner {
            Inner::Established(s) => Some(s),
            _ => None,
        }
    }

    pub fn established_mut(&mut self) -> Option<&mut EstablishedSession> {
        match &mut self.inner {
            Inner::Established(s) => Some(s),
            _ => None,
        }
    }

    pub fn has_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        !self.is_established() && now.duration_since(self.started_at) >= timeout
    }

    /// IDLE -> WAIT_RESP: starts a handshake as initiator, returning the
    /// `noiseHandshakeInit` payload to send.
    pub fn start_initiator(
        peer_id: PeerId,
        ephemeral: &EphemeralKeys,
        now: Instant,
    ) -> Result<(Self, Vec<u8>), SessionError> {
        let mut hs = Builder::new(NOISE_PARAMS.parse().unwrap())
            .local_private_key(&ephemeral.private)
            .build_initiator()?;
        let mut buf = vec![0u8; 1024];
        let len = hs.write_message(&[], &mut buf)?;
        buf.truncate(len);
        Ok((Self::new(peer_id, Role::Initiator, Inner::WaitResp(hs), now), buf))
    }

    /// IDLE -> WAIT_FINAL on receipt of `noiseHandshakeInit`: returns the
    /// `noiseHandshakeResp` payload to send, with the identity binding
    /// (IdentityPublicKey plus a signature over the Noise static key this
    /// handshake reveals) appended.
    pub fn respond(
        peer_id: PeerId,
        ephemeral: &EphemeralKeys,
        identity: &IdentityKeyPair,
        init_message: &[u8],
        now: Instant,
    ) -> Result<(Self, Vec<u8>), SessionError> {
        let mut hs = Builder::new(NOISE_PARAMS.parse().unwrap())
            .local_private_key(&ephemeral.private)
            .build_responder()?;
        let mut scratch = vec![0u8; 1024];
        hs.read_message(init_message, &mut scratch)?;

        let binding = identity_binding_payload(identity, &ephemeral.public);
        let mut buf = vec![0u8; 1024];
        let len = hs.write_message(&binding, &mut buf)?;
        buf.truncate(len);
        Ok((Self::new(peer_id, Role::Responder, Inner::WaitFinal(hs), now), buf))
    }

    /// WAIT_RESP -> ESTABLISHED: consumes `noiseHandshakeResp`, verifies the
    /// responder's identity binding against its revealed Noise static key,
    /// and returns the final message (carrying our own binding in turn)
    /// plus the now-established peer fingerprint.
    pub fn complete_as_initiator(
        &mut self,
        resp_message: &[u8],
        identity: &IdentityKeyPair,
        ephemeral: &EphemeralKeys,
        now: Instant,
    ) -> Result<(Vec<u8>, Fingerprint), SessionError> {
        let hs = match std::mem::replace(&mut self.inner, Inner::Idle) {
            Inner::WaitResp(hs) => hs,
            other => {
                self.inner = other;
                return Err(SessionError::WrongState);
            }
        };
        self.complete(hs, resp_message, Some((identity, ephemeral)), now)
    }

    /// WAIT_FINAL -> ESTABLISHED: consumes the initiator's final message and
    /// verifies its identity binding the same way. No further message is
    /// sent in this direction.
    pub fn complete_as_responder(&mut self, final_message: &[u8], now: Instant) -> Result<Fingerprint, SessionError> {
        let hs = match std::mem::replace(&mut self.inner, Inner::Idle) {
            Inner::WaitFinal(hs) => hs,
            other => {
                self.inner = other;
                return Err(SessionError::WrongState);
            }
        };
        let (_, fingerprint) = self.complete(hs, final_message, None, now)?;
        Ok(fingerprint)
    }

    fn complete(
        &mut self,
        mut hs: snow::HandshakeState,
        incoming: &[u8],
        own_binding: Option<(&IdentityKeyPair, &EphemeralKeys)>,
        now: Instant,
    ) -> Result<(Vec<u8>, Fingerprint), SessionError> {
        let mut payload = vec![0u8; 1024];
        let payload_len = hs.read_message(incoming, &mut payload)?;
        payload.truncate(payload_len);

        let remote_static = hs.get_remote_static().ok_or(SessionError::MissingBinding)?.to_vec();
        let fingerprint = verify_identity_binding(&payload, &remote_static)?;

        let mut out = Vec::new();
        if !hs.is_handshake_finished() {
            let reply = match own_binding {
                Some((identity, ephemeral)) => identity_binding_payload(identity, &ephemeral.public),
                None => Vec::new(),
            };
            let mut buf = vec![0u8; 1024];
            let len = hs.write_message(&reply, &mut buf)?;
            buf.truncate(len);
            out = buf;
            // Re-read to finish if this message also completes the handshake locally.
            if !hs.is_handshake_finished() {
                return Err(SessionError::Noise("handshake did not complete".into()));
            }
        }

        let transport = hs.into_transport_mode()?;
        let mut send_key = [0u8; 32];
        let mut recv_key = [0u8; 32];
        transport.dangerously_get_raw_split(&mut send_key, &mut recv_key);

        self.started_at = now;
        self.inner = Inner::Established(EstablishedSession {
            send: DirectionalKey::new(send_key),
            recv: DirectionalKey::new(recv_key),
            peer_fingerprint: fingerprint,
        });
        tracing::debug!(peer = %self.peer_id.to_hex(), role = ?self.role, "session established");
        Ok((out, fingerprint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tie_breaker_picks_lexicographically_smaller_id() {
        let a = PeerId::from_bytes([0x00; 8]);
        let b = PeerId::from_bytes([0xff; 8]);
        assert_eq!(initiator_role(&a, &b), Role::Initiator);
        assert_eq!(initiator_role(&b, &a), Role::Responder);
    }

    #[test]
    fn fresh_session_is_not_established() {
        let ephemeral = EphemeralKeys::generate();
        let (session, _init) = Session::start_initiator(PeerId::from_bytes([1; 8]), &ephemeral, Instant::now()).unwrap();
        assert!(!session.is_established());
    }

    #[test]
    fn completed_handshake_yields_fingerprints_bound_to_each_sides_identity_key() {
        let now = Instant::now();
        let initiator_id = PeerId::from_bytes([1; 8]);
        let responder_id = PeerId::from_bytes([2; 8]);
        let initiator_ephemeral = EphemeralKeys::generate();
        let responder_ephemeral = EphemeralKeys::generate();
        let initiator_identity = IdentityKeyPair::generate();
        let responder_identity = IdentityKeyPair::generate();

        let (mut initiator, msg1) = Session::start_initiator(responder_id, &initiator_ephemeral, now).unwrap();
        let (mut responder, msg2) =
            Session::respond(initiator_id, &responder_ephemeral, &responder_identity, &msg1, now).unwrap();
        let (msg3, initiator_fp) = initiator
            .complete_as_initiator(&msg2, &initiator_identity, &initiator_ephemeral, now)
            .unwrap();
        let responder_fp = responder.complete_as_responder(&msg3, now).unwrap();

        // The initiator's fingerprint for this peer is bound to the
        // responder's identity key, and vice versa (§4.5: the handshake
        // binds both directions to the peers' IdentityKeys).
        assert_eq!(initiator_fp, responder_identity.public().fingerprint());
        assert_eq!(responder_fp, initiator_identity.public().fingerprint());
        assert!(initiator.is_established());
        assert!(responder.is_established());
    }

    /// A bad binding signature (a corrupted or forged identity announcement)
    /// must fail the handshake rather than silently falling back to some
    /// other notion of fingerprint.
    #[test]
    fn forged_identity_binding_is_rejected() {
        let now = Instant::now();
        let initiator_ephemeral = EphemeralKeys::generate();
        let responder_ephemeral = EphemeralKeys::generate();
        let responder_identity = IdentityKeyPair::generate();
        let forged_identity = IdentityKeyPair::generate();

        let (mut initiator, msg1) =
            Session::start_initiator(PeerId::from_bytes([2; 8]), &initiator_ephemeral, now).unwrap();
        let (_responder, msg2) =
            Session::respond(PeerId::from_bytes([1; 8]), &responder_ephemeral, &responder_identity, &msg1, now).unwrap();

        // Splice in a signature from an unrelated key over the same static
        // key bytes: the embedded IdentityPublicKey no longer matches the
        // signature that was actually produced for this handshake.
        let mut tampered = msg2.clone();
        let forged_sig = forged_identity.sign_identity_announce(&responder_ephemeral.public, 0);
        tampered[32..96].copy_from_slice(&forged_sig);

        let initiator_identity = IdentityKeyPair::generate();
        let err = initiator
            .complete_as_initiator(&tampered, &initiator_identity, &initiator_ephemeral, now)
            .unwrap_err();
        assert!(matches!(err, SessionError::Crypto(CryptoError::BadSignature)));
    }

    /// A peer's long-lived IdentityKey, and so the Fingerprint derived from
    /// it, stays the same across two independent handshakes even when both
    /// the PeerId and the Noise static key on the other end of the wire
    /// change, which is what lets a rotated PeerId still resolve to the
    /// same Fingerprint (§8 scenario 5).
    #[test]
    fn fingerprint_survives_rotation_because_it_is_bound_to_the_identity_key() {
        let now = Instant::now();
        let responder_ephemeral = EphemeralKeys::generate();
        let responder_identity = IdentityKeyPair::generate();
        // Stable across both runs, unlike the ephemeral Noise static key
        // which is regenerated per run below to stand in for a rotation.
        let initiator_identity = IdentityKeyPair::generate();

        let run = |initiator_id: PeerId| {
            let initiator_ephemeral = EphemeralKeys::generate();
            let (mut initiator, msg1) =
                Session::start_initiator(PeerId::from_bytes([9; 8]), &initiator_ephemeral, now).unwrap();
            let (mut responder, msg2) =
                Session::respond(initiator_id, &responder_ephemeral, &responder_identity, &msg1, now).unwrap();
            let (msg3, _) = initiator
                .complete_as_initiator(&msg2, &initiator_identity, &initiator_ephemeral, now)
                .unwrap();
            responder.complete_as_responder(&msg3, now).unwrap()
        };

        let fp_before_rotation = run(PeerId::from_bytes([0xaa; 8]));
        let fp_after_rotation = run(PeerId::from_bytes([0xbb; 8]));
        assert_eq!(fp_before_rotation, fp_after_rotation);
    }
}
