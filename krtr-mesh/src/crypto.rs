//! Cryptographic primitives: long-lived identity signatures, per-session
//! AEAD framing, and channel-password key derivation.
//!
//! The handshake itself (Noise XX) lives in `session.rs` via `snow`; this
//! module covers everything around it: signing identity announcements,
//! sealing/opening application frames once a session key exists, and
//! deriving a channel's symmetric key from a shared password.

use argon2::{Argon2, Params, Version};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use krtr_proto::Fingerprint;
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroize;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("signature verification failed")]
    BadSignature,
    #[error("AEAD tag mismatch or malformed ciphertext")]
    AeadOpenFailed,
    #[error("nonce {nonce} not greater than last accepted {last_accepted}")]
    NonceReused { nonce: u64, last_accepted: u64 },
    #[error("key derivation failed: {0}")]
    Kdf(String),
    #[error("invalid key or signature encoding")]
    BadEncoding,
}

/// Long-lived Ed25519 signing identity. Created on first launch and
/// persisted; survives PeerId rotation (§3).
pub struct IdentityKeyPair {
    signing_key: SigningKey,
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        let signing_key = SigningKey::from_bytes(&seed);
        seed.zeroize();
        Self { signing_key }
    }

    pub fn from_bytes(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public(&self) -> IdentityPublicKey {
        IdentityPublicKey {
            verifying_key: self.signing_key.verifying_key(),
        }
    }

    /// Signs `new_peer_id || timestamp_millis`, the binding payload for a
    /// `noiseIdentityAnnounce` (§4.6 step 4).
    pub fn sign_identity_announce(&self, new_peer_id: &[u8], timestamp_millis: u64) -> [u8; 64] {
        let msg = announce_message(new_peer_id, timestamp_millis);
        self.signing_key.sign(&msg).to_bytes()
    }
}

/// The public half of an `IdentityKeyPair`, as received from a peer.
#[derive(Debug, Clone, Copy)]
pub struct IdentityPublicKey {
    verifying_key: VerifyingKey,
}

impl IdentityPublicKey {
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        VerifyingKey::from_bytes(bytes)
            .map(|verifying_key| Self { verifying_key })
            .map_err(|_| CryptoError::BadEncoding)
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    /// 16-byte Fingerprint: stable across PeerId rotation (§3).
    pub fn fingerprint(&self) -> Fingerprint {
        let digest = blake3::hash(&self.verifying_key.to_bytes());
        let mut out = [0u8; 16];
        out.copy_from_slice(&digest.as_bytes()[..16]);
        Fingerprint::from_bytes(out)
    }

    pub fn verify_identity_announce(
        &self,
        new_peer_id: &[u8],
        timestamp_millis: u64,
        signature: &[u8; 64],
    ) -> Result<(), CryptoError> {
        let msg = announce_message(new_peer_id, timestamp_millis);
        let sig = Signature::from_bytes(signature);
        self.verifying_key
            .verify(&msg, &sig)
            .map_err(|_| CryptoError::BadSignature)
    }
}

fn announce_message(new_peer_id: &[u8], timestamp_millis: u64) -> Vec<u8> {
    let mut msg = Vec::with_capacity(new_peer_id.len() + 8);
    msg.extend_from_slice(new_peer_id);
    msg.extend_from_slice(&timestamp_millis.to_be_bytes());
    msg
}

/// One direction of an established session: a symmetric key plus the
/// monotonic counter used as the AEAD nonce (I4).
pub struct DirectionalKey {
    cipher: ChaCha20Poly1305,
    counter: u64,
    last_accepted: Option<u64>,
}

impl DirectionalKey {
    pub fn new(key_bytes: [u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key_bytes)),
            counter: 0,
            last_accepted: None,
        }
    }

    /// Seals `plaintext`, returning `nonce || ciphertext` with the counter
    /// incremented for next time (I4: strictly monotonic, never reused).
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce_value = self.counter;
        self.counter += 1;
        let nonce = nonce_from_counter(nonce_value);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CryptoError::AeadOpenFailed)?;
        let mut out = Vec::with_capacity(8 + ciphertext.len());
        out.extend_from_slice(&nonce_value.to_be_bytes());
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Opens a `nonce || ciphertext` frame, rejecting any nonce not strictly
    /// greater than the last one accepted.
    pub fn open(&mut self, framed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if framed.len() < 8 {
            return Err(CryptoError::AeadOpenFailed);
        }
        let nonce_value = u64::from_be_bytes(framed[..8].try_into().unwrap());
        if let Some(last) = self.last_accepted {
            if nonce_value <= last {
                return Err(CryptoError::NonceReused {
                    nonce: nonce_value,
                    last_accepted: last,
                });
            }
        }
        let nonce = nonce_from_counter(nonce_value);
        let plaintext = self
            .cipher
            .decrypt(&nonce, &framed[8..])
            .map_err(|_| CryptoError::AeadOpenFailed)?;
        self.last_accepted = Some(nonce_value);
        Ok(plaintext)
    }
}

fn nonce_from_counter(counter: u64) -> Nonce {
    let mut bytes = [0u8; 12];
    bytes[4..].copy_from_slice(&counter.to_be_bytes());
    *Nonce::from_slice(&bytes)
}

/// Derives a channel's symmetric key from a shared password, salted with
/// the channel name, via Argon2id's interactive profile (§4.5).
pub fn derive_channel_key(password: &str, channel_name: &str) -> Result<[u8; 32], CryptoError> {
    // Argon2id interactive profile: m=19456 KiB, t=2, p=1 (RFC 9106 second recommendation).
    let params = Params::new(19456, 2, 1, Some(32)).map_err(|e| CryptoError::Kdf(e.to_string()))?;
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, Version::V0x13, params);
    let mut salt = [0u8; 16];
    let hash = blake3::hash(channel_name.as_bytes());
    salt.copy_from_slice(&hash.as_bytes()[..16]);

    let mut out = [0u8; 32];
    argon2
        .hash_password_into(password.as_bytes(), &salt, &mut out)
        .map_err(|e| CryptoError::Kdf(e.to_string()))?;
    Ok(out)
}
