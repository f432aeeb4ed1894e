//! Crypto negotiation: per-attempt X25519 keypairs, session key sealing, per-frame session cipher.
//!
//! The relay generates a fresh ChaCha20-Poly1305 key and iv for every accepted session and seals
//! both to the client's handshake public key (X25519 agreement with a relay-side one-shot secret,
//! SHA-256 derived wrapping key). After the handshake each direction encrypts frames with its own
//! counter so a nonce never repeats under one key.

use std::fmt;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 12;

/// X25519 public key (32 bytes). Sent in the handshake request and response.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "bytes_32")] [u8; 32]);

mod bytes_32 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Keypair generated for a single handshake attempt. Dropped once the session key is installed.
pub struct HandshakeKeypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl HandshakeKeypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey(X25519PublicKey::from(&secret).to_bytes());
        Self { secret, public }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    fn shared_secret(&self, other_public: &PublicKey) -> [u8; 32] {
        let other = X25519PublicKey::from(other_public.0);
        self.secret.diffie_hellman(&other).to_bytes()
    }

    /// Recover the session key the relay sealed to this keypair.
    pub fn open_session_key(&self, sealed: &SealedSessionKey) -> Result<SessionKey, CryptoError> {
        let wrap = derive_wrap_key(&self.shared_secret(&sealed.server_public));
        let key = decrypt_wire(&wrap, &wrap_nonce(0), &sealed.sealed_key)?;
        let iv = decrypt_wire(&wrap, &wrap_nonce(1), &sealed.sealed_iv)?;
        let key: [u8; KEY_LEN] = key.try_into().map_err(|_| CryptoError::Length)?;
        let iv: [u8; IV_LEN] = iv.try_into().map_err(|_| CryptoError::Length)?;
        Ok(SessionKey { key, iv })
    }
}

/// Symmetric key and iv of one session.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey {
    key: [u8; KEY_LEN],
    iv: [u8; IV_LEN],
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Session key sealed to a client's handshake public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedSessionKey {
    pub server_public: PublicKey,
    pub sealed_key: Vec<u8>,
    pub sealed_iv: Vec<u8>,
}

impl SessionKey {
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut key);
        OsRng.fill_bytes(&mut iv);
        Self { key, iv }
    }

    /// Seal key and iv to `client_public`. A one-shot relay secret is generated per call.
    pub fn seal_for(&self, client_public: &PublicKey) -> Result<SealedSessionKey, CryptoError> {
        let relay = HandshakeKeypair::generate();
        let wrap = derive_wrap_key(&relay.shared_secret(client_public));
        Ok(SealedSessionKey {
            server_public: relay.public.clone(),
            sealed_key: encrypt_wire(&wrap, &wrap_nonce(0), &self.key)?,
            sealed_iv: encrypt_wire(&wrap, &wrap_nonce(1), &self.iv)?,
        })
    }

    /// Split into the sealing half for our outgoing direction and the opening half for the peer's.
    pub fn split(&self, role: Role) -> (Sealer, Opener) {
        let (out_dir, in_dir) = match role {
            Role::Relay => (Direction::RelayToClient, Direction::ClientToRelay),
            Role::Client => (Direction::ClientToRelay, Direction::RelayToClient),
        };
        (
            Sealer(FrameCipher::new(self, out_dir)),
            Opener(FrameCipher::new(self, in_dir)),
        )
    }
}

/// Which end of a session we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Relay,
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    ClientToRelay = 1,
    RelayToClient = 2,
}

struct FrameCipher {
    cipher: ChaCha20Poly1305,
    iv: [u8; IV_LEN],
    direction: Direction,
    counter: u64,
}

impl FrameCipher {
    fn new(key: &SessionKey, direction: Direction) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key.key)),
            iv: key.iv,
            direction,
            counter: 0,
        }
    }

    /// iv XOR (direction byte || counter). Advances the counter.
    fn next_nonce(&mut self) -> Result<[u8; IV_LEN], CryptoError> {
        let mut nonce = self.iv;
        nonce[3] ^= self.direction as u8;
        for (b, c) in nonce[4..].iter_mut().zip(self.counter.to_le_bytes()) {
            *b ^= c;
        }
        self.counter = self.counter.checked_add(1).ok_or(CryptoError::Exhausted)?;
        Ok(nonce)
    }
}

/// Encrypts outgoing frames. Owned by the send loop.
pub struct Sealer(FrameCipher);

impl Sealer {
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = self.0.next_nonce()?;
        self.0
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::Encrypt)
    }
}

/// Decrypts incoming frames. Owned by the receive loop.
pub struct Opener(FrameCipher);

impl Opener {
    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = self.0.next_nonce()?;
        self.0
            .cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|_| CryptoError::Decrypt)
    }
}

fn derive_wrap_key(shared_secret: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"relay-session-wrap-v1");
    hasher.update(shared_secret);
    hasher.finalize().into()
}

fn wrap_nonce(n: u8) -> [u8; IV_LEN] {
    let mut nonce = [0u8; IV_LEN];
    nonce[IV_LEN - 1] = n;
    nonce
}

fn encrypt_wire(key: &[u8; 32], nonce: &[u8; IV_LEN], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::Key)?;
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|_| CryptoError::Encrypt)
}

fn decrypt_wire(key: &[u8; 32], nonce: &[u8; IV_LEN], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::Key)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Decrypt)
}

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid key")]
    Key,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
    #[error("sealed key material has wrong length")]
    Length,
    #[error("frame counter exhausted")]
    Exhausted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sealed_key_opens_with_matching_keypair() {
        let client = HandshakeKeypair::generate();
        let key = SessionKey::generate();
        let sealed = key.seal_for(client.public_key()).unwrap();
        let opened = client.open_session_key(&sealed).unwrap();
        assert_eq!(opened, key);
    }

    #[test]
    fn sealed_key_rejects_other_keypair() {
        let client = HandshakeKeypair::generate();
        let intruder = HandshakeKeypair::generate();
        let sealed = SessionKey::generate().seal_for(client.public_key()).unwrap();
        assert!(matches!(
            intruder.open_session_key(&sealed),
            Err(CryptoError::Decrypt)
        ));
    }

    #[test]
    fn both_directions_interoperate() {
        let key = SessionKey::generate();
        let (mut relay_seal, mut relay_open) = key.split(Role::Relay);
        let (mut client_seal, mut client_open) = key.split(Role::Client);

        for i in 0..3u8 {
            let up = client_seal.seal(&[i; 5]).unwrap();
            assert_eq!(relay_open.open(&up).unwrap(), vec![i; 5]);
            let down = relay_seal.seal(&[i + 10; 7]).unwrap();
            assert_eq!(client_open.open(&down).unwrap(), vec![i + 10; 7]);
        }
    }

    #[test]
    fn directions_use_distinct_nonces() {
        let key = SessionKey::generate();
        let (mut relay_seal, _) = key.split(Role::Relay);
        let (mut client_seal, _) = key.split(Role::Client);
        let a = relay_seal.seal(b"same").unwrap();
        let b = client_seal.seal(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn out_of_order_frame_fails() {
        let key = SessionKey::generate();
        let (mut seal, _) = key.split(Role::Client);
        let (_, mut open) = key.split(Role::Relay);
        let _first = seal.seal(b"one").unwrap();
        let second = seal.seal(b"two").unwrap();
        assert!(open.open(&second).is_err());
    }
}
