//! Session encryption using X25519 key exchange and ChaCha20-Poly1305 AEAD
//!
//! Each transport session runs one ephemeral Diffie-Hellman exchange and
//! derives two directional keys with BLAKE3. Frames are sealed with a
//! per-direction counter nonce, so replayed or reordered frames fail to open.

use crate::error::{CryptoError, Result};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};
use zeroize::Zeroize;

/// Length of an AEAD authentication tag
pub const TAG_LEN: usize = 16;

const INITIATOR_CONTEXT: &str = "meshwire 2026-01 session key initiator to responder";
const RESPONDER_CONTEXT: &str = "meshwire 2026-01 session key responder to initiator";

/// Ephemeral X25519 key used for a single session handshake
pub struct EphemeralKey {
    secret: X25519StaticSecret,
    public: X25519PublicKey,
}

impl EphemeralKey {
    /// Generate a fresh ephemeral key
    pub fn generate() -> Self {
        let secret = X25519StaticSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Public half, sent to the peer
    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Complete the exchange and derive the session ciphers
    ///
    /// `transcript` must be identical on both ends (it binds the derived keys
    /// to both identities and both ephemeral keys).
    ///
    /// # Errors
    ///
    /// Fails if the peer's ephemeral key is a low-order point.
    pub fn into_session(
        self,
        remote_public: [u8; 32],
        transcript: &[u8],
        initiator: bool,
    ) -> Result<(FrameCipher, FrameCipher)> {
        let shared = self
            .secret
            .diffie_hellman(&X25519PublicKey::from(remote_public));
        if !shared.was_contributory() {
            return Err(CryptoError::HandshakeFailed {
                reason: "non-contributory key exchange".to_string(),
            }
            .into());
        }

        let mut material = Vec::with_capacity(32 + transcript.len());
        material.extend_from_slice(shared.as_bytes());
        material.extend_from_slice(transcript);

        let mut i2r = blake3::derive_key(INITIATOR_CONTEXT, &material);
        let mut r2i = blake3::derive_key(RESPONDER_CONTEXT, &material);
        material.zeroize();

        let (send, recv) = if initiator {
            (FrameCipher::new(&i2r), FrameCipher::new(&r2i))
        } else {
            (FrameCipher::new(&r2i), FrameCipher::new(&i2r))
        };

        i2r.zeroize();
        r2i.zeroize();
        Ok((send, recv))
    }
}

/// One direction of an encrypted session
pub struct FrameCipher {
    cipher: ChaCha20Poly1305,
    counter: u64,
}

impl FrameCipher {
    fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(&(*key).into()),
            counter: 0,
        }
    }

    fn next_nonce(&mut self) -> Result<[u8; 12]> {
        let counter = self.counter;
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or(CryptoError::EncryptionFailed)?;

        let mut nonce = [0u8; 12];
        nonce[4..].copy_from_slice(&counter.to_le_bytes());
        Ok(nonce)
    }

    /// Seal a plaintext frame
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.next_nonce()?;
        self.cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed.into())
    }

    /// Open a sealed frame
    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.next_nonce()?;
        self.cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_pair() -> ((FrameCipher, FrameCipher), (FrameCipher, FrameCipher)) {
        let a = EphemeralKey::generate();
        let b = EphemeralKey::generate();
        let (a_pub, b_pub) = (a.public_bytes(), b.public_bytes());
        let transcript = b"transcript";

        let alice = a.into_session(b_pub, transcript, true).unwrap();
        let bob = b.into_session(a_pub, transcript, false).unwrap();
        (alice, bob)
    }

    #[test]
    fn test_both_directions_open() {
        let ((mut a_send, mut a_recv), (mut b_send, mut b_recv)) = session_pair();

        let sealed = a_send.seal(b"ping").unwrap();
        assert_eq!(sealed.len(), 4 + TAG_LEN);
        assert_eq!(b_recv.open(&sealed).unwrap(), b"ping");

        let sealed = b_send.seal(b"pong").unwrap();
        assert_eq!(a_recv.open(&sealed).unwrap(), b"pong");
    }

    #[test]
    fn test_replayed_frame_fails() {
        let ((mut a_send, _), (_, mut b_recv)) = session_pair();

        let first = a_send.seal(b"one").unwrap();
        assert!(b_recv.open(&first).is_ok());
        assert!(b_recv.open(&first).is_err());
    }

    #[test]
    fn test_tampered_frame_fails() {
        let ((mut a_send, _), (_, mut b_recv)) = session_pair();

        let mut sealed = a_send.seal(b"payload").unwrap();
        sealed[0] ^= 0xFF;
        assert!(b_recv.open(&sealed).is_err());
    }

    #[test]
    fn test_mismatched_transcript_fails() {
        let a = EphemeralKey::generate();
        let b = EphemeralKey::generate();
        let (a_pub, b_pub) = (a.public_bytes(), b.public_bytes());

        let (mut a_send, _) = a.into_session(b_pub, b"one", true).unwrap();
        let (_, mut b_recv) = b.into_session(a_pub, b"two", false).unwrap();

        let sealed = a_send.seal(b"data").unwrap();
        assert!(b_recv.open(&sealed).is_err());
    }

    #[test]
    fn test_low_order_point_rejected() {
        let a = EphemeralKey::generate();
        assert!(a.into_session([0u8; 32], b"t", true).is_err());
    }
}
