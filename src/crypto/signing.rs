//! Digital signature operations using Ed25519
//!
//! Used by the session handshake to bind an ephemeral key to a node identity.

use super::keys::{PubKey, SecKey};
use crate::error::{CryptoError, Result};
use ed25519_dalek::{Signature as Ed25519Signature, Signer, Verifier};

/// Length of a signature in bytes
pub const SIGNATURE_LEN: usize = 64;

/// A digital signature (64 bytes)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature(Ed25519Signature);

impl Signature {
    /// Convert signature to bytes
    pub fn to_bytes(&self) -> [u8; SIGNATURE_LEN] {
        self.0.to_bytes()
    }

    /// Create signature from bytes
    pub fn from_bytes(bytes: &[u8; SIGNATURE_LEN]) -> Self {
        Signature(Ed25519Signature::from_bytes(bytes))
    }
}

/// Sign a message with a node's secret key
///
/// # Example
///
/// ```
/// use meshwire::crypto::{sign_message, verify_signature, KeyPair};
///
/// let keys = KeyPair::generate();
/// let signature = sign_message(keys.sec_key(), b"hello");
/// assert!(verify_signature(&keys.pub_key(), b"hello", &signature).is_ok());
/// ```
pub fn sign_message(sec_key: &SecKey, message: &[u8]) -> Signature {
    Signature(sec_key.signing_key().sign(message))
}

/// Verify a signature on a message
///
/// # Errors
///
/// Returns [`CryptoError::InvalidKey`] if the public key is not a curve point
/// and [`CryptoError::InvalidSignature`] if verification fails.
pub fn verify_signature(pub_key: &PubKey, message: &[u8], signature: &Signature) -> Result<()> {
    pub_key
        .verifying_key()?
        .verify(message, &signature.0)
        .map_err(|_| CryptoError::InvalidSignature.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    #[test]
    fn test_sign_and_verify() {
        let keys = KeyPair::generate();
        let message = b"Test message";

        let signature = sign_message(keys.sec_key(), message);
        assert!(verify_signature(&keys.pub_key(), message, &signature).is_ok());
    }

    #[test]
    fn test_verify_wrong_message() {
        let keys = KeyPair::generate();
        let signature = sign_message(keys.sec_key(), b"Original message");

        assert!(verify_signature(&keys.pub_key(), b"Tampered message", &signature).is_err());
    }

    #[test]
    fn test_verify_wrong_key() {
        let keys1 = KeyPair::generate();
        let keys2 = KeyPair::generate();
        let signature = sign_message(keys1.sec_key(), b"Test message");

        assert!(verify_signature(&keys2.pub_key(), b"Test message", &signature).is_err());
    }

    #[test]
    fn test_signature_bytes() {
        let keys = KeyPair::generate();
        let signature = sign_message(keys.sec_key(), b"abc");
        let restored = Signature::from_bytes(&signature.to_bytes());
        assert_eq!(signature, restored);
    }
}
