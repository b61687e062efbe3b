//! Cryptography module
//!
//! This module provides the cryptographic primitives for Meshwire:
//! - Ed25519 node identities and signatures
//! - X25519 key exchange for transport sessions
//! - ChaCha20-Poly1305 AEAD frame encryption
//! - Blake3 key derivation

pub mod encryption;
pub mod keys;
pub mod signing;

pub use encryption::{EphemeralKey, FrameCipher};
pub use keys::{KeyPair, PubKey, SecKey, PUBKEY_LEN};
pub use signing::{sign_message, verify_signature, Signature, SIGNATURE_LEN};
