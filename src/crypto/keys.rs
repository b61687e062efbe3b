//! Node identity keys
//!
//! A node is addressed by its Ed25519 public key ([`PubKey`]). The matching
//! secret key ([`SecKey`]) signs session handshakes so that a transport
//! peer can prove it owns the identity it claims.

use crate::error::{CryptoError, Result};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use std::fmt;
use std::str::FromStr;
use zeroize::ZeroizeOnDrop;

/// Length of a public key in bytes
pub const PUBKEY_LEN: usize = 32;

/// Public key identifying a node
///
/// The all-zero key is the "null" key returned by lookups that miss.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PubKey([u8; PUBKEY_LEN]);

impl PubKey {
    /// Create a public key from raw bytes
    pub fn from_bytes(bytes: [u8; PUBKEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Create a public key from a byte slice
    ///
    /// # Errors
    ///
    /// Returns an error if the slice is not exactly 32 bytes.
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        let bytes: [u8; PUBKEY_LEN] = data.try_into().map_err(|_| CryptoError::InvalidKey {
            reason: format!("expected {} bytes, got {}", PUBKEY_LEN, data.len()),
        })?;
        Ok(Self(bytes))
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; PUBKEY_LEN] {
        &self.0
    }

    /// Whether this is the zero key
    pub fn is_null(&self) -> bool {
        self.0 == [0u8; PUBKEY_LEN]
    }

    /// Convert to lowercase hexadecimal
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hexadecimal text
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim()).map_err(|e| CryptoError::InvalidKey {
            reason: format!("invalid hex: {}", e),
        })?;
        Self::from_slice(&bytes)
    }

    /// Interpret as an Ed25519 verifying key
    pub(crate) fn verifying_key(&self) -> Result<VerifyingKey> {
        VerifyingKey::from_bytes(&self.0).map_err(|e| {
            CryptoError::InvalidKey {
                reason: format!("not an ed25519 point: {}", e),
            }
            .into()
        })
    }
}

impl fmt::Display for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PubKey({})", self.to_hex())
    }
}

impl FromStr for PubKey {
    type Err = crate::error::MeshwireError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl serde::Serialize for PubKey {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> serde::Deserialize<'de> for PubKey {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        PubKey::from_hex(&text).map_err(serde::de::Error::custom)
    }
}

/// Secret key of a node
#[derive(Clone, ZeroizeOnDrop)]
pub struct SecKey(SigningKey);

impl SecKey {
    /// Create a secret key from its 32-byte seed
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self(SigningKey::from_bytes(bytes))
    }

    /// Parse from hexadecimal text
    pub fn from_hex(s: &str) -> Result<Self> {
        let mut bytes = hex::decode(s.trim()).map_err(|e| CryptoError::InvalidKey {
            reason: format!("invalid hex: {}", e),
        })?;
        let seed: [u8; 32] = bytes.as_slice().try_into().map_err(|_| CryptoError::InvalidKey {
            reason: format!("expected 32 bytes, got {}", bytes.len()),
        })?;
        zeroize::Zeroize::zeroize(&mut bytes);
        Ok(Self::from_bytes(&seed))
    }

    /// Convert to hexadecimal text
    pub fn to_hex(&self) -> String {
        hex::encode(self.0.to_bytes())
    }

    /// Derive the public key
    pub fn pub_key(&self) -> PubKey {
        PubKey(self.0.verifying_key().to_bytes())
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.0
    }
}

impl fmt::Debug for SecKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecKey(..)")
    }
}

/// A node's key pair
#[derive(Clone, Debug)]
pub struct KeyPair {
    pub_key: PubKey,
    sec_key: SecKey,
}

impl KeyPair {
    /// Generate a new random key pair
    ///
    /// # Example
    ///
    /// ```
    /// use meshwire::crypto::KeyPair;
    ///
    /// let keys = KeyPair::generate();
    /// assert!(!keys.pub_key().is_null());
    /// ```
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        Self::from_sec_key(SecKey(signing))
    }

    /// Deterministic key pair from a 32-byte seed (tests and fixtures)
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self::from_sec_key(SecKey::from_bytes(seed))
    }

    /// Build from an existing secret key
    pub fn from_sec_key(sec_key: SecKey) -> Self {
        Self {
            pub_key: sec_key.pub_key(),
            sec_key,
        }
    }

    /// Public half
    pub fn pub_key(&self) -> PubKey {
        self.pub_key
    }

    /// Secret half
    pub fn sec_key(&self) -> &SecKey {
        &self.sec_key
    }
}
