//! X25519 Diffie-Hellman key exchange.
//!
//! Mail encryption keys are agreed via ephemeral-static ECDH: the sender
//! generates a fresh ephemeral pair per mail, the recipient holds a static
//! key derived from sealed hardware entropy.
//!
//! ## Security Notes
//!
//! - Private keys are zeroized on drop
//! - Static keys can be derived deterministically from a 32-byte seed
//! - Shared secrets feed a KDF, never used directly as encryption keys

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{CryptoError, Result};

/// Size of X25519 public key in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of X25519 private key in bytes.
pub const PRIVATE_KEY_SIZE: usize = 32;

/// Size of shared secret in bytes.
pub const SHARED_SECRET_SIZE: usize = 32;

/// X25519 public key for key exchange.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct X25519PublicKey {
    bytes: [u8; PUBLIC_KEY_SIZE],
}

impl X25519PublicKey {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PUBLIC_KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: PUBLIC_KEY_SIZE,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; PUBLIC_KEY_SIZE];
        arr.copy_from_slice(bytes);
        Ok(Self { bytes: arr })
    }

    /// Get the key as bytes.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.bytes
    }

    /// Convert to byte array.
    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.bytes
    }
}

impl std::fmt::Debug for X25519PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "X25519PublicKey({:02x}{:02x}..)",
            self.bytes[0], self.bytes[1]
        )
    }
}

impl From<PublicKey> for X25519PublicKey {
    fn from(key: PublicKey) -> Self {
        Self {
            bytes: key.to_bytes(),
        }
    }
}

impl From<&X25519PublicKey> for PublicKey {
    fn from(key: &X25519PublicKey) -> Self {
        PublicKey::from(key.bytes)
    }
}

/// X25519 static private key for key exchange.
///
/// This is the long-lived decryption key of an enclave. It can be derived
/// deterministically from sealed entropy so the same enclave identity
/// recovers the same key across restarts.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct X25519StaticPrivateKey {
    bytes: [u8; PRIVATE_KEY_SIZE],
}

impl X25519StaticPrivateKey {
    /// Generate a new random private key.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        Self {
            bytes: secret.to_bytes(),
        }
    }

    /// Derive a private key deterministically from a 32-byte seed.
    ///
    /// The same seed always yields the same key pair. The seed must come
    /// from a high-entropy source such as sealed hardware secrets.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let secret = StaticSecret::from(seed);
        Self {
            bytes: secret.to_bytes(),
        }
    }

    /// Create from raw bytes.
    ///
    /// # Security
    ///
    /// Only use bytes from a secure source.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PRIVATE_KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: PRIVATE_KEY_SIZE,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; PRIVATE_KEY_SIZE];
        arr.copy_from_slice(bytes);
        Ok(Self { bytes: arr })
    }

    /// Get the corresponding public key.
    pub fn public_key(&self) -> X25519PublicKey {
        let secret = StaticSecret::from(self.bytes);
        X25519PublicKey::from(PublicKey::from(&secret))
    }

    /// Perform Diffie-Hellman key exchange with a peer's public key.
    pub fn diffie_hellman(&self, peer_public: &X25519PublicKey) -> SharedSecret {
        let secret = StaticSecret::from(self.bytes);
        let peer = PublicKey::from(peer_public);
        let shared = secret.diffie_hellman(&peer);
        SharedSecret {
            bytes: shared.to_bytes(),
        }
    }
}

impl std::fmt::Debug for X25519StaticPrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "X25519StaticPrivateKey([REDACTED])")
    }
}

// Clone intentionally NOT implemented for X25519StaticPrivateKey:
// secret material must not be silently duplicated in memory.

/// X25519 ephemeral key pair for single-use key exchange.
///
/// One pair per encrypted mail; the private half is consumed by the
/// Diffie-Hellman operation.
pub struct X25519EphemeralKeyPair {
    secret: EphemeralSecret,
    public: X25519PublicKey,
}

impl X25519EphemeralKeyPair {
    /// Generate a new ephemeral key pair.
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public_key = PublicKey::from(&secret);
        Self {
            secret,
            public: X25519PublicKey::from(public_key),
        }
    }

    /// Get the public key.
    pub fn public_key(&self) -> &X25519PublicKey {
        &self.public
    }

    /// Perform Diffie-Hellman and consume the ephemeral key.
    pub fn diffie_hellman(self, peer_public: &X25519PublicKey) -> SharedSecret {
        let peer = PublicKey::from(peer_public);
        let shared = self.secret.diffie_hellman(&peer);
        SharedSecret {
            bytes: shared.to_bytes(),
        }
    }
}

impl std::fmt::Debug for X25519EphemeralKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "X25519EphemeralKeyPair {{ public: {:?} }}", self.public)
    }
}

/// Shared secret derived from Diffie-Hellman key exchange.
///
/// Input to a KDF, never an encryption key itself.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret {
    bytes: [u8; SHARED_SECRET_SIZE],
}

impl SharedSecret {
    /// Get the shared secret as bytes.
    pub fn as_bytes(&self) -> &[u8; SHARED_SECRET_SIZE] {
        &self.bytes
    }

    /// Derive an encryption key using BLAKE3 key derivation.
    pub fn derive_key(&self, context: &str) -> [u8; 32] {
        blake3::derive_key(context, &self.bytes)
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SharedSecret([REDACTED])")
    }
}
