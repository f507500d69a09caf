//! Ed25519 message signing.
//!
//! Every encrypted mail carries a sender signature inside the sealed body;
//! the recipient verifies it after decryption, which is what makes the
//! authenticated-sender field trustworthy.
//!
//! ## Security Notes
//!
//! - Signing keys are zeroized on drop
//! - Keys can be derived deterministically from a 32-byte seed

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::{CryptoError, Result};

/// Size of an Ed25519 public key in bytes.
pub const SIGNING_PUBLIC_KEY_SIZE: usize = 32;

/// Size of an Ed25519 signature in bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// Ed25519 public key for signature verification.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SigningPublicKey {
    bytes: [u8; SIGNING_PUBLIC_KEY_SIZE],
}

impl SigningPublicKey {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != SIGNING_PUBLIC_KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: SIGNING_PUBLIC_KEY_SIZE,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; SIGNING_PUBLIC_KEY_SIZE];
        arr.copy_from_slice(bytes);
        Ok(Self { bytes: arr })
    }

    /// Get the key as bytes.
    pub fn as_bytes(&self) -> &[u8; SIGNING_PUBLIC_KEY_SIZE] {
        &self.bytes
    }

    /// Convert to byte array.
    pub fn to_bytes(&self) -> [u8; SIGNING_PUBLIC_KEY_SIZE] {
        self.bytes
    }

    /// Verify a signature over a message.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::SignatureVerification` if the signature does
    /// not match, or if the key bytes are not a valid curve point.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        let key = VerifyingKey::from_bytes(&self.bytes)
            .map_err(|_| CryptoError::SignatureVerification)?;
        let sig = ed25519_dalek::Signature::from_bytes(&signature.bytes);
        key.verify(message, &sig)
            .map_err(|_| CryptoError::SignatureVerification)
    }
}

impl std::fmt::Debug for SigningPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SigningPublicKey({:02x}{:02x}..)",
            self.bytes[0], self.bytes[1]
        )
    }
}

/// An Ed25519 signature.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    #[serde(with = "serde_bytes64")]
    bytes: [u8; SIGNATURE_SIZE],
}

impl Signature {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != SIGNATURE_SIZE {
            return Err(CryptoError::InvalidSignatureLength {
                expected: SIGNATURE_SIZE,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; SIGNATURE_SIZE];
        arr.copy_from_slice(bytes);
        Ok(Self { bytes: arr })
    }

    /// Get the signature as bytes.
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Signature({:02x}{:02x}..)",
            self.bytes[0], self.bytes[1]
        )
    }
}

/// Serde helper for 64-byte arrays, which serde does not handle natively.
mod serde_bytes64 {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &[u8; 64],
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<[u8; 64], D::Error> {
        let v: Vec<u8> = Vec::deserialize(deserializer)?;
        v.try_into()
            .map_err(|_| D::Error::custom("expected 64 bytes"))
    }
}

/// Ed25519 signing key pair.
///
/// The secret half is zeroized on drop.
pub struct SigningKeyPair {
    secret: SigningKey,
    public: SigningPublicKey,
}

impl SigningKeyPair {
    /// Generate a new random key pair.
    pub fn generate() -> Self {
        let mut seed = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(seed.as_mut());
        Self::from_seed(*seed)
    }

    /// Derive a key pair deterministically from a 32-byte seed.
    ///
    /// The same seed always yields the same key pair. The seed must come
    /// from a high-entropy source such as sealed hardware secrets.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let secret = SigningKey::from_bytes(&seed);
        let public = SigningPublicKey {
            bytes: secret.verifying_key().to_bytes(),
        };
        Self { secret, public }
    }

    /// Get the public key.
    pub fn public_key(&self) -> &SigningPublicKey {
        &self.public
    }

    /// Sign a message.
    pub fn sign(&self, message: &[u8]) -> Signature {
        let sig = self.secret.sign(message);
        Signature {
            bytes: sig.to_bytes(),
        }
    }
}

impl std::fmt::Debug for SigningKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SigningKeyPair {{ public: {:?} }}", self.public)
    }
}
