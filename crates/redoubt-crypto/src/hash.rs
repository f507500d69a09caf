//! BLAKE3 hashing primitives.
//!
//! Provides a 256-bit hash type with keyed hashing and key derivation,
//! used throughout the mail layer for entropy stretching and per-purpose
//! key separation.

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

/// A 256-bit (32-byte) hash value using BLAKE3.
#[derive(Clone, Default, Serialize, Deserialize, Zeroize)]
pub struct Hash256([u8; 32]);

impl Hash256 {
    /// Hash size in bytes.
    pub const SIZE: usize = 32;

    /// Create a Hash256 from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> crate::Result<Self> {
        if bytes.len() != Self::SIZE {
            return Err(crate::CryptoError::InvalidHashLength {
                expected: Self::SIZE,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(bytes);
        Ok(Self(arr))
    }

    /// Get the hash as a byte slice.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to owned byte array.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0
    }

    /// Hash a single input.
    pub fn hash(data: &[u8]) -> Self {
        let hash = blake3::hash(data);
        Self(*hash.as_bytes())
    }

    /// Hash multiple inputs with length prefixing for domain separation.
    pub fn hash_many(inputs: &[&[u8]]) -> Self {
        let mut hasher = blake3::Hasher::new();
        for input in inputs {
            hasher.update(&(input.len() as u64).to_le_bytes());
            hasher.update(input);
        }
        let hash = hasher.finalize();
        Self(*hash.as_bytes())
    }

    /// Create a keyed hash (MAC).
    pub fn keyed_hash(key: &[u8; 32], data: &[u8]) -> Self {
        let hash = blake3::keyed_hash(key, data);
        Self(*hash.as_bytes())
    }

    /// Derive a key from this hash using BLAKE3 key derivation.
    pub fn derive_key(&self, context: &str) -> [u8; 32] {
        blake3::derive_key(context, &self.0)
    }

    /// Check if this hash is all zeros.
    pub fn is_zero(&self) -> bool {
        self.0.ct_eq(&[0u8; 32]).into()
    }

    /// Format as hex string.
    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(64);
        for byte in &self.0 {
            s.push_str(&format!("{:02x}", byte));
        }
        s
    }
}

impl ConstantTimeEq for Hash256 {
    fn ct_eq(&self, other: &Self) -> subtle::Choice {
        self.0.ct_eq(&other.0)
    }
}

impl PartialEq for Hash256 {
    fn eq(&self, other: &Self) -> bool {
        // Constant-time to prevent timing side-channels
        self.ct_eq(other).into()
    }
}

impl Eq for Hash256 {}

impl std::hash::Hash for Hash256 {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        // Bucket selection only, not a cryptographic operation
        self.0.hash(state);
    }
}

impl std::fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash256({})", &self.to_hex()[..16])
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
