//! XChaCha20-Poly1305 symmetric encryption.
//!
//! Provides AEAD encryption with 256-bit keys and 192-bit nonces.
//!
//! ## Security Notes
//!
//! - Keys are zeroized on drop
//! - Nonces are randomly generated using OsRng
//! - NEVER reuse a nonce with the same key

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{CryptoError, Result};

/// Size of symmetric key in bytes (256 bits).
pub const KEY_SIZE: usize = 32;

/// Size of nonce in bytes (192 bits for XChaCha20).
pub const NONCE_SIZE: usize = 24;

/// Size of authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// A 256-bit symmetric key for XChaCha20-Poly1305 encryption.
///
/// The key is automatically zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey {
    bytes: [u8; KEY_SIZE],
}

impl SymmetricKey {
    /// Generate a new random symmetric key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Create a key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; KEY_SIZE];
        arr.copy_from_slice(bytes);
        Ok(Self { bytes: arr })
    }

    /// Get the key as a byte slice.
    ///
    /// # Security
    ///
    /// Avoid logging or persisting the returned bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SymmetricKey([REDACTED])")
    }
}

/// A 192-bit nonce for XChaCha20-Poly1305.
#[derive(Clone, Serialize, Deserialize)]
pub struct Nonce {
    bytes: [u8; NONCE_SIZE],
}

impl Nonce {
    /// Generate a new random nonce.
    pub fn generate() -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Create a nonce from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not exactly 24 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != NONCE_SIZE {
            return Err(CryptoError::InvalidNonceLength {
                expected: NONCE_SIZE,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; NONCE_SIZE];
        arr.copy_from_slice(bytes);
        Ok(Self { bytes: arr })
    }

    /// Get the nonce as a byte slice.
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for Nonce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Nonce({:02x}{:02x}..)", self.bytes[0], self.bytes[1])
    }
}

/// Encrypted data with the nonce it was sealed under.
///
/// Serialized format: `[nonce (24 bytes)][ciphertext + tag]`
#[derive(Clone, Serialize, Deserialize)]
pub struct EncryptedData {
    /// The nonce used for encryption.
    pub nonce: Nonce,
    /// The ciphertext with authentication tag appended.
    pub ciphertext: Vec<u8>,
}

impl EncryptedData {
    /// Total size of the encrypted data when serialized.
    pub fn len(&self) -> usize {
        NONCE_SIZE + self.ciphertext.len()
    }

    /// Check if the encrypted data is empty.
    pub fn is_empty(&self) -> bool {
        self.ciphertext.is_empty()
    }

    /// Serialize to bytes (nonce || ciphertext).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(self.len());
        result.extend_from_slice(self.nonce.as_bytes());
        result.extend_from_slice(&self.ciphertext);
        result
    }

    /// Deserialize from bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is too short to contain a nonce and tag.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::Decryption);
        }
        let nonce = Nonce::from_bytes(&bytes[..NONCE_SIZE])?;
        let ciphertext = bytes[NONCE_SIZE..].to_vec();
        Ok(Self { nonce, ciphertext })
    }
}

/// Encrypt plaintext using XChaCha20-Poly1305.
///
/// Uses a random 192-bit nonce, safe for random generation.
pub fn encrypt(key: &SymmetricKey, plaintext: &[u8]) -> Result<EncryptedData> {
    encrypt_with_aad(key, plaintext, &[])
}

/// Decrypt ciphertext using XChaCha20-Poly1305.
///
/// # Errors
///
/// Returns `CryptoError::Decryption` if the ciphertext has been tampered
/// with, the wrong key is used, or the format is invalid.
pub fn decrypt(key: &SymmetricKey, encrypted: &EncryptedData) -> Result<Vec<u8>> {
    decrypt_with_aad(key, encrypted, &[])
}

/// Encrypt plaintext with additional authenticated data (AAD).
///
/// AAD is authenticated but not encrypted - used for headers that need
/// integrity protection but must stay readable without the key.
pub fn encrypt_with_aad(key: &SymmetricKey, plaintext: &[u8], aad: &[u8]) -> Result<EncryptedData> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    let nonce = Nonce::generate();
    let xnonce = XNonce::from_slice(nonce.as_bytes());

    let payload = Payload {
        msg: plaintext,
        aad,
    };

    let ciphertext = cipher
        .encrypt(xnonce, payload)
        .map_err(|_| CryptoError::Encryption("XChaCha20-Poly1305 encryption failed".into()))?;

    Ok(EncryptedData { nonce, ciphertext })
}

/// Decrypt ciphertext with additional authenticated data (AAD).
///
/// The same AAD used during encryption must be provided for decryption.
pub fn decrypt_with_aad(
    key: &SymmetricKey,
    encrypted: &EncryptedData,
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    let xnonce = XNonce::from_slice(encrypted.nonce.as_bytes());

    let payload = Payload {
        msg: &encrypted.ciphertext,
        aad,
    };

    cipher.decrypt(xnonce, payload).map_err(|_| CryptoError::Decryption)
}
