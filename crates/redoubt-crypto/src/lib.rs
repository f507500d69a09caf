//! # redoubt-crypto
//!
//! Cryptographic primitives for the REDOUBT enclave mail system.
//!
//! This crate provides:
//! - **XChaCha20-Poly1305** for authenticated symmetric encryption
//! - **X25519** for Diffie-Hellman key agreement
//! - **Ed25519** for message signing
//! - **BLAKE3** for hashing and key derivation
//!
//! ## Security
//!
//! All secret data uses `zeroize` for secure memory cleanup.
//! Comparisons of secrets use constant-time operations via `subtle`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod exchange;
pub mod hash;
pub mod signing;
pub mod symmetric;

pub use error::{CryptoError, Result};
pub use exchange::{SharedSecret, X25519EphemeralKeyPair, X25519PublicKey, X25519StaticPrivateKey};
pub use hash::Hash256;
pub use signing::{Signature, SigningKeyPair, SigningPublicKey};
pub use symmetric::{
    decrypt, decrypt_with_aad, encrypt, encrypt_with_aad, EncryptedData, Nonce, SymmetricKey,
};
