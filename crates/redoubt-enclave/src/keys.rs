//! Enclave identity keys derived from sealed hardware secrets.
//!
//! The platform hands out a 128-bit sealed secret per (signer, security
//! version). That secret is stretched to 256 bits of entropy, and the
//! entropy is split by key-derivation context into the enclave's X25519
//! decryption key and Ed25519 signing key. The whole chain is
//! deterministic: the same enclave on the same platform re-derives the
//! same identity across restarts, without persisting any key material.
//!
//! ## Security Notes
//!
//! - Distinct derivation contexts keep the exchange and signing keys
//!   cryptographically independent even though they share entropy
//! - Keys for *older* security versions can be re-derived on demand to
//!   decrypt mail sent before a TCB recovery; the platform refuses
//!   versions newer than its own, which is what makes rollback detectable

use std::sync::Arc;

use redoubt_crypto::{Hash256, SigningKeyPair, SigningPublicKey, X25519PublicKey, X25519StaticPrivateKey};
use redoubt_mail::{KeyDerivation, SenderKeys};
use zeroize::Zeroizing;

use crate::error::Result;
use crate::hardware::{EnclaveEnvironment, KeyName, KeyPolicy, KeyRequest};

/// Domain separator for stretching the sealed secret into entropy.
const ENTROPY_CONTEXT: &[u8] = b"redoubt-enclave-entropy-v1";

/// Derivation context for the X25519 exchange key.
const EXCHANGE_CONTEXT: &str = "redoubt enclave exchange key v1";

/// Derivation context for the Ed25519 signing key.
const SIGNING_CONTEXT: &str = "redoubt enclave signing key v1";

/// Stretch the platform's sealed secret for the given security versions
/// into 256 bits of key-derivation entropy.
pub fn derive_entropy(
    env: &dyn EnclaveEnvironment,
    key_derivation: &KeyDerivation,
) -> Result<Hash256> {
    let request = KeyRequest {
        key_name: KeyName::Seal,
        key_policy: KeyPolicy::MrSigner,
        cpu_svn: key_derivation.cpu_svn,
        isv_svn: key_derivation.isv_svn,
    };
    let secret = Zeroizing::new(env.get_secret_key(&request)?);
    Ok(Hash256::hash_many(&[ENTROPY_CONTEXT, secret.as_slice()]))
}

/// Re-derive the private exchange key an enclave held at the security
/// versions a mail's header names. Used on the decrypt path.
pub fn derive_exchange_key(
    env: &dyn EnclaveEnvironment,
    key_derivation: &KeyDerivation,
) -> Result<X25519StaticPrivateKey> {
    let entropy = derive_entropy(env, key_derivation)?;
    Ok(X25519StaticPrivateKey::from_seed(
        entropy.derive_key(EXCHANGE_CONTEXT),
    ))
}

/// The enclave's full key material at the platform's current security
/// versions.
pub struct KeyMaterial {
    sender: Arc<SenderKeys>,
    key_derivation: KeyDerivation,
}

impl KeyMaterial {
    /// Derive the identity for the platform's current security versions.
    pub fn derive(env: &dyn EnclaveEnvironment) -> Result<Self> {
        let key_derivation = env.current_key_derivation();
        let entropy = derive_entropy(env, &key_derivation)?;

        let exchange_seed = entropy.derive_key(EXCHANGE_CONTEXT);
        let signing_seed = entropy.derive_key(SIGNING_CONTEXT);

        let sender = SenderKeys::new(
            X25519StaticPrivateKey::from_seed(exchange_seed),
            SigningKeyPair::from_seed(signing_seed),
        );

        Ok(Self {
            sender: Arc::new(sender),
            key_derivation,
        })
    }

    /// The identity bundle used to sign and decrypt mail.
    pub fn sender_keys(&self) -> &Arc<SenderKeys> {
        &self.sender
    }

    /// The public encryption key other parties send mail to.
    pub fn encryption_public_key(&self) -> X25519PublicKey {
        self.sender.public_key()
    }

    /// The public signing key, published via the instance info.
    pub fn signing_public_key(&self) -> &SigningPublicKey {
        self.sender.signing_public_key()
    }

    /// The security versions this material was derived at. Stamped into
    /// outgoing mail so peers can name the right key generation.
    pub fn key_derivation(&self) -> &KeyDerivation {
        &self.key_derivation
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("public", &self.encryption_public_key())
            .field("key_derivation", &self.key_derivation)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::MockEnvironment;
    use redoubt_mail::CPU_SVN_SIZE;

    fn env() -> MockEnvironment {
        MockEnvironment::new([7u8; 32], [1u8; CPU_SVN_SIZE], 2)
    }

    #[test]
    fn test_identity_stable_across_restarts() {
        let env = env();
        let first = KeyMaterial::derive(&env).unwrap();
        let second = KeyMaterial::derive(&env).unwrap();

        assert_eq!(
            first.encryption_public_key(),
            second.encryption_public_key()
        );
        assert_eq!(first.signing_public_key(), second.signing_public_key());
    }

    #[test]
    fn test_identity_changes_with_svn() {
        let env = env();
        let before = KeyMaterial::derive(&env).unwrap();

        env.advance_svn([2u8; CPU_SVN_SIZE], 3);
        let after = KeyMaterial::derive(&env).unwrap();

        assert_ne!(
            before.encryption_public_key(),
            after.encryption_public_key()
        );
    }

    #[test]
    fn test_exchange_and_signing_keys_independent() {
        let env = env();
        let material = KeyMaterial::derive(&env).unwrap();
        assert_ne!(
            material.encryption_public_key().as_bytes(),
            material.signing_public_key().as_bytes()
        );
    }

    #[test]
    fn test_old_exchange_key_rederivable() {
        let env = env();
        let old = KeyMaterial::derive(&env).unwrap();
        let old_kd = *old.key_derivation();

        env.advance_svn([2u8; CPU_SVN_SIZE], 3);
        let rederived = derive_exchange_key(&env, &old_kd).unwrap();
        assert_eq!(rederived.public_key(), old.encryption_public_key());
    }

    #[test]
    fn test_rolled_back_platform_refuses_newer_keys() {
        let env = env();
        let future = KeyDerivation {
            cpu_svn: [1u8; CPU_SVN_SIZE],
            isv_svn: 9,
        };
        assert!(matches!(
            derive_exchange_key(&env, &future),
            Err(crate::error::EnclaveError::Platform { .. })
        ));
    }
}
