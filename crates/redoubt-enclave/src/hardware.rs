//! The hardware abstraction the runtime derives its identity from.
//!
//! Real deployments back [`EnclaveEnvironment`] with the platform's sealing
//! and reporting instructions; tests and simulation use
//! [`MockEnvironment`], which reproduces the two properties the rest of the
//! stack depends on:
//!
//! - sealed secrets are deterministic per (signer, key request), so the
//!   same enclave identity re-derives the same keys across restarts
//! - requests for a *newer* security version than the platform is running
//!   are refused, while older versions remain derivable (TCB recovery
//!   without rollback)

use std::sync::Mutex;

use redoubt_crypto::Hash256;
use redoubt_mail::{KeyDerivation, CPU_SVN_SIZE};

use crate::error::{EnclaveError, Result};

/// Size of a sealed hardware secret in bytes. The platform hands out
/// 128-bit secrets; the key layer stretches them to full key material.
pub const SEALED_SECRET_SIZE: usize = 16;

/// Which class of hardware key to derive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyName {
    /// The sealing key, bound to the enclave's signer.
    Seal,
}

/// What the derived key is bound to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyPolicy {
    /// Bound to the signer of the enclave, so upgraded enclave builds from
    /// the same signer recover the same secrets.
    MrSigner,
}

/// A request for a sealed hardware secret.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyRequest {
    /// Key class.
    pub key_name: KeyName,
    /// Binding policy.
    pub key_policy: KeyPolicy,
    /// CPU security version to derive for.
    pub cpu_svn: [u8; CPU_SVN_SIZE],
    /// Enclave software security version to derive for.
    pub isv_svn: u16,
}

/// How the enclave was loaded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnclaveMode {
    /// Production hardware, no debug access.
    Release,
    /// Hardware with debugger access; secrets are not protected.
    Debug,
    /// No hardware at all; everything is mocked.
    Simulation,
}

impl EnclaveMode {
    /// Wire encoding of the mode.
    pub fn to_u8(self) -> u8 {
        match self {
            EnclaveMode::Release => 0,
            EnclaveMode::Debug => 1,
            EnclaveMode::Simulation => 2,
        }
    }

    /// Decode a wire mode byte.
    pub fn from_u8(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(EnclaveMode::Release),
            1 => Ok(EnclaveMode::Debug),
            2 => Ok(EnclaveMode::Simulation),
            other => Err(EnclaveError::Protocol(format!(
                "unknown enclave mode byte {other}"
            ))),
        }
    }
}

/// The platform services an enclave runs on top of.
pub trait EnclaveEnvironment: Send + Sync {
    /// Produce a hardware report embedding `report_data`, suitable for
    /// remote attestation.
    fn create_report(&self, report_data: &[u8]) -> Result<Vec<u8>>;

    /// Derive a sealed secret for the given request.
    ///
    /// # Errors
    ///
    /// Returns [`EnclaveError::Platform`] when the request names a security
    /// version newer than the platform's current one.
    fn get_secret_key(&self, request: &KeyRequest) -> Result<[u8; SEALED_SECRET_SIZE]>;

    /// The security versions the platform is currently running at.
    fn current_key_derivation(&self) -> KeyDerivation;

    /// How the enclave was loaded.
    fn mode(&self) -> EnclaveMode;
}

/// Deterministic in-memory environment for tests and simulation mode.
///
/// Secrets are keyed BLAKE3 over the serialized key request, keyed by a
/// per-"signer" secret, which gives the same determinism and per-version
/// separation as real sealing hardware.
pub struct MockEnvironment {
    signer_secret: [u8; 32],
    mode: EnclaveMode,
    svn: Mutex<KeyDerivation>,
}

impl MockEnvironment {
    /// Create an environment for a given signer, starting at the given
    /// security versions.
    pub fn new(signer_secret: [u8; 32], cpu_svn: [u8; CPU_SVN_SIZE], isv_svn: u16) -> Self {
        Self {
            signer_secret,
            mode: EnclaveMode::Simulation,
            svn: Mutex::new(KeyDerivation { cpu_svn, isv_svn }),
        }
    }

    /// Simulate a TCB recovery: raise the platform's security versions.
    ///
    /// Keys for older versions stay derivable; requests beyond the new
    /// versions are refused.
    pub fn advance_svn(&self, cpu_svn: [u8; CPU_SVN_SIZE], isv_svn: u16) {
        let mut svn = self.svn.lock().expect("svn lock poisoned");
        svn.cpu_svn = cpu_svn;
        svn.isv_svn = isv_svn;
    }

    fn secret_for(&self, request: &KeyRequest) -> [u8; SEALED_SECRET_SIZE] {
        let mut input = Vec::with_capacity(2 + CPU_SVN_SIZE + 2);
        input.push(match request.key_name {
            KeyName::Seal => 0u8,
        });
        input.push(match request.key_policy {
            KeyPolicy::MrSigner => 0u8,
        });
        input.extend_from_slice(&request.cpu_svn);
        input.extend_from_slice(&request.isv_svn.to_be_bytes());

        let digest = Hash256::keyed_hash(&self.signer_secret, &input);
        let mut secret = [0u8; SEALED_SECRET_SIZE];
        secret.copy_from_slice(&digest.as_bytes()[..SEALED_SECRET_SIZE]);
        secret
    }
}

impl EnclaveEnvironment for MockEnvironment {
    fn create_report(&self, report_data: &[u8]) -> Result<Vec<u8>> {
        let svn = self.svn.lock().expect("svn lock poisoned");
        let measurement = Hash256::keyed_hash(&self.signer_secret, b"mock measurement");

        let mut report = Vec::with_capacity(CPU_SVN_SIZE + 2 + 32 + 32);
        report.extend_from_slice(&svn.cpu_svn);
        report.extend_from_slice(&svn.isv_svn.to_be_bytes());
        report.extend_from_slice(measurement.as_bytes());
        report.extend_from_slice(Hash256::hash(report_data).as_bytes());
        Ok(report)
    }

    fn get_secret_key(&self, request: &KeyRequest) -> Result<[u8; SEALED_SECRET_SIZE]> {
        let svn = self.svn.lock().expect("svn lock poisoned");
        if request.isv_svn > svn.isv_svn {
            return Err(EnclaveError::Platform {
                code: "SGX_ERROR_INVALID_ISVSVN",
                context: "get_secret_key",
            });
        }
        if request.cpu_svn > svn.cpu_svn {
            return Err(EnclaveError::Platform {
                code: "SGX_ERROR_INVALID_CPUSVN",
                context: "get_secret_key",
            });
        }
        Ok(self.secret_for(request))
    }

    fn current_key_derivation(&self) -> KeyDerivation {
        *self.svn.lock().expect("svn lock poisoned")
    }

    fn mode(&self) -> EnclaveMode {
        self.mode
    }
}

impl std::fmt::Debug for MockEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockEnvironment")
            .field("mode", &self.mode)
            .field("svn", &self.current_key_derivation())
            .finish_non_exhaustive()
    }
}
