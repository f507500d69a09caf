//! The attestation handshake.
//!
//! At startup the runtime announces its public keys to the host. The host
//! is expected to obtain attestation evidence for the enclave's hardware
//! report from its attestation service and hand it back; the runtime
//! verifies the evidence against its own state before publishing it as
//! part of the instance info. Until that verification succeeds the
//! handshake stays in `AwaitingAttestation` and no instance info exists.
//!
//! ## Security Notes
//!
//! - The evidence's embedded report must byte-equal a freshly created
//!   report over the same key binding; the host cannot substitute evidence
//!   for a different enclave or different keys
//! - The evidence's claimed load mode must match the platform's actual
//!   mode, so a simulation enclave cannot be dressed up as release

use std::sync::Mutex;

use redoubt_crypto::{Hash256, SigningPublicKey, X25519PublicKey};
use redoubt_mail::{KeyDerivation, CPU_SVN_SIZE};

use crate::error::{EnclaveError, Result};
use crate::frame::Reader;
use crate::hardware::{EnclaveEnvironment, EnclaveMode};
use crate::instance_info::EnclaveInstanceInfo;
use crate::keys::KeyMaterial;

/// Domain separator binding the enclave's keys into its report data.
const REPORT_DATA_CONTEXT: &[u8] = b"redoubt-enclave-report-data-v1";

/// The evidence bundle a host-side attestation service produces for an
/// enclave's report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestationEvidence {
    /// The hardware report the evidence covers.
    pub report: Vec<u8>,
    /// The attestation service's signature over the report.
    pub signature: Vec<u8>,
    /// The certificate chain rooting that signature.
    pub certificate_chain: Vec<u8>,
    /// The enclave load mode the service observed.
    pub mode: EnclaveMode,
}

impl AttestationEvidence {
    /// Serialize as length-prefixed fields plus a trailing mode byte.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            4 + self.report.len() + 4 + self.signature.len() + 4 + self.certificate_chain.len() + 1,
        );
        for field in [&self.report, &self.signature, &self.certificate_chain] {
            out.extend_from_slice(&(field.len() as u32).to_be_bytes());
            out.extend_from_slice(field);
        }
        out.push(self.mode.to_u8());
        out
    }

    /// Parse a serialized evidence bundle.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);
        let report = reader.read_length_prefixed()?.to_vec();
        let signature = reader.read_length_prefixed()?.to_vec();
        let certificate_chain = reader.read_length_prefixed()?.to_vec();
        let mode = EnclaveMode::from_u8(reader.read_u8()?)?;
        Ok(Self {
            report,
            signature,
            certificate_chain,
            mode,
        })
    }
}

/// The startup announcement of an enclave's public keys, sent to the host
/// before any attestation exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyAnnouncement {
    /// The enclave's Ed25519 signing key.
    pub signing_public_key: SigningPublicKey,
    /// The enclave's X25519 encryption key.
    pub encryption_public_key: X25519PublicKey,
    /// The security versions the keys were derived at.
    pub key_derivation: KeyDerivation,
    /// How the enclave was loaded.
    pub mode: EnclaveMode,
}

impl KeyAnnouncement {
    /// Serialize: `[signing: 32][encryption: 32][cpu svn: 16]
    /// [isv svn: 2 BE][mode: 1]`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + 32 + CPU_SVN_SIZE + 2 + 1);
        out.extend_from_slice(self.signing_public_key.as_bytes());
        out.extend_from_slice(self.encryption_public_key.as_bytes());
        out.extend_from_slice(&self.key_derivation.cpu_svn);
        out.extend_from_slice(&self.key_derivation.isv_svn.to_be_bytes());
        out.push(self.mode.to_u8());
        out
    }

    /// Parse a serialized announcement. Host-side helper.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);
        let signing_public_key = SigningPublicKey::from_bytes(reader.read_bytes(32)?)?;
        let encryption_public_key = X25519PublicKey::from_bytes(reader.read_bytes(32)?)?;
        let mut cpu_svn = [0u8; CPU_SVN_SIZE];
        cpu_svn.copy_from_slice(reader.read_bytes(CPU_SVN_SIZE)?);
        let isv_svn = reader.read_u16()?;
        let mode = EnclaveMode::from_u8(reader.read_u8()?)?;
        Ok(Self {
            signing_public_key,
            encryption_public_key,
            key_derivation: KeyDerivation { cpu_svn, isv_svn },
            mode,
        })
    }
}

/// The report data an enclave binds its keys into: a hash committing to
/// both public keys, recomputable by anyone holding the announcement.
pub fn key_binding_report_data(
    signing: &SigningPublicKey,
    encryption: &X25519PublicKey,
) -> Hash256 {
    Hash256::hash_many(&[
        REPORT_DATA_CONTEXT,
        signing.as_bytes(),
        encryption.as_bytes(),
    ])
}

enum HandshakeState {
    AwaitingAttestation {
        /// Evidence delivered by the host, waiting to be verified.
        pending: Option<AttestationEvidence>,
    },
    Ready(EnclaveInstanceInfo),
}

/// One-shot attestation state machine: `AwaitingAttestation` until valid
/// evidence arrives, `Ready` with a cached instance info afterwards.
pub struct AttestationHandshake {
    state: Mutex<HandshakeState>,
}

impl AttestationHandshake {
    /// Start in `AwaitingAttestation`.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HandshakeState::AwaitingAttestation { pending: None }),
        }
    }

    /// Record evidence delivered by the host. Verification happens when
    /// the instance info is requested; evidence after `Ready` is refused.
    pub fn deliver_evidence(&self, evidence: AttestationEvidence) -> Result<()> {
        let mut state = self.state.lock().expect("handshake lock poisoned");
        match &mut *state {
            HandshakeState::AwaitingAttestation { pending } => {
                *pending = Some(evidence);
                Ok(())
            }
            HandshakeState::Ready(_) => Err(EnclaveError::Protocol(
                "attestation evidence after handshake completed".to_string(),
            )),
        }
    }

    /// The cached instance info, if the handshake has completed.
    pub fn instance_info(&self) -> Option<EnclaveInstanceInfo> {
        let state = self.state.lock().expect("handshake lock poisoned");
        match &*state {
            HandshakeState::Ready(info) => Some(info.clone()),
            HandshakeState::AwaitingAttestation { .. } => None,
        }
    }

    /// Verify pending evidence against the enclave's own report and mode,
    /// and transition to `Ready`.
    ///
    /// # Errors
    ///
    /// [`EnclaveError::Protocol`] if no evidence has been delivered,
    /// [`EnclaveError::AttestationMismatch`] if the evidence does not
    /// cover this enclave.
    pub fn complete(
        &self,
        env: &dyn EnclaveEnvironment,
        keys: &KeyMaterial,
    ) -> Result<EnclaveInstanceInfo> {
        let mut state = self.state.lock().expect("handshake lock poisoned");
        let pending = match &mut *state {
            HandshakeState::Ready(info) => return Ok(info.clone()),
            HandshakeState::AwaitingAttestation { pending } => pending.take(),
        };
        let evidence = pending.ok_or_else(|| {
            EnclaveError::Protocol("host supplied no attestation evidence".to_string())
        })?;

        let report_data =
            key_binding_report_data(keys.signing_public_key(), &keys.encryption_public_key());
        let expected_report = env.create_report(report_data.as_bytes())?;

        if evidence.report != expected_report {
            return Err(EnclaveError::AttestationMismatch(
                "evidence covers a different report".to_string(),
            ));
        }
        if evidence.mode != env.mode() {
            return Err(EnclaveError::AttestationMismatch(format!(
                "evidence claims {:?} but enclave is {:?}",
                evidence.mode,
                env.mode()
            )));
        }

        let info = EnclaveInstanceInfo {
            signing_public_key: keys.signing_public_key().clone(),
            encryption_public_key: keys.encryption_public_key(),
            key_derivation: *keys.key_derivation(),
            report: evidence.report,
            attestation_signature: evidence.signature,
            certificate_chain: evidence.certificate_chain,
            mode: Some(evidence.mode),
        };
        *state = HandshakeState::Ready(info.clone());
        Ok(info)
    }
}

impl Default for AttestationHandshake {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> Reader<'a> {
    fn read_length_prefixed(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.read_bytes(len)
    }
}
