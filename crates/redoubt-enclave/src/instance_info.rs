//! The serializable identity-plus-attestation bundle of a running enclave.
//!
//! An `EnclaveInstanceInfo` is what a remote client needs to talk to an
//! enclave: its public keys, the key-derivation descriptor to stamp into
//! mail, and the attestation evidence proving the keys belong to genuine
//! hardware running the expected code.
//!
//! Wire format:
//!
//! ```text
//! +--------------------------------------+
//! | magic "EII"          | 3 bytes       |
//! | signing public key   | 4-byte len +  |
//! | encryption public key| 4-byte len +  |
//! | key-deriv descriptor | 18 bytes      |
//! | report               | 4-byte len +  |
//! | attestation signature| 4-byte len +  |
//! | certificate chain    | 4-byte len +  |
//! | [mode                | 1 byte       ]|
//! +--------------------------------------+
//! ```
//!
//! The mode byte and anything after it are optional: readers check the
//! remaining length before parsing them and ignore unrecognized trailing
//! bytes, so old readers tolerate new writers appending fields.

use redoubt_crypto::{SigningPublicKey, X25519PublicKey};
use redoubt_mail::{KeyDerivation, CPU_SVN_SIZE};

use crate::error::{EnclaveError, Result};
use crate::frame::Reader;
use crate::hardware::EnclaveMode;

const MAGIC: &[u8; 3] = b"EII";

/// Everything a remote party needs to address and verify one enclave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnclaveInstanceInfo {
    /// The enclave's Ed25519 signing key.
    pub signing_public_key: SigningPublicKey,
    /// The enclave's X25519 encryption key; mail destinations use this.
    pub encryption_public_key: X25519PublicKey,
    /// The security versions the keys were derived at; post offices stamp
    /// this into mail headers so the enclave re-derives the right key.
    pub key_derivation: KeyDerivation,
    /// The hardware report binding the keys to the enclave's measurement.
    pub report: Vec<u8>,
    /// The attestation service's signature over the report.
    pub attestation_signature: Vec<u8>,
    /// The certificate chain rooting the attestation signature.
    pub certificate_chain: Vec<u8>,
    /// The enclave load mode, absent in serializations from writers that
    /// predate the field.
    pub mode: Option<EnclaveMode>,
}

impl EnclaveInstanceInfo {
    /// Serialize for transport to clients.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            3 + 4 + 32 + 4 + 32 + CPU_SVN_SIZE + 2
                + 4 + self.report.len()
                + 4 + self.attestation_signature.len()
                + 4 + self.certificate_chain.len()
                + 1,
        );
        out.extend_from_slice(MAGIC);
        write_field(&mut out, self.signing_public_key.as_bytes());
        write_field(&mut out, self.encryption_public_key.as_bytes());
        out.extend_from_slice(&self.key_derivation.cpu_svn);
        out.extend_from_slice(&self.key_derivation.isv_svn.to_be_bytes());
        write_field(&mut out, &self.report);
        write_field(&mut out, &self.attestation_signature);
        write_field(&mut out, &self.certificate_chain);
        if let Some(mode) = self.mode {
            out.push(mode.to_u8());
        }
        out
    }

    /// Parse a serialized instance info.
    ///
    /// # Errors
    ///
    /// [`EnclaveError::Protocol`] for a bad magic or truncated fields.
    /// Unknown trailing bytes after the known fields are ignored.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);
        if reader.read_bytes(3)? != MAGIC {
            return Err(EnclaveError::Protocol(
                "instance info magic mismatch".to_string(),
            ));
        }
        let signing_public_key = SigningPublicKey::from_bytes(read_field(&mut reader)?)?;
        let encryption_public_key = X25519PublicKey::from_bytes(read_field(&mut reader)?)?;
        let mut cpu_svn = [0u8; CPU_SVN_SIZE];
        cpu_svn.copy_from_slice(reader.read_bytes(CPU_SVN_SIZE)?);
        let isv_svn = reader.read_u16()?;
        let report = read_field(&mut reader)?.to_vec();
        let attestation_signature = read_field(&mut reader)?.to_vec();
        let certificate_chain = read_field(&mut reader)?.to_vec();

        // Fields appended by newer writers: parse what we know, skip the rest
        let mode = if reader.remaining() >= 1 {
            Some(EnclaveMode::from_u8(reader.read_u8()?)?)
        } else {
            None
        };

        Ok(Self {
            signing_public_key,
            encryption_public_key,
            key_derivation: KeyDerivation { cpu_svn, isv_svn },
            report,
            attestation_signature,
            certificate_chain,
            mode,
        })
    }
}

fn write_field(out: &mut Vec<u8>, field: &[u8]) {
    out.extend_from_slice(&(field.len() as u32).to_be_bytes());
    out.extend_from_slice(field);
}

fn read_field<'a>(reader: &mut Reader<'a>) -> Result<&'a [u8]> {
    let len = reader.read_u32()? as usize;
    reader.read_bytes(len)
}
