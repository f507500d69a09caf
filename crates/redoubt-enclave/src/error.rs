//! Error types for the enclave runtime.

use thiserror::Error;

/// Errors surfaced by the enclave runtime.
#[derive(Debug, Error)]
pub enum EnclaveError {
    /// A mail-layer failure (corruption, sequence violation, limits).
    #[error(transparent)]
    Mail(#[from] redoubt_mail::MailError),

    /// A cryptographic primitive failed.
    #[error(transparent)]
    Crypto(#[from] redoubt_crypto::CryptoError),

    /// An operation that needs an active host-call context was invoked
    /// outside one.
    #[error("no active call context: {0}")]
    CallContext(String),

    /// The host's frame stream violated the call/return protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Attestation evidence did not match this enclave's own state.
    #[error("attestation mismatch: {0}")]
    AttestationMismatch(String),

    /// The platform refused a hardware operation. The code is the
    /// platform's own error identifier, passed through verbatim.
    #[error("platform error {code} during {context}")]
    Platform {
        /// Platform-defined error code.
        code: &'static str,
        /// What the runtime was doing when the platform refused.
        context: &'static str,
    },

    /// Too many concurrent host entries for the configured limit.
    #[error("concurrency limit of {limit} enclave entries exceeded")]
    ResourceExhausted {
        /// The configured entry limit.
        limit: usize,
    },

    /// The enclave does not implement the invoked entry point.
    #[error("enclave does not support {0}")]
    Unsupported(&'static str),
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, EnclaveError>;
