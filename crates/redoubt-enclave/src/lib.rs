//! # redoubt-enclave
//!
//! The trusted-side runtime for enclaves speaking the redoubt mail
//! protocol. It owns everything between the hardware and application
//! code:
//!
//! - **Hardware abstraction**: sealed-secret and report access behind
//!   [`EnclaveEnvironment`], with a deterministic [`MockEnvironment`] for
//!   tests and simulation
//! - **Key derivation**: a stable enclave identity (X25519 + Ed25519)
//!   derived from sealed secrets, re-derivable per security version
//! - **Frame multiplexing**: the CALL / CALL_RETURN / MAIL_DELIVERY /
//!   ATTESTATION protocol with the untrusted host, including nested
//!   re-entrant calls
//! - **Attestation**: the startup handshake that turns host-supplied
//!   evidence into a verified [`EnclaveInstanceInfo`]
//! - **Runtime**: the [`Enclave`] trait application code implements, plus
//!   decryption, sequence enforcement, and deferred mail posting
//!
//! ## Trust model
//!
//! The host is untrusted: every frame it sends is validated, every mail
//! is authenticated before the application sees it, and nothing the
//! enclave posts becomes visible to the host mid-entry.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod attestation;
pub mod error;
pub mod frame;
pub mod hardware;
pub mod instance_info;
pub mod keys;
pub mod multiplexer;
pub mod runtime;

pub use attestation::{AttestationEvidence, AttestationHandshake, KeyAnnouncement};
pub use error::{EnclaveError, Result};
pub use frame::{InboundFrame, OutboundFrame};
pub use hardware::{
    EnclaveEnvironment, EnclaveMode, KeyName, KeyPolicy, KeyRequest, MockEnvironment,
};
pub use instance_info::EnclaveInstanceInfo;
pub use keys::KeyMaterial;
pub use multiplexer::{CallCallback, CallDispatch, HostSender, Multiplexer};
pub use runtime::{CallContext, Enclave, EnclaveRuntime, DEFAULT_MAX_CONCURRENT_ENTRIES};
