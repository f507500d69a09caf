//! # redoubt-mail
//!
//! Encrypted, authenticated, sequenced asynchronous messages ("mail")
//! between enclaves and hosts.
//!
//! This crate provides:
//! - **Envelope codec**: the wire format of one encrypted mail - an
//!   unauthenticated header readable without keys, followed by an
//!   AEAD-sealed body that authenticates the header as associated data
//! - **Topic**: validated conversation-channel names
//! - **SizePolicy**: minimum-size padding so ciphertext lengths do not
//!   trivially reveal message sizes
//! - **SequenceWatermarks**: per-(sender, topic) strictly-incrementing
//!   sequence enforcement against replay and reordering
//! - **PostOffice**: the single sequencing and encryption context for one
//!   (destination, topic) pair
//!
//! ## Trust model
//!
//! A mail's header (topic, sequence number, envelope) is readable by anyone
//! holding the blob, including the untrusted host that routes it. Only after
//! a successful decrypt are those fields authenticated, and only then is the
//! sender's public key trustworthy.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod envelope;
pub mod error;
pub mod limits;
pub mod padding;
pub mod post_office;
pub mod topic;
pub mod watermark;

pub use envelope::{KeyDerivation, Mail, MailHeader, MutableMail, SenderKeys, CPU_SVN_SIZE};
pub use error::{MailError, Result, SequenceViolationKind};
pub use padding::{MovingAverageSizePolicy, SizePolicy};
pub use post_office::PostOffice;
pub use topic::Topic;
pub use watermark::SequenceWatermarks;
