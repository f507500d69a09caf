//! Error types for mail operations.

use thiserror::Error;

/// Which kind of sequence-number violation was observed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SequenceViolationKind {
    /// The received sequence number was already accepted.
    Duplicate,
    /// The received sequence number is older than the watermark.
    Rewind,
    /// The received sequence number skips ahead of the watermark.
    Gap,
}

impl std::fmt::Display for SequenceViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cause = match self {
            // The most recent mail was delivered twice: either a replay or
            // the same post office was used over two channels.
            SequenceViolationKind::Duplicate => {
                "duplicate (replayed mail, or the same stream delivered twice)"
            }
            SequenceViolationKind::Rewind => "rewind (replay of an old mail)",
            SequenceViolationKind::Gap => {
                "gap (mail reordered or dropped in transit, or two post offices \
                 sequencing the same topic)"
            }
        };
        f.write_str(cause)
    }
}

/// Errors that can occur during mail operations.
#[derive(Error, Debug)]
pub enum MailError {
    /// AEAD verification failed: the blob was corrupted or tampered with,
    /// or the wrong key was used. Any single-bit flip anywhere in an
    /// encrypted mail surfaces as this error.
    #[error("Mail corrupted: authentication failed")]
    Corruption,

    /// Sequence-number enforcement failed for a (sender, topic) stream.
    #[error(
        "Sequence violation on topic '{topic}': expected {expected}, received {received} - {kind}"
    )]
    SequenceViolation {
        /// The topic of the offending mail.
        topic: String,
        /// The sequence number the watermark required.
        expected: u64,
        /// The sequence number actually received.
        received: u64,
        /// Duplicate, rewind, or gap.
        kind: SequenceViolationKind,
    },

    /// Topic string violates the `[A-Za-z0-9-]+` format.
    #[error("Invalid topic '{0}': topics must match [A-Za-z0-9-]+ and be 1-256 characters")]
    InvalidTopic(String),

    /// A field exceeds the wire-format limits.
    #[error("Mail too large: {field} is {actual} bytes (maximum {max})")]
    TooLarge {
        /// Which field overflowed.
        field: &'static str,
        /// Actual size in bytes.
        actual: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Cryptographic operation failed.
    #[error("Crypto error: {0}")]
    Crypto(#[from] redoubt_crypto::CryptoError),
}

/// Result type for mail operations.
pub type Result<T> = std::result::Result<T, MailError>;
