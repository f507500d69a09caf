//! Wire-format limits and constants.
//!
//! All mail limits are defined here for consistent enforcement.

/// Maximum length of a topic string in bytes.
pub const MAX_TOPIC_LEN: usize = 256;

/// The topic used when the sender does not pick one.
pub const DEFAULT_TOPIC: &str = "default";

/// Maximum size of a mail body in bytes (16 MiB).
pub const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

/// Maximum size of an envelope (caller metadata) in bytes.
pub const MAX_ENVELOPE_SIZE: usize = 64 * 1024;

/// Maximum size of a whole encrypted mail blob in bytes.
///
/// Checked before any parsing to prevent OOM from malicious length fields.
pub const MAX_MAIL_SIZE: usize = 32 * 1024 * 1024;

/// Number of recent body sizes the moving-average padding policy remembers.
pub const MOVING_AVERAGE_WINDOW: usize = 32;
