//! Validated topic names.
//!
//! A topic names one independently-sequenced conversation channel between a
//! sender and a recipient. The format is deliberately narrow - `[A-Za-z0-9-]+`
//! with no dots or whitespace - so topics can be embedded in file names,
//! headers, and log lines without escaping.

use serde::{Deserialize, Serialize};

use crate::error::{MailError, Result};
use crate::limits::{DEFAULT_TOPIC, MAX_TOPIC_LEN};

/// A validated topic name.
///
/// Invalid characters are rejected at construction time, before any network
/// or crypto cost is paid.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Topic(String);

impl Topic {
    /// Create a validated topic.
    ///
    /// # Errors
    ///
    /// Returns `MailError::InvalidTopic` if the string is empty, longer than
    /// [`MAX_TOPIC_LEN`], or contains anything outside `[A-Za-z0-9-]`.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() || name.len() > MAX_TOPIC_LEN {
            return Err(MailError::InvalidTopic(name));
        }
        if !name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-')
        {
            return Err(MailError::InvalidTopic(name));
        }
        Ok(Self(name))
    }

    /// Get the topic as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Topic {
    fn default() -> Self {
        Self(DEFAULT_TOPIC.to_string())
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Topic {
    type Error = MailError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Topic> for String {
    fn from(topic: Topic) -> Self {
        topic.0
    }
}

impl std::str::FromStr for Topic {
    type Err = MailError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_topics() {
        assert!(Topic::new("valid-topic").is_ok());
        assert!(Topic::new("default").is_ok());
        assert!(Topic::new("a").is_ok());
        assert!(Topic::new("UPPER-and-lower-123").is_ok());
    }

    #[test]
    fn test_whitespace_rejected() {
        assert!(matches!(
            Topic::new("no whitespace allowed"),
            Err(MailError::InvalidTopic(_))
        ));
    }

    #[test]
    fn test_punctuation_rejected() {
        assert!(Topic::new("!!!").is_err());
        assert!(Topic::new("under_score").is_err());
        assert!(Topic::new("slash/slash").is_err());
    }

    #[test]
    fn test_dotted_rejected() {
        assert!(matches!(
            Topic::new("1234.5678"),
            Err(MailError::InvalidTopic(_))
        ));
    }

    #[test]
    fn test_non_ascii_rejected() {
        assert!(Topic::new("t\u{00e9}ma").is_err());
        assert!(Topic::new("\u{4e3b}\u{9898}").is_err());
    }

    #[test]
    fn test_empty_rejected() {
        assert!(Topic::new("").is_err());
    }

    #[test]
    fn test_too_long_rejected() {
        let long = "a".repeat(MAX_TOPIC_LEN + 1);
        assert!(Topic::new(long).is_err());

        let at_limit = "a".repeat(MAX_TOPIC_LEN);
        assert!(Topic::new(at_limit).is_ok());
    }

    #[test]
    fn test_default_topic() {
        assert_eq!(Topic::default().as_str(), "default");
    }
}
