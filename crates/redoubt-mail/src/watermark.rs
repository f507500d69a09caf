//! Per-(sender, topic) sequence watermarks.
//!
//! Every accepted mail advances a watermark by exactly one; anything else
//! is rejected. This is the receive-side half of the gap-free sequencing
//! contract whose send-side half is the post office.
//!
//! Watermarks for different keys are independent; updates for the same key
//! are mutually exclusive.

use std::collections::HashMap;
use std::sync::Mutex;

use redoubt_crypto::X25519PublicKey;

use crate::error::{MailError, Result, SequenceViolationKind};
use crate::topic::Topic;

/// Tracks the highest accepted sequence number per (sender, topic).
///
/// A missing entry means "none seen": the first mail on a stream must carry
/// sequence number 0.
#[derive(Debug, Default)]
pub struct SequenceWatermarks {
    last_seen: Mutex<HashMap<(X25519PublicKey, Topic), u64>>,
}

impl SequenceWatermarks {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check an incoming mail's sequence number and advance the watermark.
    ///
    /// The check and the update are atomic: concurrent deliveries for the
    /// same (sender, topic) serialize on the internal lock, so exactly one
    /// of two racing duplicates is accepted.
    ///
    /// # Errors
    ///
    /// Returns `MailError::SequenceViolation` unless `sequence_number` is
    /// exactly one past the watermark (or 0 for a fresh stream). The error
    /// distinguishes duplicates, rewinds, and gaps.
    pub fn check_and_advance(
        &self,
        sender: &X25519PublicKey,
        topic: &Topic,
        sequence_number: u64,
    ) -> Result<()> {
        let mut map = self.last_seen.lock().expect("watermark lock poisoned");
        let key = (sender.clone(), topic.clone());

        let expected = match map.get(&key) {
            None => 0,
            Some(last) => last + 1,
        };

        if sequence_number != expected {
            let kind = match map.get(&key) {
                Some(last) if sequence_number == *last => SequenceViolationKind::Duplicate,
                Some(last) if sequence_number < *last => SequenceViolationKind::Rewind,
                _ => SequenceViolationKind::Gap,
            };
            return Err(MailError::SequenceViolation {
                topic: topic.as_str().to_string(),
                expected,
                received: sequence_number,
                kind,
            });
        }

        map.insert(key, sequence_number);
        Ok(())
    }

    /// The highest accepted sequence number for a stream, if any mail has
    /// been accepted on it.
    pub fn watermark(&self, sender: &X25519PublicKey, topic: &Topic) -> Option<u64> {
        let map = self.last_seen.lock().expect("watermark lock poisoned");
        map.get(&(sender.clone(), topic.clone())).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redoubt_crypto::X25519StaticPrivateKey;

    fn sender() -> X25519PublicKey {
        X25519StaticPrivateKey::from_seed([1u8; 32]).public_key()
    }

    fn topic(name: &str) -> Topic {
        Topic::new(name).unwrap()
    }

    #[test]
    fn test_in_order_accepted() {
        let watermarks = SequenceWatermarks::new();
        let sender = sender();
        let topic = topic("default");

        for seq in 0..3 {
            watermarks.check_and_advance(&sender, &topic, seq).unwrap();
        }
        assert_eq!(watermarks.watermark(&sender, &topic), Some(2));
    }

    #[test]
    fn test_first_mail_must_be_zero() {
        let watermarks = SequenceWatermarks::new();
        let err = watermarks
            .check_and_advance(&sender(), &topic("default"), 5)
            .unwrap_err();
        assert!(matches!(
            err,
            MailError::SequenceViolation {
                expected: 0,
                received: 5,
                kind: SequenceViolationKind::Gap,
                ..
            }
        ));
    }

    #[test]
    fn test_duplicate_rejected() {
        let watermarks = SequenceWatermarks::new();
        let sender = sender();
        let topic = topic("default");

        watermarks.check_and_advance(&sender, &topic, 0).unwrap();
        watermarks.check_and_advance(&sender, &topic, 1).unwrap();

        let err = watermarks.check_and_advance(&sender, &topic, 1).unwrap_err();
        assert!(matches!(
            err,
            MailError::SequenceViolation {
                expected: 2,
                received: 1,
                kind: SequenceViolationKind::Duplicate,
                ..
            }
        ));
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_rewind_rejected() {
        let watermarks = SequenceWatermarks::new();
        let sender = sender();
        let topic = topic("default");

        watermarks.check_and_advance(&sender, &topic, 0).unwrap();
        watermarks.check_and_advance(&sender, &topic, 1).unwrap();

        let err = watermarks.check_and_advance(&sender, &topic, 0).unwrap_err();
        assert!(matches!(
            err,
            MailError::SequenceViolation {
                kind: SequenceViolationKind::Rewind,
                ..
            }
        ));
        assert!(err.to_string().contains("replay"));
    }

    #[test]
    fn test_gap_rejected() {
        let watermarks = SequenceWatermarks::new();
        let sender = sender();
        let topic = topic("default");

        for seq in 0..3 {
            watermarks.check_and_advance(&sender, &topic, seq).unwrap();
        }

        let err = watermarks.check_and_advance(&sender, &topic, 50).unwrap_err();
        assert!(matches!(
            err,
            MailError::SequenceViolation {
                expected: 3,
                received: 50,
                kind: SequenceViolationKind::Gap,
                ..
            }
        ));
        // Watermark unchanged after a rejection
        assert_eq!(watermarks.watermark(&sender, &topic), Some(2));
    }

    #[test]
    fn test_topics_are_independent() {
        let watermarks = SequenceWatermarks::new();
        let sender = sender();

        watermarks
            .check_and_advance(&sender, &topic("alpha"), 0)
            .unwrap();
        watermarks
            .check_and_advance(&sender, &topic("beta"), 0)
            .unwrap();
        watermarks
            .check_and_advance(&sender, &topic("alpha"), 1)
            .unwrap();

        assert_eq!(watermarks.watermark(&sender, &topic("alpha")), Some(1));
        assert_eq!(watermarks.watermark(&sender, &topic("beta")), Some(0));
    }

    #[test]
    fn test_senders_are_independent() {
        let watermarks = SequenceWatermarks::new();
        let other = X25519StaticPrivateKey::from_seed([2u8; 32]).public_key();
        let topic = topic("default");

        watermarks.check_and_advance(&sender(), &topic, 0).unwrap();
        watermarks.check_and_advance(&other, &topic, 0).unwrap();
    }

    #[test]
    fn test_concurrent_duplicates_accept_exactly_one() {
        use std::sync::Arc;

        let watermarks = Arc::new(SequenceWatermarks::new());
        let sender = sender();
        let topic = topic("default");
        watermarks.check_and_advance(&sender, &topic, 0).unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let watermarks = Arc::clone(&watermarks);
            let sender = sender.clone();
            let topic = topic.clone();
            handles.push(std::thread::spawn(move || {
                watermarks.check_and_advance(&sender, &topic, 1).is_ok()
            }));
        }

        let accepted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(accepted, 1);
    }
}
