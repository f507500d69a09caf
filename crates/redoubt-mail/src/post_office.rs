//! The post office: per-(destination, topic) sequencing and encryption.
//!
//! A post office is the *sole* sequencer for its (destination public key,
//! topic) pair: every mail it creates carries the next sequence number, so
//! the recipient's watermark sees a gap-free stream. Creating two post
//! offices for the same pair would emit colliding sequence numbers; the
//! owning enclave prevents that with a lookup-or-create cache keyed on
//! (destination, topic), not the post office itself.

use std::sync::{Arc, Mutex};

use redoubt_crypto::X25519PublicKey;

use crate::envelope::{KeyDerivation, MutableMail, SenderKeys};
use crate::error::Result;
use crate::padding::SizePolicy;
use crate::topic::Topic;

/// Sequencing and encryption context for one (destination, topic) pair.
pub struct PostOffice {
    sender: Arc<SenderKeys>,
    destination: X25519PublicKey,
    topic: Topic,
    destination_key_derivation: Option<KeyDerivation>,
    size_policy: SizePolicy,
    next_sequence: Mutex<u64>,
}

impl PostOffice {
    /// Create a post office for one destination and topic.
    ///
    /// `destination_key_derivation` is the descriptor that came with the
    /// destination's public key (from its `EnclaveInstanceInfo`); it is
    /// stamped into every mail header so the recipient can re-derive the
    /// right private key. `None` for plain (host-side) destinations.
    pub fn new(
        sender: Arc<SenderKeys>,
        destination: X25519PublicKey,
        topic: Topic,
        destination_key_derivation: Option<KeyDerivation>,
    ) -> Self {
        Self {
            sender,
            destination,
            topic,
            destination_key_derivation,
            size_policy: SizePolicy::None,
            next_sequence: Mutex::new(0),
        }
    }

    /// Set the minimum-size padding policy for mail from this post office.
    ///
    /// Pass the enclave's shared policy so ciphertext lengths converge
    /// across topics and destinations.
    pub fn set_size_policy(&mut self, policy: SizePolicy) {
        self.size_policy = policy;
    }

    /// Seed the next sequence number, e.g. to resume a persisted stream.
    ///
    /// The recipient's watermark still demands gap-free continuation, so
    /// this is only safe with a value one past the last mail it accepted.
    pub fn seed_sequence(&self, next: u64) {
        *self.next_sequence.lock().expect("sequence lock poisoned") = next;
    }

    /// The destination this post office encrypts for.
    pub fn destination(&self) -> &X25519PublicKey {
        &self.destination
    }

    /// The topic this post office sequences.
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// The sender identity mail from this post office is signed with.
    pub fn sender_public_key(&self) -> X25519PublicKey {
        self.sender.public_key()
    }

    /// Build the next mail in this stream.
    ///
    /// The returned [`MutableMail`] is pre-populated with the next sequence
    /// number, this post office's topic, the destination's key-derivation
    /// descriptor, and the configured size policy. The default path calls
    /// [`PostOffice::encrypt`] (or `MutableMail::encrypt`) directly; the
    /// caller may still override fields for advanced cases.
    pub fn create_mail(&self, body: Vec<u8>, envelope: Option<Vec<u8>>) -> MutableMail {
        let sequence = {
            let mut next = self.next_sequence.lock().expect("sequence lock poisoned");
            let current = *next;
            *next += 1;
            current
        };

        let mut mail = MutableMail::new(body);
        mail.set_topic(self.topic.clone());
        mail.set_sequence_number(sequence);
        mail.set_envelope(envelope);
        mail.set_key_derivation(self.destination_key_derivation);
        mail.set_size_policy(self.size_policy.clone());
        mail
    }

    /// Encrypt a mail for this post office's destination.
    pub fn encrypt(&self, mail: &MutableMail) -> Result<Vec<u8>> {
        mail.encrypt(&self.sender, &self.destination)
    }

    /// Convenience: create and encrypt in one step.
    pub fn encrypt_mail(&self, body: Vec<u8>, envelope: Option<Vec<u8>>) -> Result<Vec<u8>> {
        let mail = self.create_mail(body, envelope);
        self.encrypt(&mail)
    }
}

impl std::fmt::Debug for PostOffice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostOffice")
            .field("destination", &self.destination)
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}
