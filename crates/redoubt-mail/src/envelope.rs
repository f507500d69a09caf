//! The mail envelope codec.
//!
//! Wire format of one encrypted mail:
//!
//! ```text
//! +------------------------------+
//! | version          | 1 byte    |
//! | topic length     | 2 bytes BE|
//! | topic            | variable  |
//! | sequence number  | 8 bytes BE|
//! | envelope flag    | 1 byte    |
//! | [envelope length | 4 bytes BE]
//! | [envelope        | variable ]
//! | key-deriv flag   | 1 byte    |
//! | [cpu svn         | 16 bytes ]
//! | [isv svn         | 2 bytes BE]
//! | ephemeral public | 32 bytes  |   <- end of unauthenticated header
//! +------------------------------+
//! | nonce            | 24 bytes  |
//! | sealed body      | variable  |   AEAD, header as associated data
//! +------------------------------+
//! ```
//!
//! The header is readable without any key - [`MailHeader::from_bytes`] -
//! which lets the untrusted host route mail by topic. It is *not*
//! trustworthy until decryption succeeds: the whole header is fed to the
//! AEAD as associated data, so any bit flip anywhere in the blob fails
//! authentication.
//!
//! Sealed plaintext layout:
//!
//! ```text
//! [sender exchange public: 32][sender signing public: 32][signature: 64]
//! [body length: 4 BE][body][random padding to the size policy target]
//! ```
//!
//! The signature covers the header, the sender's exchange key, and the
//! body; verifying it against the enclosed signing key is what makes
//! [`Mail::authenticated_sender`] cryptographically proven.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use redoubt_crypto::symmetric::{NONCE_SIZE, TAG_SIZE};
use redoubt_crypto::{
    decrypt_with_aad, encrypt_with_aad, EncryptedData, Hash256, Nonce, Signature, SigningKeyPair,
    SigningPublicKey, SymmetricKey, X25519EphemeralKeyPair, X25519PublicKey,
    X25519StaticPrivateKey,
};

use crate::error::{MailError, Result};
use crate::limits::{MAX_BODY_SIZE, MAX_ENVELOPE_SIZE, MAX_MAIL_SIZE};
use crate::padding::SizePolicy;
use crate::topic::Topic;

/// Current envelope wire version.
pub const WIRE_VERSION: u8 = 1;

/// Domain separator for deriving the mail AEAD key from the ECDH secret.
const MAIL_KEY_CONTEXT: &str = "redoubt mail encryption v1";

/// Domain separator for the sender-commitment signature.
const MAIL_SIG_CONTEXT: &[u8] = b"redoubt-mail-sender-sig-v1";

/// Fixed part of the sealed plaintext: both sender keys plus signature.
const SEALED_PREFIX_SIZE: usize = 32 + 32 + 64;

/// Size of the CPU security-version field.
pub const CPU_SVN_SIZE: usize = 16;

/// Describes which hardware key generation an enclave-addressed mail was
/// encrypted under, so the recipient can re-derive the matching private key
/// on demand instead of storing per-version keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyDerivation {
    /// CPU security version number at key-derivation time.
    pub cpu_svn: [u8; CPU_SVN_SIZE],
    /// Enclave software security version number.
    pub isv_svn: u16,
}

/// The sender's long-lived keys: an X25519 identity key (its public half is
/// the authenticated-sender identity committed inside each mail) and an
/// Ed25519 signing key that proves the commitment.
pub struct SenderKeys {
    exchange: X25519StaticPrivateKey,
    signing: SigningKeyPair,
}

impl SenderKeys {
    /// Bundle existing keys.
    pub fn new(exchange: X25519StaticPrivateKey, signing: SigningKeyPair) -> Self {
        Self { exchange, signing }
    }

    /// Generate a fresh random identity (host-side senders, tests).
    pub fn generate() -> Self {
        Self {
            exchange: X25519StaticPrivateKey::generate(),
            signing: SigningKeyPair::generate(),
        }
    }

    /// The public identity other parties see as `authenticated_sender`.
    pub fn public_key(&self) -> X25519PublicKey {
        self.exchange.public_key()
    }

    /// The public half of the signing key.
    pub fn signing_public_key(&self) -> &SigningPublicKey {
        self.signing.public_key()
    }

    /// The private exchange key, for decrypting mail addressed to this
    /// identity.
    pub fn exchange_private_key(&self) -> &X25519StaticPrivateKey {
        &self.exchange
    }
}

impl std::fmt::Debug for SenderKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SenderKeys")
            .field("public", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// The unauthenticated header of an encrypted mail.
///
/// Parseable without any key. Trustworthy only after the mail decrypts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MailHeader {
    topic: Topic,
    sequence_number: u64,
    envelope: Option<Vec<u8>>,
    key_derivation: Option<KeyDerivation>,
    ephemeral_public: X25519PublicKey,
    /// Bytes consumed by the header, i.e. the offset of the nonce.
    header_len: usize,
}

impl MailHeader {
    /// Parse the header of an encrypted mail without decrypting it.
    ///
    /// # Errors
    ///
    /// Returns `MailError::Corruption` if the blob is malformed.
    pub fn from_bytes(blob: &[u8]) -> Result<Self> {
        if blob.len() > MAX_MAIL_SIZE {
            return Err(MailError::TooLarge {
                field: "mail",
                actual: blob.len(),
                max: MAX_MAIL_SIZE,
            });
        }
        let mut cursor = Cursor::new(blob);

        if cursor.read_u8()? != WIRE_VERSION {
            return Err(MailError::Corruption);
        }

        let topic_len = cursor.read_u16()? as usize;
        let topic_bytes = cursor.read_bytes(topic_len)?;
        let topic_str = std::str::from_utf8(topic_bytes).map_err(|_| MailError::Corruption)?;
        let topic = Topic::new(topic_str).map_err(|_| MailError::Corruption)?;

        let sequence_number = cursor.read_u64()?;

        let envelope = match cursor.read_u8()? {
            0 => None,
            1 => {
                let len = cursor.read_u32()? as usize;
                if len > MAX_ENVELOPE_SIZE {
                    return Err(MailError::Corruption);
                }
                Some(cursor.read_bytes(len)?.to_vec())
            }
            _ => return Err(MailError::Corruption),
        };

        let key_derivation = match cursor.read_u8()? {
            0 => None,
            1 => {
                let mut cpu_svn = [0u8; CPU_SVN_SIZE];
                cpu_svn.copy_from_slice(cursor.read_bytes(CPU_SVN_SIZE)?);
                let isv_svn = cursor.read_u16()?;
                Some(KeyDerivation { cpu_svn, isv_svn })
            }
            _ => return Err(MailError::Corruption),
        };

        let ephemeral_public = X25519PublicKey::from_bytes(cursor.read_bytes(32)?)
            .map_err(|_| MailError::Corruption)?;

        Ok(Self {
            topic,
            sequence_number,
            envelope,
            key_derivation,
            ephemeral_public,
            header_len: cursor.position(),
        })
    }

    /// The topic this mail belongs to.
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// The sender-assigned sequence number.
    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    /// The caller-supplied envelope metadata, if any.
    pub fn envelope(&self) -> Option<&[u8]> {
        self.envelope.as_deref()
    }

    /// The key-derivation descriptor, present when the mail targets a
    /// hardware-derived key.
    pub fn key_derivation(&self) -> Option<&KeyDerivation> {
        self.key_derivation.as_ref()
    }

    fn header_bytes<'a>(&self, blob: &'a [u8]) -> &'a [u8] {
        &blob[..self.header_len]
    }
}

/// A mutable mail under construction by a sender.
///
/// Becomes an immutable encrypted blob via [`MutableMail::encrypt`].
#[derive(Debug)]
pub struct MutableMail {
    body: Vec<u8>,
    topic: Topic,
    sequence_number: u64,
    envelope: Option<Vec<u8>>,
    key_derivation: Option<KeyDerivation>,
    size_policy: SizePolicy,
}

impl MutableMail {
    /// Create a mail with the default topic and sequence number 0.
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            topic: Topic::default(),
            sequence_number: 0,
            envelope: None,
            key_derivation: None,
            size_policy: SizePolicy::None,
        }
    }

    /// Replace the body.
    pub fn set_body(&mut self, body: Vec<u8>) {
        self.body = body;
    }

    /// Set the topic.
    pub fn set_topic(&mut self, topic: Topic) {
        self.topic = topic;
    }

    /// Set the sequence number.
    ///
    /// The post office seeds this automatically; overriding it breaks the
    /// gap-free guarantee unless the caller takes over sequencing entirely.
    pub fn set_sequence_number(&mut self, sequence_number: u64) {
        self.sequence_number = sequence_number;
    }

    /// Attach envelope metadata, readable by the host before decryption and
    /// authenticated after it.
    pub fn set_envelope(&mut self, envelope: Option<Vec<u8>>) {
        self.envelope = envelope;
    }

    /// Stamp the key-derivation descriptor of the destination.
    pub fn set_key_derivation(&mut self, key_derivation: Option<KeyDerivation>) {
        self.key_derivation = key_derivation;
    }

    /// Set the minimum-size policy applied at encryption time.
    pub fn set_size_policy(&mut self, policy: SizePolicy) {
        self.size_policy = policy;
    }

    /// The current sequence number.
    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    /// The current topic.
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Encrypt this mail for `recipient`.
    ///
    /// Each call draws a fresh ephemeral key and nonce: encrypting the same
    /// content twice yields different blobs. If the size policy demands it,
    /// random padding is added inside the sealed body until the encrypted
    /// blob reaches the policy minimum.
    ///
    /// # Errors
    ///
    /// Returns `MailError::TooLarge` if body or envelope exceed the wire
    /// limits, or a crypto error if sealing fails.
    pub fn encrypt(&self, sender: &SenderKeys, recipient: &X25519PublicKey) -> Result<Vec<u8>> {
        if self.body.len() > MAX_BODY_SIZE {
            return Err(MailError::TooLarge {
                field: "body",
                actual: self.body.len(),
                max: MAX_BODY_SIZE,
            });
        }
        if let Some(envelope) = &self.envelope {
            if envelope.len() > MAX_ENVELOPE_SIZE {
                return Err(MailError::TooLarge {
                    field: "envelope",
                    actual: envelope.len(),
                    max: MAX_ENVELOPE_SIZE,
                });
            }
        }

        // Fresh ephemeral pair per mail: forward secrecy plus uniqueness
        let ephemeral = X25519EphemeralKeyPair::generate();
        let header = self.encode_header(ephemeral.public_key());

        // Agree the AEAD key with the recipient's static key
        let shared = ephemeral.diffie_hellman(recipient);
        let key = SymmetricKey::from_bytes(&shared.derive_key(MAIL_KEY_CONTEXT))?;

        // Sender commitment: signature over header, identity key, and body
        let sender_public = sender.public_key();
        let digest = Hash256::hash_many(&[
            MAIL_SIG_CONTEXT,
            &header,
            sender_public.as_bytes(),
            &self.body,
        ]);
        let signature = sender.signing.sign(digest.as_bytes());

        let plaintext_len = self.padded_plaintext_len(header.len());
        let mut plaintext = Vec::with_capacity(plaintext_len);
        plaintext.extend_from_slice(sender_public.as_bytes());
        plaintext.extend_from_slice(sender.signing_public_key().as_bytes());
        plaintext.extend_from_slice(signature.as_bytes());
        plaintext.extend_from_slice(&(self.body.len() as u32).to_be_bytes());
        plaintext.extend_from_slice(&self.body);

        let padding_len = plaintext_len - plaintext.len();
        if padding_len > 0 {
            let mut padding = vec![0u8; padding_len];
            OsRng.fill_bytes(&mut padding);
            plaintext.extend_from_slice(&padding);
        }

        let sealed = encrypt_with_aad(&key, &plaintext, &header)?;
        self.size_policy.observe(self.body.len());

        let mut blob = Vec::with_capacity(header.len() + sealed.len());
        blob.extend_from_slice(&header);
        blob.extend_from_slice(sealed.nonce.as_bytes());
        blob.extend_from_slice(&sealed.ciphertext);
        Ok(blob)
    }

    fn encode_header(&self, ephemeral_public: &X25519PublicKey) -> Vec<u8> {
        let topic = self.topic.as_str().as_bytes();
        let mut header = Vec::with_capacity(64 + topic.len());
        header.push(WIRE_VERSION);
        header.extend_from_slice(&(topic.len() as u16).to_be_bytes());
        header.extend_from_slice(topic);
        header.extend_from_slice(&self.sequence_number.to_be_bytes());
        match &self.envelope {
            None => header.push(0),
            Some(envelope) => {
                header.push(1);
                header.extend_from_slice(&(envelope.len() as u32).to_be_bytes());
                header.extend_from_slice(envelope);
            }
        }
        match &self.key_derivation {
            None => header.push(0),
            Some(kd) => {
                header.push(1);
                header.extend_from_slice(&kd.cpu_svn);
                header.extend_from_slice(&kd.isv_svn.to_be_bytes());
            }
        }
        header.extend_from_slice(ephemeral_public.as_bytes());
        header
    }

    /// Sealed plaintext length after applying the size policy: the policy
    /// bounds the whole encrypted blob, so subtract the fixed overhead.
    fn padded_plaintext_len(&self, header_len: usize) -> usize {
        let base = SEALED_PREFIX_SIZE + 4 + self.body.len();
        let overhead = header_len + NONCE_SIZE + TAG_SIZE;
        let min_plaintext = self.size_policy.min_size().saturating_sub(overhead);
        base.max(min_plaintext)
    }
}

/// A received, decrypted mail. Immutable.
#[derive(Debug)]
pub struct Mail {
    body: Vec<u8>,
    topic: Topic,
    sequence_number: u64,
    envelope: Option<Vec<u8>>,
    key_derivation: Option<KeyDerivation>,
    authenticated_sender: X25519PublicKey,
    sender_signing_key: SigningPublicKey,
}

impl Mail {
    /// Decrypt an encrypted mail with a known private key.
    ///
    /// # Errors
    ///
    /// Returns `MailError::Corruption` if any part of the blob fails
    /// authentication - a single flipped bit anywhere is enough.
    pub fn decrypt(blob: &[u8], private_key: &X25519StaticPrivateKey) -> Result<Self> {
        Self::decrypt_with_lookup(blob, |_| Ok(None), Some(private_key))
    }

    /// Decrypt an encrypted mail, re-deriving the private key from the
    /// header's key-derivation descriptor when one is present.
    ///
    /// The lookup is handed the descriptor (or `None` for plain-key mail)
    /// and returns the matching private key; errors it produces - for
    /// example a hardware refusal for a rolled-back security version -
    /// propagate verbatim.
    pub fn decrypt_with(
        blob: &[u8],
        mut key_lookup: impl FnMut(Option<&KeyDerivation>) -> Result<X25519StaticPrivateKey>,
    ) -> Result<Self> {
        Self::decrypt_with_lookup(blob, |kd| key_lookup(kd).map(Some), None)
    }

    fn decrypt_with_lookup(
        blob: &[u8],
        mut key_lookup: impl FnMut(Option<&KeyDerivation>) -> Result<Option<X25519StaticPrivateKey>>,
        fixed_key: Option<&X25519StaticPrivateKey>,
    ) -> Result<Self> {
        let header = MailHeader::from_bytes(blob)?;
        let header_bytes = header.header_bytes(blob);

        let sealed = &blob[header.header_len..];
        if sealed.len() < NONCE_SIZE + TAG_SIZE + SEALED_PREFIX_SIZE + 4 {
            return Err(MailError::Corruption);
        }
        let nonce = Nonce::from_bytes(&sealed[..NONCE_SIZE]).map_err(|_| MailError::Corruption)?;
        let ciphertext = sealed[NONCE_SIZE..].to_vec();

        let derived_key = key_lookup(header.key_derivation())?;
        let private_key = match (&derived_key, fixed_key) {
            (Some(key), _) => key,
            (None, Some(key)) => key,
            (None, None) => return Err(MailError::Corruption),
        };

        let shared = private_key.diffie_hellman(&header.ephemeral_public);
        let key = SymmetricKey::from_bytes(&shared.derive_key(MAIL_KEY_CONTEXT))
            .map_err(|_| MailError::Corruption)?;

        let plaintext = decrypt_with_aad(&key, &EncryptedData { nonce, ciphertext }, header_bytes)
            .map_err(|_| MailError::Corruption)?;

        let mut cursor = Cursor::new(&plaintext);
        let authenticated_sender = X25519PublicKey::from_bytes(cursor.read_bytes(32)?)
            .map_err(|_| MailError::Corruption)?;
        let sender_signing_key = SigningPublicKey::from_bytes(cursor.read_bytes(32)?)
            .map_err(|_| MailError::Corruption)?;
        let signature =
            Signature::from_bytes(cursor.read_bytes(64)?).map_err(|_| MailError::Corruption)?;
        let body_len = cursor.read_u32()? as usize;
        let body = cursor.read_bytes(body_len)?.to_vec();
        // Anything after the body is padding; ignored

        // Verify the sender commitment before trusting any of it
        let digest = Hash256::hash_many(&[
            MAIL_SIG_CONTEXT,
            header_bytes,
            authenticated_sender.as_bytes(),
            &body,
        ]);
        sender_signing_key
            .verify(digest.as_bytes(), &signature)
            .map_err(|_| MailError::Corruption)?;

        Ok(Self {
            body,
            topic: header.topic,
            sequence_number: header.sequence_number,
            envelope: header.envelope,
            key_derivation: header.key_derivation,
            authenticated_sender,
            sender_signing_key,
        })
    }

    /// The decrypted message body.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The topic, now authenticated.
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// The sequence number, now authenticated.
    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    /// The envelope metadata, now authenticated.
    pub fn envelope(&self) -> Option<&[u8]> {
        self.envelope.as_deref()
    }

    /// The key-derivation descriptor the mail was encrypted under.
    pub fn key_derivation(&self) -> Option<&KeyDerivation> {
        self.key_derivation.as_ref()
    }

    /// The sender's public key, cryptographically proven by the sealed
    /// commitment. Only meaningful because decryption succeeded.
    pub fn authenticated_sender(&self) -> &X25519PublicKey {
        &self.authenticated_sender
    }

    /// The sender's signing public key from the sealed commitment.
    pub fn sender_signing_key(&self) -> &SigningPublicKey {
        &self.sender_signing_key
    }
}

/// Byte-cursor over a mail blob; every short read is a corruption.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or(MailError::Corruption)?;
        if end > self.data.len() {
            return Err(MailError::Corruption);
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_u64(&mut self) -> Result<u64> {
        let bytes = self.read_bytes(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(arr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recipient() -> X25519StaticPrivateKey {
        X25519StaticPrivateKey::from_seed([0xA5u8; 32])
    }

    fn sample_mail() -> MutableMail {
        let mut mail = MutableMail::new(b"the quick brown fox".to_vec());
        mail.set_topic(Topic::new("orders").unwrap());
        mail.set_sequence_number(7);
        mail.set_envelope(Some(b"routing-meta".to_vec()));
        mail
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let sender = SenderKeys::generate();
        let recipient = recipient();
        let mail = sample_mail();

        let blob = mail.encrypt(&sender, &recipient.public_key()).unwrap();
        let decrypted = Mail::decrypt(&blob, &recipient).unwrap();

        assert_eq!(decrypted.body(), b"the quick brown fox");
        assert_eq!(decrypted.topic().as_str(), "orders");
        assert_eq!(decrypted.sequence_number(), 7);
        assert_eq!(decrypted.envelope(), Some(b"routing-meta".as_slice()));
        assert_eq!(decrypted.authenticated_sender(), &sender.public_key());
        assert_eq!(
            decrypted.sender_signing_key(),
            sender.signing_public_key()
        );
    }

    #[test]
    fn test_repeated_encryption_differs() {
        let sender = SenderKeys::generate();
        let recipient = recipient();
        let mail = sample_mail();

        let blob1 = mail.encrypt(&sender, &recipient.public_key()).unwrap();
        let blob2 = mail.encrypt(&sender, &recipient.public_key()).unwrap();
        assert_ne!(blob1, blob2);

        // Both still decrypt to the same content
        let m1 = Mail::decrypt(&blob1, &recipient).unwrap();
        let m2 = Mail::decrypt(&blob2, &recipient).unwrap();
        assert_eq!(m1.body(), m2.body());
    }

    #[test]
    fn test_header_parse_without_key() {
        let sender = SenderKeys::generate();
        let recipient = recipient();
        let mail = sample_mail();

        let blob = mail.encrypt(&sender, &recipient.public_key()).unwrap();
        let header = MailHeader::from_bytes(&blob).unwrap();

        assert_eq!(header.topic().as_str(), "orders");
        assert_eq!(header.sequence_number(), 7);
        assert_eq!(header.envelope(), Some(b"routing-meta".as_slice()));
        assert!(header.key_derivation().is_none());
    }

    #[test]
    fn test_key_derivation_descriptor_roundtrip() {
        let sender = SenderKeys::generate();
        let recipient = recipient();
        let kd = KeyDerivation {
            cpu_svn: [3u8; CPU_SVN_SIZE],
            isv_svn: 12,
        };

        let mut mail = MutableMail::new(b"payload".to_vec());
        mail.set_key_derivation(Some(kd));
        let blob = mail.encrypt(&sender, &recipient.public_key()).unwrap();

        assert_eq!(MailHeader::from_bytes(&blob).unwrap().key_derivation(), Some(&kd));

        let decrypted = Mail::decrypt_with(&blob, |descriptor| {
            assert_eq!(descriptor, Some(&kd));
            Ok(X25519StaticPrivateKey::from_seed([0xA5u8; 32]))
        })
        .unwrap();
        assert_eq!(decrypted.key_derivation(), Some(&kd));
    }

    #[test]
    fn test_wrong_key_is_corruption() {
        let sender = SenderKeys::generate();
        let recipient = recipient();
        let blob = sample_mail()
            .encrypt(&sender, &recipient.public_key())
            .unwrap();

        let wrong = X25519StaticPrivateKey::from_seed([0x11u8; 32]);
        assert!(matches!(
            Mail::decrypt(&blob, &wrong),
            Err(MailError::Corruption)
        ));
    }

    #[test]
    fn test_every_byte_flip_is_corruption() {
        let sender = SenderKeys::generate();
        let recipient = recipient();
        let mut blob = sample_mail()
            .encrypt(&sender, &recipient.public_key())
            .unwrap();

        for i in 0..blob.len() {
            blob[i] ^= 0x01;
            assert!(
                matches!(Mail::decrypt(&blob, &recipient), Err(MailError::Corruption)),
                "flip at byte {} did not fail as corruption",
                i
            );
            blob[i] ^= 0x01;
        }

        // Reverting every flip restores a decryptable blob
        assert!(Mail::decrypt(&blob, &recipient).is_ok());
    }

    #[test]
    fn test_min_size_policy_pads_ciphertext() {
        let sender = SenderKeys::generate();
        let recipient = recipient();

        let mut mail = MutableMail::new(b"tiny".to_vec());
        mail.set_size_policy(SizePolicy::Fixed(10240));
        let blob = mail.encrypt(&sender, &recipient.public_key()).unwrap();
        assert!(blob.len() >= 10240);

        // Padding is invisible after decryption
        let decrypted = Mail::decrypt(&blob, &recipient).unwrap();
        assert_eq!(decrypted.body(), b"tiny");
    }

    #[test]
    fn test_bodies_below_minimum_encrypt_to_same_length() {
        let sender = SenderKeys::generate();
        let recipient = recipient();

        let mut small = MutableMail::new(vec![1u8; 10]);
        small.set_size_policy(SizePolicy::Fixed(4096));
        let mut medium = MutableMail::new(vec![2u8; 1000]);
        medium.set_size_policy(SizePolicy::Fixed(4096));

        let blob_small = small.encrypt(&sender, &recipient.public_key()).unwrap();
        let blob_medium = medium.encrypt(&sender, &recipient.public_key()).unwrap();
        assert_eq!(blob_small.len(), blob_medium.len());
    }

    #[test]
    fn test_empty_body() {
        let sender = SenderKeys::generate();
        let recipient = recipient();
        let mail = MutableMail::new(Vec::new());

        let blob = mail.encrypt(&sender, &recipient.public_key()).unwrap();
        let decrypted = Mail::decrypt(&blob, &recipient).unwrap();
        assert!(decrypted.body().is_empty());
    }

    #[test]
    fn test_envelope_too_large_rejected() {
        let sender = SenderKeys::generate();
        let recipient = recipient();
        let mut mail = MutableMail::new(b"x".to_vec());
        mail.set_envelope(Some(vec![0u8; MAX_ENVELOPE_SIZE + 1]));

        assert!(matches!(
            mail.encrypt(&sender, &recipient.public_key()),
            Err(MailError::TooLarge {
                field: "envelope",
                ..
            })
        ));
    }

    #[test]
    fn test_truncated_blob_is_corruption() {
        let sender = SenderKeys::generate();
        let recipient = recipient();
        let blob = sample_mail()
            .encrypt(&sender, &recipient.public_key())
            .unwrap();

        for len in [0, 1, 10, blob.len() / 2, blob.len() - 1] {
            assert!(matches!(
                Mail::decrypt(&blob[..len], &recipient),
                Err(MailError::Corruption)
            ));
        }
    }
}
