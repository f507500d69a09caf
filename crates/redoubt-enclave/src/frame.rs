//! The host/enclave frame codec.
//!
//! Every message crossing the enclave boundary is one frame:
//!
//! ```text
//! +------------------------------+
//! | thread id        | 8 bytes BE|
//! | frame type       | 1 byte    |
//! | payload          | variable  |
//! +------------------------------+
//! ```
//!
//! Frame types: `0` CALL, `1` CALL_RETURN, `2` MAIL_DELIVERY,
//! `3` ATTESTATION. Payload layouts differ by direction, so the codec is
//! split into [`InboundFrame`] (host to enclave) and [`OutboundFrame`]
//! (enclave to host).
//!
//! A CALL_RETURN payload starts with a presence byte; `0` encodes the
//! terminating (absent) response a host handler may choose to give.
//! Inbound MAIL_DELIVERY carries `[mail id: 8][hint length: 4][hint]
//! [encrypted mail]`; outbound mail commands carry a subtype byte,
//! `0` POST (`[hint length: 4][hint][encrypted mail]`) or
//! `1` ACKNOWLEDGE (`[mail id: 8]`). Attestation payloads also start with
//! a subtype byte: `0` public-keys announcement, `1` attestation request,
//! `2` attestation evidence.

use crate::attestation::AttestationEvidence;
use crate::error::{EnclaveError, Result};

const FRAME_TYPE_CALL: u8 = 0;
const FRAME_TYPE_CALL_RETURN: u8 = 1;
const FRAME_TYPE_MAIL_DELIVERY: u8 = 2;
const FRAME_TYPE_ATTESTATION: u8 = 3;

const MAIL_SUBTYPE_POST: u8 = 0;
const MAIL_SUBTYPE_ACKNOWLEDGE: u8 = 1;

const ATTESTATION_SUBTYPE_KEYS: u8 = 0;
const ATTESTATION_SUBTYPE_REQUEST: u8 = 1;
const ATTESTATION_SUBTYPE_EVIDENCE: u8 = 2;

/// A frame the host sends into the enclave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// Invoke the enclave, or the callback of an in-flight host call.
    Call {
        /// The host thread this call runs on.
        thread_id: u64,
        /// Opaque application bytes.
        payload: Vec<u8>,
    },
    /// Resolve the enclave's outstanding call to the host. `None` is the
    /// terminating response.
    CallReturn {
        /// The host thread the original call ran on.
        thread_id: u64,
        /// The host's return value, if any.
        payload: Option<Vec<u8>>,
    },
    /// Deliver an encrypted mail to the enclave.
    MailDelivery {
        /// The host thread delivering the mail.
        thread_id: u64,
        /// Host-assigned id the enclave uses to acknowledge this mail.
        mail_id: u64,
        /// Optional routing hint, empty when absent.
        routing_hint: String,
        /// The encrypted mail blob.
        mail: Vec<u8>,
    },
    /// Attestation evidence from the host's attestation service.
    AttestationEvidence {
        /// The host thread running the handshake.
        thread_id: u64,
        /// The evidence bundle.
        evidence: AttestationEvidence,
    },
}

impl InboundFrame {
    /// Decode a frame received from the host.
    ///
    /// # Errors
    ///
    /// Returns [`EnclaveError::Protocol`] for truncated or unknown frames.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);
        let thread_id = reader.read_u64()?;
        match reader.read_u8()? {
            FRAME_TYPE_CALL => Ok(InboundFrame::Call {
                thread_id,
                payload: reader.rest().to_vec(),
            }),
            FRAME_TYPE_CALL_RETURN => {
                let payload = match reader.read_u8()? {
                    0 => None,
                    1 => Some(reader.rest().to_vec()),
                    other => {
                        return Err(EnclaveError::Protocol(format!(
                            "bad call-return presence byte {other}"
                        )))
                    }
                };
                Ok(InboundFrame::CallReturn { thread_id, payload })
            }
            FRAME_TYPE_MAIL_DELIVERY => {
                let mail_id = reader.read_u64()?;
                let hint_len = reader.read_u32()? as usize;
                let routing_hint = String::from_utf8(reader.read_bytes(hint_len)?.to_vec())
                    .map_err(|_| {
                        EnclaveError::Protocol("routing hint is not valid UTF-8".to_string())
                    })?;
                Ok(InboundFrame::MailDelivery {
                    thread_id,
                    mail_id,
                    routing_hint,
                    mail: reader.rest().to_vec(),
                })
            }
            FRAME_TYPE_ATTESTATION => match reader.read_u8()? {
                ATTESTATION_SUBTYPE_EVIDENCE => Ok(InboundFrame::AttestationEvidence {
                    thread_id,
                    evidence: AttestationEvidence::from_bytes(reader.rest())?,
                }),
                other => Err(EnclaveError::Protocol(format!(
                    "unexpected inbound attestation subtype {other}"
                ))),
            },
            other => Err(EnclaveError::Protocol(format!(
                "unknown frame type {other}"
            ))),
        }
    }
}

/// A frame the enclave sends out to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// Call back into the untrusted host.
    Call {
        /// The host thread the enclosing entry runs on.
        thread_id: u64,
        /// Opaque application bytes.
        payload: Vec<u8>,
    },
    /// Return value of a host call into the enclave. `None` terminates the
    /// call without a value.
    CallReturn {
        /// The host thread the call runs on.
        thread_id: u64,
        /// The enclave's return value, if any.
        payload: Option<Vec<u8>>,
    },
    /// Ask the host to deliver an encrypted mail.
    MailPost {
        /// The host thread the enclosing entry runs on.
        thread_id: u64,
        /// Routing hint for the host, empty when absent.
        routing_hint: String,
        /// The encrypted mail blob.
        mail: Vec<u8>,
    },
    /// Tell the host a delivered mail has been processed and can be
    /// dropped from redelivery queues.
    MailAcknowledge {
        /// The host thread the enclosing entry runs on.
        thread_id: u64,
        /// The host-assigned id of the processed mail.
        mail_id: u64,
    },
    /// Announce the enclave's public keys, sent once at startup.
    AttestationKeys {
        /// Admin thread id, conventionally 0.
        thread_id: u64,
        /// The serialized key announcement.
        announcement: Vec<u8>,
    },
    /// Ask the host to obtain attestation evidence for a report.
    AttestationRequest {
        /// Admin thread id, conventionally 0.
        thread_id: u64,
        /// The hardware report to attest.
        report: Vec<u8>,
    },
}

impl OutboundFrame {
    /// Encode this frame for the host.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            OutboundFrame::Call { thread_id, payload } => {
                let mut out = frame_prefix(*thread_id, FRAME_TYPE_CALL, payload.len());
                out.extend_from_slice(payload);
                out
            }
            OutboundFrame::CallReturn { thread_id, payload } => {
                let len = payload.as_ref().map_or(0, Vec::len);
                let mut out = frame_prefix(*thread_id, FRAME_TYPE_CALL_RETURN, 1 + len);
                match payload {
                    None => out.push(0),
                    Some(payload) => {
                        out.push(1);
                        out.extend_from_slice(payload);
                    }
                }
                out
            }
            OutboundFrame::MailPost {
                thread_id,
                routing_hint,
                mail,
            } => {
                let hint = routing_hint.as_bytes();
                let mut out = frame_prefix(
                    *thread_id,
                    FRAME_TYPE_MAIL_DELIVERY,
                    1 + 4 + hint.len() + mail.len(),
                );
                out.push(MAIL_SUBTYPE_POST);
                out.extend_from_slice(&(hint.len() as u32).to_be_bytes());
                out.extend_from_slice(hint);
                out.extend_from_slice(mail);
                out
            }
            OutboundFrame::MailAcknowledge { thread_id, mail_id } => {
                let mut out = frame_prefix(*thread_id, FRAME_TYPE_MAIL_DELIVERY, 1 + 8);
                out.push(MAIL_SUBTYPE_ACKNOWLEDGE);
                out.extend_from_slice(&mail_id.to_be_bytes());
                out
            }
            OutboundFrame::AttestationKeys {
                thread_id,
                announcement,
            } => {
                let mut out =
                    frame_prefix(*thread_id, FRAME_TYPE_ATTESTATION, 1 + announcement.len());
                out.push(ATTESTATION_SUBTYPE_KEYS);
                out.extend_from_slice(announcement);
                out
            }
            OutboundFrame::AttestationRequest { thread_id, report } => {
                let mut out = frame_prefix(*thread_id, FRAME_TYPE_ATTESTATION, 1 + report.len());
                out.push(ATTESTATION_SUBTYPE_REQUEST);
                out.extend_from_slice(report);
                out
            }
        }
    }

    /// Decode a frame the enclave emitted. Host-side helper, used by the
    /// mock hosts in tests and by host runtimes routing enclave output.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);
        let thread_id = reader.read_u64()?;
        match reader.read_u8()? {
            FRAME_TYPE_CALL => Ok(OutboundFrame::Call {
                thread_id,
                payload: reader.rest().to_vec(),
            }),
            FRAME_TYPE_CALL_RETURN => {
                let payload = match reader.read_u8()? {
                    0 => None,
                    1 => Some(reader.rest().to_vec()),
                    other => {
                        return Err(EnclaveError::Protocol(format!(
                            "bad call-return presence byte {other}"
                        )))
                    }
                };
                Ok(OutboundFrame::CallReturn { thread_id, payload })
            }
            FRAME_TYPE_MAIL_DELIVERY => match reader.read_u8()? {
                MAIL_SUBTYPE_POST => {
                    let hint_len = reader.read_u32()? as usize;
                    let routing_hint = String::from_utf8(reader.read_bytes(hint_len)?.to_vec())
                        .map_err(|_| {
                            EnclaveError::Protocol("routing hint is not valid UTF-8".to_string())
                        })?;
                    Ok(OutboundFrame::MailPost {
                        thread_id,
                        routing_hint,
                        mail: reader.rest().to_vec(),
                    })
                }
                MAIL_SUBTYPE_ACKNOWLEDGE => Ok(OutboundFrame::MailAcknowledge {
                    thread_id,
                    mail_id: reader.read_u64()?,
                }),
                other => Err(EnclaveError::Protocol(format!(
                    "unknown mail command subtype {other}"
                ))),
            },
            FRAME_TYPE_ATTESTATION => match reader.read_u8()? {
                ATTESTATION_SUBTYPE_KEYS => Ok(OutboundFrame::AttestationKeys {
                    thread_id,
                    announcement: reader.rest().to_vec(),
                }),
                ATTESTATION_SUBTYPE_REQUEST => Ok(OutboundFrame::AttestationRequest {
                    thread_id,
                    report: reader.rest().to_vec(),
                }),
                other => Err(EnclaveError::Protocol(format!(
                    "unexpected outbound attestation subtype {other}"
                ))),
            },
            other => Err(EnclaveError::Protocol(format!(
                "unknown frame type {other}"
            ))),
        }
    }
}

fn frame_prefix(thread_id: u64, frame_type: u8, payload_len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + 1 + payload_len);
    out.extend_from_slice(&thread_id.to_be_bytes());
    out.push(frame_type);
    out
}

/// Encode an inbound frame. Host-side helper for tests and host runtimes.
pub fn encode_inbound(frame: &InboundFrame) -> Vec<u8> {
    match frame {
        InboundFrame::Call { thread_id, payload } => {
            let mut out = frame_prefix(*thread_id, FRAME_TYPE_CALL, payload.len());
            out.extend_from_slice(payload);
            out
        }
        InboundFrame::CallReturn { thread_id, payload } => {
            let len = payload.as_ref().map_or(0, Vec::len);
            let mut out = frame_prefix(*thread_id, FRAME_TYPE_CALL_RETURN, 1 + len);
            match payload {
                None => out.push(0),
                Some(payload) => {
                    out.push(1);
                    out.extend_from_slice(payload);
                }
            }
            out
        }
        InboundFrame::MailDelivery {
            thread_id,
            mail_id,
            routing_hint,
            mail,
        } => {
            let hint = routing_hint.as_bytes();
            let mut out = frame_prefix(
                *thread_id,
                FRAME_TYPE_MAIL_DELIVERY,
                8 + 4 + hint.len() + mail.len(),
            );
            out.extend_from_slice(&mail_id.to_be_bytes());
            out.extend_from_slice(&(hint.len() as u32).to_be_bytes());
            out.extend_from_slice(hint);
            out.extend_from_slice(mail);
            out
        }
        InboundFrame::AttestationEvidence {
            thread_id,
            evidence,
        } => {
            let evidence_bytes = evidence.to_bytes();
            let mut out = frame_prefix(*thread_id, FRAME_TYPE_ATTESTATION, 1 + evidence_bytes.len());
            out.push(ATTESTATION_SUBTYPE_EVIDENCE);
            out.extend_from_slice(&evidence_bytes);
            out
        }
    }
}

/// Byte reader over a frame; short reads are protocol violations.
pub(crate) struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| EnclaveError::Protocol("truncated frame".to_string()))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub(crate) fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub(crate) fn read_u64(&mut self) -> Result<u64> {
        let bytes = self.read_bytes(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(arr))
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub(crate) fn rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.pos..];
        self.pos = self.data.len();
        slice
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn inbound_mail_delivery_roundtrips(
            thread_id in any::<u64>(),
            mail_id in any::<u64>(),
            routing_hint in "[a-z0-9./-]{0,64}",
            mail in proptest::collection::vec(any::<u8>(), 0..1024),
        ) {
            let frame = InboundFrame::MailDelivery {
                thread_id,
                mail_id,
                routing_hint,
                mail,
            };
            prop_assert_eq!(InboundFrame::decode(&encode_inbound(&frame)).unwrap(), frame);
        }

        #[test]
        fn decode_never_panics_on_junk(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = InboundFrame::decode(&bytes);
            let _ = OutboundFrame::decode(&bytes);
        }
    }
}
