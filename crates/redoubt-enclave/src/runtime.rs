//! The enclave runtime: frame dispatch, mail decryption, and the
//! application-facing [`Enclave`] trait.
//!
//! The runtime owns the enclave's derived identity, the per-thread call
//! multiplexer, the receive-side sequence watermarks, and the send-side
//! post office cache. The host drives it one frame at a time through
//! [`EnclaveRuntime::receive_frame`]; everything the enclave produces goes
//! back out through the [`HostSender`].
//!
//! Mail commands an entry produces (posts and the acknowledgement of the
//! delivered mail) are queued and only sent once the handler has returned,
//! so the host observes a handler's posts and its acknowledgement
//! together: a redelivery after a crash replays the whole entry or none
//! of it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use redoubt_crypto::X25519PublicKey;
use redoubt_mail::{
    KeyDerivation, Mail, MailHeader, PostOffice, SequenceWatermarks, SizePolicy, Topic,
};

use crate::attestation::{key_binding_report_data, AttestationHandshake, KeyAnnouncement};
use crate::error::{EnclaveError, Result};
use crate::frame::{InboundFrame, OutboundFrame};
use crate::hardware::EnclaveEnvironment;
use crate::instance_info::EnclaveInstanceInfo;
use crate::keys::{derive_exchange_key, KeyMaterial};
use crate::multiplexer::{CallCallback, CallDispatch, HostSender, Multiplexer};

/// Default cap on concurrent host entries, matching the thread budget a
/// hardware enclave is typically built with.
pub const DEFAULT_MAX_CONCURRENT_ENTRIES: usize = 64;

/// Thread id used for administrative frames (attestation traffic).
const ADMIN_THREAD_ID: u64 = 0;

/// Application code hosted by the runtime.
///
/// Both entry points default to refusing the call, so an enclave only
/// implements the surfaces it actually serves. Handlers run under an
/// enclave-wide lock unless [`Enclave::thread_safe`] opts out.
pub trait Enclave: Send + Sync {
    /// Handle an unencrypted call from the untrusted host.
    ///
    /// Anything received here is attacker-controlled; only mail contents
    /// are authenticated.
    fn receive_from_untrusted_host(
        &self,
        context: &mut CallContext<'_>,
        bytes: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        let _ = (context, bytes);
        Err(EnclaveError::Unsupported("receive_from_untrusted_host"))
    }

    /// Handle a decrypted, watermark-checked mail.
    ///
    /// Returning `Ok` acknowledges the mail to the host; returning an
    /// error leaves it unacknowledged for redelivery.
    fn receive_mail(
        &self,
        context: &mut CallContext<'_>,
        mail: Mail,
        routing_hint: Option<&str>,
    ) -> Result<()> {
        let _ = (context, mail, routing_hint);
        Err(EnclaveError::Unsupported("receive_mail"))
    }

    /// Whether the enclave handles its own synchronization. When `false`
    /// (the default) the runtime serializes all handler invocations.
    fn thread_safe(&self) -> bool {
        false
    }
}

/// The per-entry capabilities handed to [`Enclave`] handlers.
pub struct CallContext<'a> {
    thread_id: u64,
    services: &'a RuntimeServices,
    outbound: Vec<OutboundFrame>,
}

impl CallContext<'_> {
    /// The host thread id this entry runs on.
    pub fn thread_id(&self) -> u64 {
        self.thread_id
    }

    /// Call back into the untrusted host and wait for its answer.
    pub fn call_untrusted_host(&self, payload: Vec<u8>) -> Result<Option<Vec<u8>>> {
        self.services
            .mux
            .call_untrusted_host(self.thread_id, payload, None)
    }

    /// Like [`CallContext::call_untrusted_host`], but the host may
    /// re-enter the enclave through `callback` while handling the call.
    pub fn call_untrusted_host_with(
        &self,
        payload: Vec<u8>,
        callback: Arc<CallCallback>,
    ) -> Result<Option<Vec<u8>>> {
        self.services
            .mux
            .call_untrusted_host(self.thread_id, payload, Some(callback))
    }

    /// The post office for a (destination, topic) pair, created on first
    /// use. Repeated lookups return the same sequencer, which is what
    /// keeps its streams gap-free.
    pub fn post_office(
        &self,
        destination: X25519PublicKey,
        topic: Topic,
        destination_key_derivation: Option<KeyDerivation>,
    ) -> Arc<PostOffice> {
        self.services
            .post_office(destination, topic, destination_key_derivation)
    }

    /// Encrypt a mail through `post_office` and queue it for the host.
    ///
    /// The mail is handed to the host only once this entry returns, never
    /// in the middle of the handler.
    pub fn post_mail(
        &mut self,
        post_office: &PostOffice,
        body: Vec<u8>,
        envelope: Option<Vec<u8>>,
        routing_hint: &str,
    ) -> Result<()> {
        let mail = post_office.encrypt_mail(body, envelope)?;
        self.outbound.push(OutboundFrame::MailPost {
            thread_id: self.thread_id,
            routing_hint: routing_hint.to_string(),
            mail,
        });
        Ok(())
    }
}

/// Shared state behind every entry: identity, transport, sequencing.
struct RuntimeServices {
    env: Arc<dyn EnclaveEnvironment>,
    keys: KeyMaterial,
    mux: Multiplexer,
    handshake: AttestationHandshake,
    watermarks: SequenceWatermarks,
    post_offices: Mutex<HashMap<(X25519PublicKey, Topic), Arc<PostOffice>>>,
    size_policy: SizePolicy,
}

impl RuntimeServices {
    fn post_office(
        &self,
        destination: X25519PublicKey,
        topic: Topic,
        destination_key_derivation: Option<KeyDerivation>,
    ) -> Arc<PostOffice> {
        let mut cache = self.post_offices.lock().expect("post office lock poisoned");
        Arc::clone(
            cache
                .entry((destination.clone(), topic.clone()))
                .or_insert_with(|| {
                    let mut office = PostOffice::new(
                        Arc::clone(self.keys.sender_keys()),
                        destination,
                        topic,
                        destination_key_derivation,
                    );
                    office.set_size_policy(self.size_policy.clone());
                    Arc::new(office)
                }),
        )
    }
}

/// Hosts one [`Enclave`] behind the frame protocol.
pub struct EnclaveRuntime<E> {
    enclave: E,
    services: RuntimeServices,
    handler_lock: Mutex<()>,
    entries: AtomicUsize,
    max_entries: usize,
}

impl<E: Enclave> EnclaveRuntime<E> {
    /// Create a runtime, deriving the enclave's identity from the
    /// platform's current security versions.
    pub fn new(
        enclave: E,
        env: Arc<dyn EnclaveEnvironment>,
        sender: Arc<dyn HostSender>,
    ) -> Result<Self> {
        let keys = KeyMaterial::derive(env.as_ref())?;
        Ok(Self {
            enclave,
            services: RuntimeServices {
                keys,
                mux: Multiplexer::new(sender),
                handshake: AttestationHandshake::new(),
                watermarks: SequenceWatermarks::new(),
                post_offices: Mutex::new(HashMap::new()),
                size_policy: SizePolicy::moving_average(),
                env,
            },
            handler_lock: Mutex::new(()),
            entries: AtomicUsize::new(0),
            max_entries: DEFAULT_MAX_CONCURRENT_ENTRIES,
        })
    }

    /// Override the concurrent-entry cap.
    pub fn with_max_concurrent_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// Announce the enclave's public keys to the host. Called once after
    /// construction, before any client can address the enclave.
    pub fn start(&self) -> Result<()> {
        let announcement = KeyAnnouncement {
            signing_public_key: self.services.keys.signing_public_key().clone(),
            encryption_public_key: self.services.keys.encryption_public_key(),
            key_derivation: *self.services.keys.key_derivation(),
            mode: self.services.env.mode(),
        };
        self.services.mux.send_frame(&OutboundFrame::AttestationKeys {
            thread_id: ADMIN_THREAD_ID,
            announcement: announcement.to_bytes(),
        })?;
        info!(
            mode = ?self.services.env.mode(),
            public_key = ?self.services.keys.encryption_public_key(),
            "enclave started"
        );
        Ok(())
    }

    /// The public key clients encrypt mail to.
    pub fn encryption_public_key(&self) -> X25519PublicKey {
        self.services.keys.encryption_public_key()
    }

    /// The key-derivation descriptor of the current identity.
    pub fn key_derivation(&self) -> KeyDerivation {
        *self.services.keys.key_derivation()
    }

    /// The attested instance info, driving the attestation handshake with
    /// the host if it has not completed yet.
    ///
    /// # Errors
    ///
    /// [`EnclaveError::Protocol`] if the host never supplies evidence,
    /// [`EnclaveError::AttestationMismatch`] if the evidence does not
    /// cover this enclave.
    pub fn enclave_instance_info(&self) -> Result<EnclaveInstanceInfo> {
        if let Some(info) = self.services.handshake.instance_info() {
            return Ok(info);
        }
        let report_data = key_binding_report_data(
            self.services.keys.signing_public_key(),
            &self.services.keys.encryption_public_key(),
        );
        let report = self.services.env.create_report(report_data.as_bytes())?;

        // The host obtains evidence and feeds it back re-entrantly inside
        // this send
        self.services.mux.send_frame(&OutboundFrame::AttestationRequest {
            thread_id: ADMIN_THREAD_ID,
            report,
        })?;

        let info = self
            .services
            .handshake
            .complete(self.services.env.as_ref(), &self.services.keys)?;
        info!("attestation handshake completed");
        Ok(info)
    }

    /// A post office for a (destination, topic) pair, created on first
    /// use. The same pair always yields the same sequencer.
    pub fn post_office(
        &self,
        destination: X25519PublicKey,
        topic: Topic,
        destination_key_derivation: Option<KeyDerivation>,
    ) -> Arc<PostOffice> {
        self.services
            .post_office(destination, topic, destination_key_derivation)
    }

    /// Dispatch one frame from the host.
    ///
    /// Errors returned here cross the boundary back to the calling host
    /// thread; nothing is sent on the frame channel for a failed entry.
    pub fn receive_frame(&self, bytes: &[u8]) -> Result<()> {
        match InboundFrame::decode(bytes)? {
            InboundFrame::Call { thread_id, payload } => self.handle_call(thread_id, &payload),
            InboundFrame::CallReturn { thread_id, payload } => {
                self.services.mux.handle_call_return(thread_id, payload)
            }
            InboundFrame::MailDelivery {
                thread_id,
                mail_id,
                routing_hint,
                mail,
            } => self.handle_mail_delivery(thread_id, mail_id, &routing_hint, &mail),
            InboundFrame::AttestationEvidence { evidence, .. } => {
                self.services.handshake.deliver_evidence(evidence)
            }
        }
    }

    fn handle_call(&self, thread_id: u64, payload: &[u8]) -> Result<()> {
        match self.services.mux.classify_call(thread_id)? {
            CallDispatch::Callback(callback) => {
                // Re-entrant call during one of our own host calls: no new
                // entry, no handler lock (the root entry already holds it)
                let reply = callback(payload);
                self.services.mux.send_frame(&OutboundFrame::CallReturn {
                    thread_id,
                    payload: reply,
                })
            }
            CallDispatch::Root => {
                let _entry = match self.acquire_entry() {
                    Ok(guard) => guard,
                    Err(err) => {
                        self.services.mux.end_root_entry(thread_id);
                        return Err(err);
                    }
                };
                debug!(thread_id, len = payload.len(), "host call");

                let mut context = CallContext {
                    thread_id,
                    services: &self.services,
                    outbound: Vec::new(),
                };
                let result = self.with_handler_lock(|| {
                    self.enclave
                        .receive_from_untrusted_host(&mut context, payload)
                });
                match result {
                    Ok(reply) => {
                        self.flush(context.outbound)?;
                        let sent = self.services.mux.send_frame(&OutboundFrame::CallReturn {
                            thread_id,
                            payload: reply,
                        });
                        self.services.mux.end_root_entry(thread_id);
                        sent
                    }
                    Err(err) => {
                        self.services.mux.end_root_entry(thread_id);
                        Err(err)
                    }
                }
            }
        }
    }

    fn handle_mail_delivery(
        &self,
        thread_id: u64,
        mail_id: u64,
        routing_hint: &str,
        blob: &[u8],
    ) -> Result<()> {
        match self.services.mux.classify_call(thread_id)? {
            CallDispatch::Root => {}
            CallDispatch::Callback(_) => {
                return Err(EnclaveError::Protocol(format!(
                    "mail delivery on thread {thread_id} during an active call"
                )))
            }
        }
        let _entry = match self.acquire_entry() {
            Ok(guard) => guard,
            Err(err) => {
                self.services.mux.end_root_entry(thread_id);
                return Err(err);
            }
        };

        let result = self.deliver_mail(thread_id, mail_id, routing_hint, blob);
        self.services.mux.end_root_entry(thread_id);
        result
    }

    fn deliver_mail(
        &self,
        thread_id: u64,
        mail_id: u64,
        routing_hint: &str,
        blob: &[u8],
    ) -> Result<()> {
        // Pick the decryption key the header names. A descriptor for a
        // security version newer than the platform's is a rollback signal;
        // the platform's refusal passes through verbatim.
        let header = MailHeader::from_bytes(blob)?;
        let derived;
        let private_key = match header.key_derivation() {
            Some(descriptor) => {
                derived = derive_exchange_key(self.services.env.as_ref(), descriptor)?;
                &derived
            }
            None => self.services.keys.sender_keys().exchange_private_key(),
        };

        let mail = Mail::decrypt(blob, private_key)?;
        self.services.watermarks.check_and_advance(
            mail.authenticated_sender(),
            mail.topic(),
            mail.sequence_number(),
        )?;
        debug!(
            thread_id,
            mail_id,
            topic = mail.topic().as_str(),
            sequence = mail.sequence_number(),
            "mail accepted"
        );

        let hint = (!routing_hint.is_empty()).then_some(routing_hint);
        let mut context = CallContext {
            thread_id,
            services: &self.services,
            outbound: Vec::new(),
        };
        self.with_handler_lock(|| self.enclave.receive_mail(&mut context, mail, hint))?;

        // Acknowledge only after the handler succeeded, together with
        // everything it posted
        let mut outbound = context.outbound;
        outbound.push(OutboundFrame::MailAcknowledge { thread_id, mail_id });
        self.flush(outbound)
    }

    fn flush(&self, outbound: Vec<OutboundFrame>) -> Result<()> {
        for frame in &outbound {
            self.services.mux.send_frame(frame)?;
        }
        Ok(())
    }

    fn with_handler_lock<T>(&self, f: impl FnOnce() -> T) -> T {
        if self.enclave.thread_safe() {
            f()
        } else {
            let _guard = self.handler_lock.lock().expect("handler lock poisoned");
            f()
        }
    }

    fn acquire_entry(&self) -> Result<EntryGuard<'_>> {
        let previous = self.entries.fetch_add(1, Ordering::SeqCst);
        if previous >= self.max_entries {
            self.entries.fetch_sub(1, Ordering::SeqCst);
            return Err(EnclaveError::ResourceExhausted {
                limit: self.max_entries,
            });
        }
        Ok(EntryGuard(&self.entries))
    }
}

struct EntryGuard<'a>(&'a AtomicUsize);

impl Drop for EntryGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<E> std::fmt::Debug for EnclaveRuntime<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnclaveRuntime")
            .field("public_key", &self.services.keys.encryption_public_key())
            .field("max_entries", &self.max_entries)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::AttestationEvidence;
    use crate::frame::encode_inbound;
    use crate::hardware::MockEnvironment;
    use redoubt_mail::{SenderKeys, CPU_SVN_SIZE};

    type Script = Arc<dyn Fn(OutboundFrame) + Send + Sync>;

    /// Host double: records every frame the enclave emits and runs an
    /// optional script against each, which may re-enter the runtime.
    #[derive(Default)]
    struct TestHost {
        frames: Mutex<Vec<OutboundFrame>>,
        script: Mutex<Option<Script>>,
    }

    impl TestHost {
        fn set_script(&self, script: impl Fn(OutboundFrame) + Send + Sync + 'static) {
            *self.script.lock().unwrap() = Some(Arc::new(script));
        }

        fn frames(&self) -> Vec<OutboundFrame> {
            self.frames.lock().unwrap().clone()
        }
    }

    impl HostSender for TestHost {
        fn send(&self, bytes: Vec<u8>) -> Result<()> {
            let frame = OutboundFrame::decode(&bytes)?;
            self.frames.lock().unwrap().push(frame.clone());
            let script = self.script.lock().unwrap().clone();
            if let Some(script) = script {
                script(frame);
            }
            Ok(())
        }
    }

    fn test_env() -> Arc<MockEnvironment> {
        Arc::new(MockEnvironment::new([9u8; 32], [1u8; CPU_SVN_SIZE], 1))
    }

    fn call_frame(thread_id: u64, payload: &[u8]) -> Vec<u8> {
        encode_inbound(&InboundFrame::Call {
            thread_id,
            payload: payload.to_vec(),
        })
    }

    fn mail_frame(thread_id: u64, mail_id: u64, hint: &str, mail: Vec<u8>) -> Vec<u8> {
        encode_inbound(&InboundFrame::MailDelivery {
            thread_id,
            mail_id,
            routing_hint: hint.to_string(),
            mail,
        })
    }

    struct EchoEnclave;

    impl Enclave for EchoEnclave {
        fn receive_from_untrusted_host(
            &self,
            _context: &mut CallContext<'_>,
            bytes: &[u8],
        ) -> Result<Option<Vec<u8>>> {
            let mut reply = bytes.to_vec();
            reply.reverse();
            Ok(Some(reply))
        }
    }

    #[test]
    fn test_call_roundtrip() {
        let host = Arc::new(TestHost::default());
        let runtime =
            EnclaveRuntime::new(EchoEnclave, test_env(), Arc::clone(&host) as _).unwrap();

        runtime.receive_frame(&call_frame(1, b"abc")).unwrap();

        assert_eq!(
            host.frames(),
            vec![OutboundFrame::CallReturn {
                thread_id: 1,
                payload: Some(b"cba".to_vec()),
            }]
        );
    }

    #[test]
    fn test_default_enclave_is_unsupported() {
        struct Inert;
        impl Enclave for Inert {}

        let host = Arc::new(TestHost::default());
        let runtime = EnclaveRuntime::new(Inert, test_env(), Arc::clone(&host) as _).unwrap();

        assert!(matches!(
            runtime.receive_frame(&call_frame(1, b"x")),
            Err(EnclaveError::Unsupported("receive_from_untrusted_host"))
        ));
        // A failed entry emits nothing and leaves no call state behind
        assert!(host.frames().is_empty());
        assert!(runtime.receive_frame(&call_frame(1, b"x")).is_err());
    }

    #[test]
    fn test_start_announces_keys() {
        let host = Arc::new(TestHost::default());
        let runtime =
            EnclaveRuntime::new(EchoEnclave, test_env(), Arc::clone(&host) as _).unwrap();
        runtime.start().unwrap();

        match &host.frames()[..] {
            [OutboundFrame::AttestationKeys { announcement, .. }] => {
                let parsed = KeyAnnouncement::from_bytes(announcement).unwrap();
                assert_eq!(
                    parsed.encryption_public_key,
                    runtime.encryption_public_key()
                );
            }
            other => panic!("unexpected frames: {other:?}"),
        }
    }

    /// An enclave that calls back into the host, with a nested callback
    /// the host re-enters through.
    struct NestingEnclave;

    impl Enclave for NestingEnclave {
        fn receive_from_untrusted_host(
            &self,
            context: &mut CallContext<'_>,
            _bytes: &[u8],
        ) -> Result<Option<Vec<u8>>> {
            let callback: Arc<CallCallback> =
                Arc::new(|bytes: &[u8]| Some(bytes.to_ascii_uppercase()));
            let answer = context.call_untrusted_host_with(b"need-data".to_vec(), callback)?;
            Ok(answer)
        }
    }

    #[test]
    fn test_nested_call_untrusted_host() {
        let host = Arc::new(TestHost::default());
        let runtime = Arc::new(
            EnclaveRuntime::new(NestingEnclave, test_env(), Arc::clone(&host) as _).unwrap(),
        );

        let runtime_for_script = Arc::clone(&runtime);
        host.set_script(move |frame| {
            if let OutboundFrame::Call { thread_id, payload } = frame {
                assert_eq!(payload, b"need-data");
                // Re-enter the enclave through the callback, then answer
                runtime_for_script
                    .receive_frame(&call_frame(thread_id, b"nested"))
                    .unwrap();
                runtime_for_script
                    .receive_frame(&encode_inbound(&InboundFrame::CallReturn {
                        thread_id,
                        payload: Some(b"final".to_vec()),
                    }))
                    .unwrap();
            }
        });

        runtime.receive_frame(&call_frame(3, b"go")).unwrap();

        let frames = host.frames();
        // Outbound call, nested callback's return, and the root return
        assert!(matches!(&frames[0], OutboundFrame::Call { payload, .. } if payload == b"need-data"));
        assert!(matches!(
            &frames[1],
            OutboundFrame::CallReturn { payload: Some(p), .. } if p == b"NESTED"
        ));
        assert!(matches!(
            &frames[2],
            OutboundFrame::CallReturn { payload: Some(p), .. } if p == b"final"
        ));
    }

    fn attestation_script(host: &TestHost, runtime: Arc<EnclaveRuntime<EchoEnclave>>) {
        let env = Arc::clone(&runtime.services.env);
        host.set_script(move |frame| {
            if let OutboundFrame::AttestationRequest { thread_id, report } = frame {
                let evidence = AttestationEvidence {
                    report,
                    signature: b"svc-sig".to_vec(),
                    certificate_chain: b"svc-chain".to_vec(),
                    mode: env.mode(),
                };
                runtime
                    .receive_frame(&encode_inbound(&InboundFrame::AttestationEvidence {
                        thread_id,
                        evidence,
                    }))
                    .unwrap();
            }
        });
    }

    #[test]
    fn test_attestation_handshake_via_frames() {
        let host = Arc::new(TestHost::default());
        let runtime = Arc::new(
            EnclaveRuntime::new(EchoEnclave, test_env(), Arc::clone(&host) as _).unwrap(),
        );
        attestation_script(&host, Arc::clone(&runtime));

        let info = runtime.enclave_instance_info().unwrap();
        assert_eq!(info.encryption_public_key, runtime.encryption_public_key());
        assert_eq!(info.key_derivation, runtime.key_derivation());

        // Cached: a second request sends no more frames
        let frames_before = host.frames().len();
        let again = runtime.enclave_instance_info().unwrap();
        assert_eq!(again, info);
        assert_eq!(host.frames().len(), frames_before);
    }

    #[test]
    fn test_instance_info_without_evidence_fails() {
        let host = Arc::new(TestHost::default());
        let runtime =
            EnclaveRuntime::new(EchoEnclave, test_env(), Arc::clone(&host) as _).unwrap();

        // Host ignores the attestation request
        assert!(matches!(
            runtime.enclave_instance_info(),
            Err(EnclaveError::Protocol(_))
        ));
    }

    /// An enclave that replies to every mail on the sender's own stream.
    struct ReplyEnclave;

    impl Enclave for ReplyEnclave {
        fn receive_mail(
            &self,
            context: &mut CallContext<'_>,
            mail: Mail,
            routing_hint: Option<&str>,
        ) -> Result<()> {
            let office = context.post_office(
                mail.authenticated_sender().clone(),
                mail.topic().clone(),
                None,
            );
            let mut reply = mail.body().to_vec();
            reply.reverse();
            context.post_mail(&office, reply, None, routing_hint.unwrap_or(""))?;
            Ok(())
        }
    }

    fn encrypt_to_runtime(
        client: &SenderKeys,
        runtime: &EnclaveRuntime<impl Enclave>,
        sequence: u64,
        body: &[u8],
    ) -> Vec<u8> {
        let mut mail = redoubt_mail::MutableMail::new(body.to_vec());
        mail.set_sequence_number(sequence);
        mail.set_key_derivation(Some(runtime.key_derivation()));
        mail.encrypt(client, &runtime.encryption_public_key())
            .unwrap()
    }

    #[test]
    fn test_mail_delivery_reply_and_ack() {
        let host = Arc::new(TestHost::default());
        let runtime =
            EnclaveRuntime::new(ReplyEnclave, test_env(), Arc::clone(&host) as _).unwrap();
        let client = SenderKeys::generate();

        let blob = encrypt_to_runtime(&client, &runtime, 0, b"hello");
        runtime
            .receive_frame(&mail_frame(1, 10, "client-1", blob))
            .unwrap();

        let frames = host.frames();
        assert_eq!(frames.len(), 2);
        match &frames[0] {
            OutboundFrame::MailPost {
                routing_hint, mail, ..
            } => {
                assert_eq!(routing_hint, "client-1");
                let reply = Mail::decrypt(mail, client.exchange_private_key()).unwrap();
                assert_eq!(reply.body(), b"olleh");
                assert_eq!(reply.sequence_number(), 0);
                assert_eq!(
                    reply.authenticated_sender(),
                    &runtime.encryption_public_key()
                );
            }
            other => panic!("expected mail post, got {other:?}"),
        }
        assert_eq!(
            frames[1],
            OutboundFrame::MailAcknowledge {
                thread_id: 1,
                mail_id: 10
            }
        );
    }

    #[test]
    fn test_replies_continue_one_sequence() {
        let host = Arc::new(TestHost::default());
        let runtime =
            EnclaveRuntime::new(ReplyEnclave, test_env(), Arc::clone(&host) as _).unwrap();
        let client = SenderKeys::generate();

        for sequence in 0..3 {
            let blob = encrypt_to_runtime(&client, &runtime, sequence, b"ping");
            runtime
                .receive_frame(&mail_frame(1, sequence, "", blob))
                .unwrap();
        }

        let reply_sequences: Vec<u64> = host
            .frames()
            .iter()
            .filter_map(|frame| match frame {
                OutboundFrame::MailPost { mail, .. } => Some(
                    Mail::decrypt(mail, client.exchange_private_key())
                        .unwrap()
                        .sequence_number(),
                ),
                _ => None,
            })
            .collect();
        assert_eq!(reply_sequences, vec![0, 1, 2]);
    }

    #[test]
    fn test_replayed_mail_rejected_and_unacknowledged() {
        let host = Arc::new(TestHost::default());
        let runtime =
            EnclaveRuntime::new(ReplyEnclave, test_env(), Arc::clone(&host) as _).unwrap();
        let client = SenderKeys::generate();

        let blob = encrypt_to_runtime(&client, &runtime, 0, b"once");
        runtime
            .receive_frame(&mail_frame(1, 0, "", blob.clone()))
            .unwrap();
        let frames_after_first = host.frames().len();

        let err = runtime.receive_frame(&mail_frame(1, 1, "", blob)).unwrap_err();
        assert!(matches!(
            err,
            EnclaveError::Mail(redoubt_mail::MailError::SequenceViolation { .. })
        ));
        assert_eq!(host.frames().len(), frames_after_first);
    }

    #[test]
    fn test_corrupted_mail_rejected() {
        let host = Arc::new(TestHost::default());
        let runtime =
            EnclaveRuntime::new(ReplyEnclave, test_env(), Arc::clone(&host) as _).unwrap();
        let client = SenderKeys::generate();

        let mut blob = encrypt_to_runtime(&client, &runtime, 0, b"tamper");
        let last = blob.len() - 1;
        blob[last] ^= 1;
        assert!(matches!(
            runtime.receive_frame(&mail_frame(1, 0, "", blob)),
            Err(EnclaveError::Mail(redoubt_mail::MailError::Corruption))
        ));
    }

    /// Asserts mid-handler that no post or acknowledgement has reached the
    /// host yet.
    struct AtomicityEnclave {
        host: Arc<TestHost>,
    }

    impl Enclave for AtomicityEnclave {
        fn receive_mail(
            &self,
            context: &mut CallContext<'_>,
            mail: Mail,
            _routing_hint: Option<&str>,
        ) -> Result<()> {
            let office = context.post_office(
                mail.authenticated_sender().clone(),
                mail.topic().clone(),
                None,
            );
            context.post_mail(&office, b"reply".to_vec(), None, "")?;

            // Neither the post nor the acknowledgement is visible while
            // the entry is still running
            assert!(self.host.frames().is_empty());
            Ok(())
        }
    }

    #[test]
    fn test_posts_and_ack_held_until_entry_returns() {
        let host = Arc::new(TestHost::default());
        let enclave = AtomicityEnclave {
            host: Arc::clone(&host),
        };
        let runtime = EnclaveRuntime::new(enclave, test_env(), Arc::clone(&host) as _).unwrap();
        let client = SenderKeys::generate();

        let blob = encrypt_to_runtime(&client, &runtime, 0, b"work");
        runtime.receive_frame(&mail_frame(1, 5, "", blob)).unwrap();

        let frames = host.frames();
        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[0], OutboundFrame::MailPost { .. }));
        assert!(matches!(frames[1], OutboundFrame::MailAcknowledge { .. }));
    }

    #[test]
    fn test_old_key_generation_still_decrypts_after_tcb_recovery() {
        let env = test_env();
        let host = Arc::new(TestHost::default());
        let old_runtime =
            EnclaveRuntime::new(ReplyEnclave, Arc::clone(&env) as _, Arc::clone(&host) as _)
                .unwrap();
        let client = SenderKeys::generate();
        let blob = encrypt_to_runtime(&client, &old_runtime, 0, b"pre-recovery");
        drop(old_runtime);

        // Platform TCB moves forward; the restarted enclave has new keys
        // but re-derives the old generation named in the mail header
        env.advance_svn([2u8; CPU_SVN_SIZE], 2);
        let new_runtime =
            EnclaveRuntime::new(ReplyEnclave, env as _, Arc::clone(&host) as _).unwrap();

        new_runtime.receive_frame(&mail_frame(1, 0, "", blob)).unwrap();
        assert!(host
            .frames()
            .iter()
            .any(|f| matches!(f, OutboundFrame::MailAcknowledge { .. })));
    }

    #[test]
    fn test_mail_for_newer_svn_surfaces_platform_error() {
        let host = Arc::new(TestHost::default());
        let runtime =
            EnclaveRuntime::new(ReplyEnclave, test_env(), Arc::clone(&host) as _).unwrap();
        let client = SenderKeys::generate();

        // A descriptor ahead of the platform: rollback from the enclave's
        // point of view
        let mut mail = redoubt_mail::MutableMail::new(b"future".to_vec());
        mail.set_key_derivation(Some(KeyDerivation {
            cpu_svn: [1u8; CPU_SVN_SIZE],
            isv_svn: 9,
        }));
        let blob = mail
            .encrypt(&client, &runtime.encryption_public_key())
            .unwrap();

        assert!(matches!(
            runtime.receive_frame(&mail_frame(1, 0, "", blob)),
            Err(EnclaveError::Platform {
                code: "SGX_ERROR_INVALID_ISVSVN",
                ..
            })
        ));
    }

    #[test]
    fn test_concurrency_limit() {
        let host = Arc::new(TestHost::default());
        let runtime = Arc::new(
            EnclaveRuntime::new(NestingEnclave, test_env(), Arc::clone(&host) as _)
                .unwrap()
                .with_max_concurrent_entries(1),
        );

        let overflow: Arc<Mutex<Option<EnclaveError>>> = Arc::default();
        let runtime_for_script = Arc::clone(&runtime);
        let overflow_for_script = Arc::clone(&overflow);
        host.set_script(move |frame| {
            if let OutboundFrame::Call { thread_id, .. } = frame {
                // While the first entry is still in flight, a second root
                // call must bounce off the limit
                let err = runtime_for_script
                    .receive_frame(&call_frame(99, b"overflow"))
                    .unwrap_err();
                *overflow_for_script.lock().unwrap() = Some(err);
                runtime_for_script
                    .receive_frame(&encode_inbound(&InboundFrame::CallReturn {
                        thread_id,
                        payload: None,
                    }))
                    .unwrap();
            }
        });

        runtime.receive_frame(&call_frame(1, b"go")).unwrap();
        assert!(matches!(
            overflow.lock().unwrap().take(),
            Some(EnclaveError::ResourceExhausted { limit: 1 })
        ));

        // The limit frees up once the entry completes
        host.set_script(|_| {});
        runtime.receive_frame(&call_frame(2, b"again")).unwrap();
    }

    #[test]
    fn test_shared_size_policy_across_destinations() {
        let host = Arc::new(TestHost::default());
        let runtime =
            EnclaveRuntime::new(ReplyEnclave, test_env(), Arc::clone(&host) as _).unwrap();

        let a = SenderKeys::generate();
        let b = SenderKeys::generate();
        let office_a = runtime.post_office(a.public_key(), Topic::default(), None);
        let office_b = runtime.post_office(b.public_key(), Topic::default(), None);

        // Sizes observed through one office shape padding in the other
        office_a.encrypt_mail(vec![0u8; 4096], None).unwrap();
        let small = office_b.encrypt_mail(vec![0u8; 8], None).unwrap();
        assert!(small.len() >= 4096 / 2);
    }

    #[test]
    fn test_post_office_cache_returns_same_sequencer() {
        let host = Arc::new(TestHost::default());
        let runtime =
            EnclaveRuntime::new(ReplyEnclave, test_env(), Arc::clone(&host) as _).unwrap();
        let destination = SenderKeys::generate().public_key();

        let first = runtime.post_office(destination.clone(), Topic::default(), None);
        let second = runtime.post_office(destination, Topic::default(), None);
        assert!(Arc::ptr_eq(&first, &second));
    }
}
