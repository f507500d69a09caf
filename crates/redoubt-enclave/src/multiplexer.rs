//! Per-thread call-state multiplexing between host and enclave.
//!
//! The host drives the enclave with frames; within one host thread, calls
//! nest: the enclave may call back into the untrusted host while handling
//! a host call, and the host may re-enter the enclave while handling
//! *that*. The multiplexer keeps one call-state stack per host thread id
//! and routes each frame to the right level of the nest.
//!
//! The transport contract is synchronous re-entrancy: [`HostSender::send`]
//! of a CALL frame does not return until the host has finished with it,
//! and any frames the host produces meanwhile are fed back in on the same
//! call stack. That mirrors how hardware enclave transitions behave and
//! keeps the state machine free of cross-thread signalling.
//!
//! The state lock is never held across a send or a handler invocation, so
//! re-entrant frames never deadlock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::error::{EnclaveError, Result};
use crate::frame::OutboundFrame;

/// Callback invoked when the host re-enters the enclave during an
/// outstanding [`Multiplexer::call_untrusted_host`].
pub type CallCallback = dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync;

/// The enclave's outbound transport to the host.
///
/// `send` of a CALL frame must not return until the host has handled it;
/// frames the host produces while doing so are delivered re-entrantly on
/// the calling thread before `send` returns.
pub trait HostSender: Send + Sync {
    /// Deliver one encoded frame to the host.
    fn send(&self, frame: Vec<u8>) -> Result<()>;
}

enum CallState {
    /// Waiting for the host: either the root entry of a host call into the
    /// enclave (no callback) or an outstanding enclave call to the host
    /// (with the callback to run if the host re-enters).
    Receive {
        callback: Option<Arc<CallCallback>>,
        root: bool,
    },
    /// The host answered an outstanding enclave call.
    Response(Option<Vec<u8>>),
}

/// Where an inbound CALL frame should be routed.
pub enum CallDispatch {
    /// A fresh entry: dispatch to the enclave's own handler.
    Root,
    /// A re-entrant call: dispatch to the registered callback.
    Callback(Arc<CallCallback>),
}

/// Routes frames between host threads and nested call states.
pub struct Multiplexer {
    sender: Arc<dyn HostSender>,
    states: Mutex<HashMap<u64, Vec<CallState>>>,
}

impl Multiplexer {
    /// Create a multiplexer sending through `sender`.
    pub fn new(sender: Arc<dyn HostSender>) -> Self {
        Self {
            sender,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Encode and send one frame to the host.
    pub fn send_frame(&self, frame: &OutboundFrame) -> Result<()> {
        self.sender.send(frame.encode())
    }

    /// Classify an inbound CALL frame, registering a root entry when the
    /// thread has none.
    ///
    /// # Errors
    ///
    /// [`EnclaveError::Protocol`] when a re-entrant call arrives while the
    /// thread is not waiting on a callback-carrying host call.
    pub fn classify_call(&self, thread_id: u64) -> Result<CallDispatch> {
        let mut states = self.states.lock().expect("call state lock poisoned");
        match states.get(&thread_id).and_then(|stack| stack.last()) {
            None => {
                states.entry(thread_id).or_default().push(CallState::Receive {
                    callback: None,
                    root: true,
                });
                trace!(thread_id, "root call entry");
                Ok(CallDispatch::Root)
            }
            Some(CallState::Receive {
                callback: Some(callback),
                ..
            }) => {
                trace!(thread_id, "re-entrant call to callback");
                Ok(CallDispatch::Callback(Arc::clone(callback)))
            }
            Some(CallState::Receive { callback: None, .. }) => Err(EnclaveError::Protocol(
                format!("re-entrant call on thread {thread_id} with no registered receiver"),
            )),
            Some(CallState::Response(_)) => Err(EnclaveError::Protocol(format!(
                "call on thread {thread_id} with an unconsumed response"
            ))),
        }
    }

    /// Drop a thread's call state once its root entry has returned to the
    /// host, so completed entries do not accumulate.
    pub fn end_root_entry(&self, thread_id: u64) {
        let mut states = self.states.lock().expect("call state lock poisoned");
        states.remove(&thread_id);
        trace!(thread_id, "root entry completed");
    }

    /// Resolve the thread's outstanding enclave call with the host's
    /// return value.
    ///
    /// # Errors
    ///
    /// [`EnclaveError::Protocol`] if the thread has no outstanding call or
    /// already holds an unconsumed response.
    pub fn handle_call_return(&self, thread_id: u64, payload: Option<Vec<u8>>) -> Result<()> {
        let mut states = self.states.lock().expect("call state lock poisoned");
        let stack = states.get_mut(&thread_id).ok_or_else(|| {
            EnclaveError::Protocol(format!("call return on idle thread {thread_id}"))
        })?;
        match stack.last() {
            Some(CallState::Receive { root: false, .. }) => {
                stack.pop();
                stack.push(CallState::Response(payload));
                Ok(())
            }
            Some(CallState::Receive { root: true, .. }) => Err(EnclaveError::Protocol(format!(
                "call return on thread {thread_id} with no outstanding call"
            ))),
            Some(CallState::Response(_)) => Err(EnclaveError::Protocol(format!(
                "second call return on thread {thread_id}"
            ))),
            None => Err(EnclaveError::Protocol(format!(
                "call return on empty call stack for thread {thread_id}"
            ))),
        }
    }

    /// Call back into the untrusted host and wait for its answer.
    ///
    /// If `callback` is given, the host may re-enter the enclave with
    /// nested CALL frames while handling this one; each is routed to the
    /// callback. Returns the host's value, or `None` if the host finished
    /// without answering.
    ///
    /// # Errors
    ///
    /// [`EnclaveError::CallContext`] when the thread has no active host
    /// entry; calls to the host only make sense inside one.
    pub fn call_untrusted_host(
        &self,
        thread_id: u64,
        payload: Vec<u8>,
        callback: Option<Arc<CallCallback>>,
    ) -> Result<Option<Vec<u8>>> {
        {
            let mut states = self.states.lock().expect("call state lock poisoned");
            let stack = states.get_mut(&thread_id).filter(|s| !s.is_empty()).ok_or_else(|| {
                EnclaveError::CallContext(format!(
                    "call_untrusted_host outside an active entry on thread {thread_id}"
                ))
            })?;
            stack.push(CallState::Receive {
                callback,
                root: false,
            });
        }

        // The host handles the call re-entrantly inside this send
        let send_result = self.send_frame(&OutboundFrame::Call { thread_id, payload });

        let mut states = self.states.lock().expect("call state lock poisoned");
        let stack = states.get_mut(&thread_id).ok_or_else(|| {
            EnclaveError::Protocol(format!("call state vanished for thread {thread_id}"))
        })?;
        let state = stack.pop().ok_or_else(|| {
            EnclaveError::Protocol(format!("call stack underflow for thread {thread_id}"))
        })?;
        drop(states);
        send_result?;

        match state {
            CallState::Response(payload) => Ok(payload),
            // Host finished without answering: the terminating response
            CallState::Receive { root: false, .. } => Ok(None),
            CallState::Receive { root: true, .. } => Err(EnclaveError::Protocol(format!(
                "call stack corrupted for thread {thread_id}"
            ))),
        }
    }

    /// Whether the thread currently has an active entry.
    pub fn has_active_entry(&self, thread_id: u64) -> bool {
        let states = self.states.lock().expect("call state lock poisoned");
        states.get(&thread_id).is_some_and(|stack| !stack.is_empty())
    }
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let states = self.states.lock().expect("call state lock poisoned");
        f.debug_struct("Multiplexer")
            .field("active_threads", &states.len())
            .finish_non_exhaustive()
    }
}
