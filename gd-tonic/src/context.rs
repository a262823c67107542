//! The context a service implementation receives for each call.

use crate::error::FixtureError;
use crate::handler::ServerRpcHandler;
use crate::metadata::{fuss_with_metadata, fussed_empty_metadata, Metadata};
use crate::state::{spawn_callbacks, ServerRpcRead};
use bytes::Bytes;
use grpc_double_core::{Behavior, CallId, Clock, ScheduledCall, SimTime};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tonic::Code;
use tracing::{debug, trace};

pub(crate) const CLIENT_INACTIVE: &str = "Client no longer active!";
const SERVER_CANCELLED: &str = "Cancelled by server-side application!";
const DEADLINE_EXCEEDED: &str = "Took too much time!";

struct ContextState {
    initial_metadata_sent: bool,
    pending_trailing_metadata: Option<Metadata>,
    pending_code: Option<Code>,
    pending_details: Option<String>,
    expiry: Option<ScheduledCall>,
    /// `None` once the servicing side has terminated the call.
    callbacks: Option<Vec<Behavior>>,
}

struct ContextInner {
    method: String,
    handler: Arc<dyn ServerRpcHandler>,
    clock: Arc<dyn Clock>,
    invocation_metadata: Metadata,
    deadline: Option<SimTime>,
    state: Mutex<ContextState>,
}

/// Per-call view of the RPC given to a service implementation.
///
/// Cancellation is advisory: a handler learns that its peer went away only by
/// asking [`ServicerContext::is_active`] or by reading from its request
/// stream. Cloning yields another handle to the same call.
#[derive(Clone)]
pub struct ServicerContext {
    inner: Arc<ContextInner>,
}

impl ServicerContext {
    pub(crate) fn new(
        method: impl Into<String>,
        handler: Arc<dyn ServerRpcHandler>,
        clock: Arc<dyn Clock>,
        invocation_metadata: &Metadata,
        deadline: Option<SimTime>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                method: method.into(),
                handler,
                clock,
                invocation_metadata: fuss_with_metadata(Some(invocation_metadata)),
                deadline,
                state: Mutex::new(ContextState {
                    initial_metadata_sent: false,
                    pending_trailing_metadata: None,
                    pending_code: None,
                    pending_details: None,
                    expiry: None,
                    callbacks: Some(Vec::new()),
                }),
            }),
        }
    }

    /// Schedule expiry at the deadline. Any termination cancels it before
    /// returning.
    pub(crate) fn arm_deadline(&self) {
        let Some(deadline) = self.inner.deadline else {
            return;
        };

        let mut state = self.inner.state.lock();
        let context: Weak<ContextInner> = Arc::downgrade(&self.inner);
        let expiry = self.inner.clock.call_at(
            deadline,
            Box::new(move || {
                if let Some(inner) = context.upgrade() {
                    ServicerContext { inner }.expire();
                }
            }),
        );
        debug!(call_id = %self.call_id(), deadline = %deadline, "Deadline armed");
        if state.callbacks.is_some() {
            state.expiry = Some(expiry);
        } else {
            expiry.cancel();
        }
    }

    pub fn call_id(&self) -> CallId {
        self.inner.handler.call_id()
    }

    /// Full `/service/method` path of the call.
    pub fn method(&self) -> &str {
        &self.inner.method
    }

    /// Whether the call can still complete normally.
    ///
    /// Finding the client gone terminates the call from this side with
    /// `UNKNOWN`, which also runs the registered callbacks.
    pub fn is_active(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.callbacks.is_none() {
            return false;
        }
        if self.inner.handler.is_active() {
            return true;
        }
        self.abort_locked(&mut state, Code::Unknown, CLIENT_INACTIVE);
        false
    }

    /// `None` without a deadline; zero once the call is over.
    pub fn time_remaining(&self) -> Option<Duration> {
        let deadline = self.inner.deadline?;
        if !self.inner.handler.is_active() {
            return Some(Duration::ZERO);
        }
        Some(deadline.saturating_duration_since(self.inner.clock.now()))
    }

    /// Terminate the call with `CANCELLED`.
    pub fn cancel(&self) {
        let mut state = self.inner.state.lock();
        self.abort_locked(&mut state, Code::Cancelled, SERVER_CANCELLED);
    }

    /// Run `callback` when the call terminates. On an already terminated call
    /// it runs right away and `false` is returned.
    pub fn add_callback(&self, callback: impl FnOnce() + Send + 'static) -> bool {
        {
            let mut state = self.inner.state.lock();
            if let Some(callbacks) = state.callbacks.as_mut() {
                callbacks.push(Box::new(callback));
                return true;
            }
        }
        callback();
        false
    }

    pub fn invocation_metadata(&self) -> Metadata {
        self.inner.invocation_metadata.clone()
    }

    /// Send initial metadata ahead of any response. Fails if metadata (or a
    /// response, which implies it) was already sent.
    pub fn send_initial_metadata(&self, metadata: &Metadata) -> Result<(), FixtureError> {
        let mut state = self.inner.state.lock();
        if state.initial_metadata_sent {
            return Err(FixtureError::InitialMetadataAlreadySent);
        }
        self.inner
            .handler
            .send_initial_metadata(fuss_with_metadata(Some(metadata)))?;
        state.initial_metadata_sent = true;
        Ok(())
    }

    pub fn set_trailing_metadata(&self, metadata: &Metadata) {
        self.inner.state.lock().pending_trailing_metadata = Some(fuss_with_metadata(Some(metadata)));
    }

    pub fn set_code(&self, code: Code) {
        self.inner.state.lock().pending_code = Some(code);
    }

    pub fn set_details(&self, details: impl Into<String>) {
        self.inner.state.lock().pending_details = Some(details.into());
    }

    // ---- dispatch ------------------------------------------------------

    pub(crate) fn take_request(&self) -> ServerRpcRead {
        self.inner.handler.take_request()
    }

    pub(crate) fn send_response(&self, response: Bytes) {
        let mut state = self.inner.state.lock();
        self.ensure_initial_metadata_sent(&mut state);
        self.inner.handler.add_response(response);
    }

    /// Normal completion, applying whatever the application staged.
    pub(crate) fn complete(&self) {
        let mut state = self.inner.state.lock();
        self.ensure_initial_metadata_sent(&mut state);
        let trailing_metadata = state
            .pending_trailing_metadata
            .take()
            .unwrap_or_else(fussed_empty_metadata);
        let code = state.pending_code.unwrap_or(Code::Ok);
        let details = state.pending_details.take().unwrap_or_default();
        self.terminate_locked(&mut state, trailing_metadata, code, &details);
    }

    /// Completion with an error status returned by the application. Staged
    /// trailing metadata still applies.
    pub(crate) fn fail(&self, code: Code, details: &str) {
        let mut state = self.inner.state.lock();
        let trailing_metadata = state
            .pending_trailing_metadata
            .take()
            .unwrap_or_else(fussed_empty_metadata);
        self.terminate_locked(&mut state, trailing_metadata, code, details);
    }

    pub(crate) fn abort(&self, code: Code, details: &str) {
        let mut state = self.inner.state.lock();
        self.abort_locked(&mut state, code, details);
    }

    fn expire(&self) {
        debug!(call_id = %self.call_id(), method = %self.inner.method, "Deadline expired");
        self.abort(Code::DeadlineExceeded, DEADLINE_EXCEEDED);
    }

    fn ensure_initial_metadata_sent(&self, state: &mut ContextState) {
        if !state.initial_metadata_sent {
            // Only fails if metadata was already set, which is what we want.
            let _ = self
                .inner
                .handler
                .send_initial_metadata(fussed_empty_metadata());
            state.initial_metadata_sent = true;
        }
    }

    fn abort_locked(&self, state: &mut ContextState, code: Code, details: &str) {
        self.terminate_locked(state, fussed_empty_metadata(), code, details);
    }

    fn terminate_locked(&self, state: &mut ContextState, trailing_metadata: Metadata, code: Code, details: &str) {
        let Some(callbacks) = state.callbacks.take() else {
            trace!(call_id = %self.call_id(), ?code, "Servicer already terminated the call");
            return;
        };
        // Fails harmlessly when the expiry itself is what is terminating.
        if let Some(expiry) = state.expiry.take() {
            expiry.cancel();
        }
        self.inner
            .handler
            .send_termination(trailing_metadata, code, details);
        spawn_callbacks(self.call_id(), "server-side", callbacks);
    }
}

impl fmt::Debug for ServicerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServicerContext")
            .field("call_id", &self.call_id())
            .field("method", &self.inner.method)
            .field("deadline", &self.inner.deadline)
            .finish()
    }
}
