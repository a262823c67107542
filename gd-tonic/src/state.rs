//! Per-call rendezvous state.
//!
//! One [`RpcState`] exists per in-flight call. It is the only shared mutable
//! record of the call: both the invoking side (a channel, or test code playing
//! a client) and the servicing side (an application server, or test code
//! playing one) operate on the same value through the handler traits in
//! [`crate::handler`].
//!
//! Every operation takes the call's single lock. Blocking operations wait on
//! the call's condition variable and re-check their predicate after every
//! wake, so spurious wakeups and multiple notifiers are harmless.
//!
//! The terminal transition happens exactly once. After it, queued responses
//! can still be drained; only once they are gone does a reader observe the
//! terminal status.

use crate::error::FixtureError;
use crate::metadata::{fussed_empty_metadata, Metadata};
use bytes::Bytes;
use grpc_double_core::{panic_message, Behavior, CallId, Clock, SimTime};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tonic::Code;
use tracing::{debug, error, trace, warn};

/// The status a call ends with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Termination {
    pub trailing_metadata: Metadata,
    pub code: Code,
    pub details: String,
}

impl Termination {
    pub fn new(trailing_metadata: Metadata, code: Code, details: impl Into<String>) -> Self {
        Self {
            trailing_metadata,
            code,
            details: details.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }
}

/// What the invoking side reads next.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelRpcRead {
    Response(Bytes),
    Terminated(Termination),
}

/// What the servicing side reads next.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerRpcRead {
    Request(Bytes),
    /// The request stream was closed and every request has been taken.
    NoMoreRequests,
    /// The call reached a terminal status; the peer is gone.
    Terminated,
}

struct Inner {
    requests: VecDeque<Bytes>,
    requests_closed: bool,
    initial_metadata: Option<Metadata>,
    responses: VecDeque<Bytes>,
    termination: Option<Termination>,
    callbacks: Vec<Behavior>,
}

struct Deadline {
    clock: Arc<dyn Clock>,
    at: SimTime,
}

/// Shared mutable record of one call.
pub struct RpcState {
    id: CallId,
    method: String,
    invocation_metadata: Metadata,
    deadline: Option<Deadline>,
    inner: Mutex<Inner>,
    changed: Condvar,
}

impl RpcState {
    /// A new, non-terminal call seeded with `requests`.
    pub fn new(
        method: impl Into<String>,
        invocation_metadata: Metadata,
        requests: impl IntoIterator<Item = Bytes>,
        requests_closed: bool,
    ) -> Self {
        let id = CallId::next();
        let method = method.into();
        let requests: VecDeque<Bytes> = requests.into_iter().collect();
        debug!(call_id = %id, method = %method, initial_requests = requests.len(), requests_closed, "Call created");
        Self {
            id,
            method,
            invocation_metadata,
            deadline: None,
            inner: Mutex::new(Inner {
                requests,
                requests_closed,
                initial_metadata: None,
                responses: VecDeque::new(),
                termination: None,
                callbacks: Vec::new(),
            }),
            changed: Condvar::new(),
        }
    }

    /// Attach a deadline so [`RpcState::time_remaining`] can answer. The
    /// state never expires itself; whoever owns the deadline does.
    #[must_use]
    pub fn with_deadline(mut self, clock: Arc<dyn Clock>, at: SimTime) -> Self {
        self.deadline = Some(Deadline { clock, at });
        self
    }

    pub fn call_id(&self) -> CallId {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn invocation_metadata(&self) -> Metadata {
        self.invocation_metadata.clone()
    }

    // ---- invoking side -------------------------------------------------

    /// Queue a request. Fails without side effects once the call is terminal
    /// or the request stream is closed.
    pub fn add_request(&self, request: Bytes) -> bool {
        let mut inner = self.inner.lock();
        if inner.termination.is_some() || inner.requests_closed {
            trace!(call_id = %self.id, "Request rejected");
            return false;
        }
        inner.requests.push_back(request);
        trace!(call_id = %self.id, queued = inner.requests.len(), "Request added");
        self.changed.notify_all();
        true
    }

    pub fn close_requests(&self) {
        let mut inner = self.inner.lock();
        if inner.termination.is_none() && !inner.requests_closed {
            inner.requests_closed = true;
            trace!(call_id = %self.id, "Request stream closed");
            self.changed.notify_all();
        }
    }

    /// Next response, or the terminal status once every queued response has
    /// been taken.
    pub fn take_response(&self) -> ChannelRpcRead {
        let mut inner = self.inner.lock();
        loop {
            if let Some(response) = inner.responses.pop_front() {
                self.changed.notify_all();
                return ChannelRpcRead::Response(response);
            }
            if let Some(termination) = &inner.termination {
                return ChannelRpcRead::Terminated(termination.clone());
            }
            self.changed.wait(&mut inner);
        }
    }

    /// Terminate the call from the invoking side. Returns `false` if the call
    /// was already terminal.
    pub fn cancel(&self, code: Code, details: &str) -> bool {
        let callbacks = {
            let mut inner = self.inner.lock();
            if inner.termination.is_some() {
                return false;
            }
            self.terminate_locked(
                &mut inner,
                Termination::new(fussed_empty_metadata(), code, details),
            )
        };
        spawn_callbacks(self.id, "call", callbacks);
        true
    }

    /// Block until the call is terminal and return its status.
    pub fn termination(&self) -> Termination {
        let mut inner = self.inner.lock();
        loop {
            if let Some(termination) = &inner.termination {
                return termination.clone();
            }
            self.changed.wait(&mut inner);
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().termination.is_none()
    }

    /// Block until initial metadata is sent; synthesized metadata once the
    /// call terminates without any.
    pub fn initial_metadata(&self) -> Metadata {
        let mut inner = self.inner.lock();
        loop {
            if let Some(metadata) = &inner.initial_metadata {
                return metadata.clone();
            }
            if inner.termination.is_some() {
                return fussed_empty_metadata();
            }
            self.changed.wait(&mut inner);
        }
    }

    /// `None` without a deadline, zero once the call is terminal.
    pub fn time_remaining(&self) -> Option<Duration> {
        let deadline = self.deadline.as_ref()?;
        if !self.is_active() {
            return Some(Duration::ZERO);
        }
        Some(deadline.at.saturating_duration_since(deadline.clock.now()))
    }

    /// Register a callback to run when the call terminates. A terminal call
    /// hands the callback back instead.
    pub fn add_callback(&self, callback: Behavior) -> Result<(), Behavior> {
        let mut inner = self.inner.lock();
        if inner.termination.is_some() {
            return Err(callback);
        }
        inner.callbacks.push(callback);
        Ok(())
    }

    // ---- servicing side ------------------------------------------------

    /// Record initial metadata. Sending twice is a caller error; sending after
    /// termination is ignored.
    pub fn send_initial_metadata(&self, metadata: Metadata) -> Result<(), FixtureError> {
        let mut inner = self.inner.lock();
        if inner.termination.is_some() {
            debug!(call_id = %self.id, "Initial metadata sent after termination; ignored");
            return Ok(());
        }
        if inner.initial_metadata.is_some() {
            return Err(FixtureError::InitialMetadataAlreadySent);
        }
        inner.initial_metadata = Some(metadata);
        self.changed.notify_all();
        Ok(())
    }

    /// Next request, in the order the invoking side queued them. Termination
    /// takes priority over queued requests.
    pub fn take_request(&self) -> ServerRpcRead {
        let mut inner = self.inner.lock();
        loop {
            if inner.termination.is_some() {
                return ServerRpcRead::Terminated;
            }
            if let Some(request) = inner.requests.pop_front() {
                self.changed.notify_all();
                return ServerRpcRead::Request(request);
            }
            if inner.requests_closed {
                return ServerRpcRead::NoMoreRequests;
            }
            self.changed.wait(&mut inner);
        }
    }

    /// Queue a response. Responses are dropped once the call is terminal.
    pub fn add_response(&self, response: Bytes) {
        let mut inner = self.inner.lock();
        if inner.termination.is_some() {
            warn!(call_id = %self.id, method = %self.method, "Response added after termination; dropped");
            return;
        }
        if inner.initial_metadata.is_none() {
            inner.initial_metadata = Some(fussed_empty_metadata());
        }
        inner.responses.push_back(response);
        trace!(call_id = %self.id, queued = inner.responses.len(), "Response added");
        self.changed.notify_all();
    }

    /// The one-shot terminal transition from the servicing side. Returns
    /// `false`, changing nothing, if the call was already terminal.
    pub fn send_termination(&self, trailing_metadata: Metadata, code: Code, details: &str) -> bool {
        let callbacks = {
            let mut inner = self.inner.lock();
            if inner.termination.is_some() {
                trace!(call_id = %self.id, ?code, "Call already terminal; termination ignored");
                return false;
            }
            self.terminate_locked(&mut inner, Termination::new(trailing_metadata, code, details))
        };
        spawn_callbacks(self.id, "call", callbacks);
        true
    }

    // ---- test driver helpers ---------------------------------------------

    /// Block until the request stream is closed and drained, or the call is
    /// terminal.
    pub fn wait_for_requests_closed(&self) {
        let mut inner = self.inner.lock();
        while inner.termination.is_none() && !(inner.requests_closed && inner.requests.is_empty())
        {
            self.changed.wait(&mut inner);
        }
    }

    /// Block until the call is terminal; succeeds iff it was cancelled.
    pub fn wait_for_cancellation(&self) -> Result<(), FixtureError> {
        let termination = self.termination();
        if termination.code == Code::Cancelled {
            Ok(())
        } else {
            Err(FixtureError::UnexpectedCode {
                expected: Code::Cancelled,
                actual: termination.code,
            })
        }
    }

    fn terminate_locked(&self, inner: &mut Inner, termination: Termination) -> Vec<Behavior> {
        if inner.initial_metadata.is_none() {
            inner.initial_metadata = Some(fussed_empty_metadata());
        }
        debug!(
            call_id = %self.id,
            method = %self.method,
            code = ?termination.code,
            details = %termination.details,
            pending_responses = inner.responses.len(),
            "Call terminated"
        );
        inner.termination = Some(termination);
        self.changed.notify_all();
        std::mem::take(&mut inner.callbacks)
    }
}

impl fmt::Debug for RpcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("RpcState")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("requests", &inner.requests.len())
            .field("requests_closed", &inner.requests_closed)
            .field("responses", &inner.responses.len())
            .field("termination", &inner.termination)
            .finish()
    }
}

/// Run completion callbacks on their own thread so the terminating thread
/// never blocks on them. Each callback's panic is logged and does not stop
/// the rest.
pub(crate) fn spawn_callbacks(call_id: CallId, kind: &'static str, callbacks: Vec<Behavior>) {
    if callbacks.is_empty() {
        return;
    }

    let pending = Arc::new(Mutex::new(Some(callbacks)));
    let for_thread = pending.clone();
    let spawned = thread::Builder::new()
        .name("grpc-double-callbacks".to_string())
        .spawn(move || {
            let callbacks = for_thread.lock().take();
            if let Some(callbacks) = callbacks {
                run_callbacks(call_id, kind, callbacks);
            }
        });

    if let Err(e) = spawned {
        error!(call_id = %call_id, error = %e, "Failed to spawn callback thread; running callbacks inline");
        let callbacks = pending.lock().take();
        if let Some(callbacks) = callbacks {
            run_callbacks(call_id, kind, callbacks);
        }
    }
}

fn run_callbacks(call_id: CallId, kind: &'static str, callbacks: Vec<Behavior>) {
    trace!(call_id = %call_id, kind, count = callbacks.len(), "Running completion callbacks");
    for callback in callbacks {
        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(callback)) {
            error!(
                call_id = %call_id,
                kind,
                panic = %panic_message(panic.as_ref()),
                "Exception calling {kind} callback!"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::fuss_with_metadata;
    use grpc_double_core::SimulatedClock;
    use std::sync::mpsc;

    fn state(requests: &[&'static str], closed: bool) -> Arc<RpcState> {
        Arc::new(RpcState::new(
            "/test.Svc/Method",
            fussed_empty_metadata(),
            requests.iter().map(|r| Bytes::from_static(r.as_bytes())),
            closed,
        ))
    }

    #[test]
    fn requests_arrive_in_order() {
        let rpc = state(&["r1"], false);
        assert!(rpc.add_request(Bytes::from_static(b"r2")));
        assert!(rpc.add_request(Bytes::from_static(b"r3")));
        rpc.close_requests();
        assert!(!rpc.add_request(Bytes::from_static(b"late")));

        let mut seen = Vec::new();
        while let ServerRpcRead::Request(request) = rpc.take_request() {
            seen.push(request);
        }
        assert_eq!(seen, vec!["r1", "r2", "r3"]);
        assert_eq!(rpc.take_request(), ServerRpcRead::NoMoreRequests);
    }

    #[test]
    fn responses_drain_before_status() {
        let rpc = state(&[], true);
        rpc.add_response(Bytes::from_static(b"a"));
        rpc.add_response(Bytes::from_static(b"b"));
        assert!(rpc.send_termination(fussed_empty_metadata(), Code::Aborted, "gone"));

        assert_eq!(rpc.take_response(), ChannelRpcRead::Response(Bytes::from_static(b"a")));
        assert_eq!(rpc.take_response(), ChannelRpcRead::Response(Bytes::from_static(b"b")));
        match rpc.take_response() {
            ChannelRpcRead::Terminated(t) => {
                assert_eq!(t.code, Code::Aborted);
                assert_eq!(t.details, "gone");
            }
            other => panic!("expected termination, got {other:?}"),
        }
        // Repeated reads keep observing the same status.
        assert!(matches!(rpc.take_response(), ChannelRpcRead::Terminated(_)));
    }

    #[test]
    fn terminal_status_is_written_once() {
        let rpc = state(&[], false);
        assert!(rpc.cancel(Code::Cancelled, "Locally cancelled!"));
        assert!(!rpc.cancel(Code::Unknown, "again"));
        assert!(!rpc.send_termination(Metadata::new(), Code::Ok, ""));
        assert!(!rpc.add_request(Bytes::from_static(b"x")));
        rpc.close_requests();

        let termination = rpc.termination();
        assert_eq!(termination.code, Code::Cancelled);
        assert_eq!(termination.details, "Locally cancelled!");
        assert_eq!(termination.trailing_metadata, fussed_empty_metadata());
        assert_eq!(rpc.initial_metadata(), fussed_empty_metadata());
        assert!(!rpc.is_active());
        assert_eq!(rpc.take_request(), ServerRpcRead::Terminated);
    }

    #[test]
    fn termination_wins_over_queued_requests() {
        let rpc = state(&["unread"], false);
        rpc.cancel(Code::Cancelled, "Locally cancelled!");
        assert_eq!(rpc.take_request(), ServerRpcRead::Terminated);
    }

    #[test]
    fn initial_metadata_is_single_use() {
        let rpc = state(&[], true);
        let sent = fuss_with_metadata(Some(&Metadata::from_pairs([("k", "v")])));
        rpc.send_initial_metadata(sent.clone()).unwrap();
        assert!(matches!(
            rpc.send_initial_metadata(Metadata::new()),
            Err(FixtureError::InitialMetadataAlreadySent)
        ));
        assert_eq!(rpc.initial_metadata(), sent);
    }

    #[test]
    fn first_response_implies_initial_metadata() {
        let rpc = state(&[], true);
        rpc.add_response(Bytes::from_static(b"a"));
        assert_eq!(rpc.initial_metadata(), fussed_empty_metadata());
        assert!(rpc.send_initial_metadata(Metadata::new()).is_err());
    }

    #[test]
    fn blocked_reader_wakes_on_termination() {
        let rpc = state(&[], false);
        let reader = {
            let rpc = rpc.clone();
            thread::spawn(move || rpc.take_response())
        };
        let server = {
            let rpc = rpc.clone();
            thread::spawn(move || rpc.take_request())
        };

        rpc.cancel(Code::Cancelled, "Locally cancelled!");
        assert!(matches!(reader.join().unwrap(), ChannelRpcRead::Terminated(_)));
        assert_eq!(server.join().unwrap(), ServerRpcRead::Terminated);
    }

    #[test]
    fn callbacks_run_once_at_termination() {
        let rpc = state(&[], true);
        let (tx, rx) = mpsc::channel();
        let first = tx.clone();
        assert!(rpc.add_callback(Box::new(|| panic!("first callback fails"))).is_ok());
        assert!(rpc
            .add_callback(Box::new(move || first.send("second").unwrap()))
            .is_ok());

        rpc.send_termination(fussed_empty_metadata(), Code::Ok, "");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "second");

        let late = rpc.add_callback(Box::new(move || tx.send("late").unwrap()));
        assert!(late.is_err());
    }

    #[test]
    fn time_remaining_tracks_the_deadline() {
        let clock = Arc::new(SimulatedClock::new(SimTime::from_secs(10)));
        let rpc = RpcState::new("/test.Svc/Method", Metadata::new(), [], true)
            .with_deadline(clock.clone(), SimTime::from_secs(12));

        assert_eq!(rpc.time_remaining(), Some(Duration::from_secs(2)));
        clock.sleep_for(Duration::from_secs(5));
        assert_eq!(rpc.time_remaining(), Some(Duration::ZERO));

        let no_deadline = state(&[], true);
        assert_eq!(no_deadline.time_remaining(), None);
    }

    #[test]
    fn waiting_for_cancellation() {
        let cancelled = state(&[], false);
        cancelled.cancel(Code::Cancelled, "Locally cancelled!");
        assert!(cancelled.wait_for_cancellation().is_ok());

        let completed = state(&[], false);
        completed.send_termination(Metadata::new(), Code::Ok, "");
        assert!(matches!(
            completed.wait_for_cancellation(),
            Err(FixtureError::UnexpectedCode {
                actual: Code::Ok,
                ..
            })
        ));
    }

    #[test]
    fn requests_closed_waits_for_drain() {
        let rpc = state(&["only"], true);
        let waiter = {
            let rpc = rpc.clone();
            thread::spawn(move || rpc.wait_for_requests_closed())
        };
        assert!(matches!(rpc.take_request(), ServerRpcRead::Request(_)));
        waiter.join().unwrap();
    }
}
