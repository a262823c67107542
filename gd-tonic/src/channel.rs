//! Channel fixture: application code calls out through a [`Channel`], test
//! code takes those calls and plays the server.

use crate::client::Channel;
use crate::codec::RpcMessage;
use crate::descriptor::{full_method_name, Cardinality, Descriptors};
use crate::error::FixtureError;
use crate::handler::{ChannelHandler, ChannelRpcHandler};
use crate::metadata::{fuss_with_metadata, Metadata};
use crate::state::{RpcState, ServerRpcRead};
use bytes::Bytes;
use grpc_double_core::{CallId, Clock};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tonic::Code;
use tracing::{debug, trace};

/// Calls invoked by the application, queued per full method name until test
/// code takes them.
struct PendingCalls {
    descriptors: Arc<Descriptors>,
    clock: Arc<dyn Clock>,
    pending: Mutex<HashMap<String, VecDeque<Arc<RpcState>>>>,
    arrived: Condvar,
}

impl PendingCalls {
    fn take(&self, full_name: &str) -> Arc<RpcState> {
        let mut pending = self.pending.lock();
        loop {
            if let Some(state) = pending.get_mut(full_name).and_then(VecDeque::pop_front) {
                trace!(call_id = %state.call_id(), method = %full_name, "Call taken");
                return state;
            }
            self.arrived.wait(&mut pending);
        }
    }
}

impl ChannelHandler for PendingCalls {
    fn invoke_rpc(
        &self,
        full_method_name: &str,
        invocation_metadata: Metadata,
        requests: Vec<Bytes>,
        requests_closed: bool,
        timeout: Option<Duration>,
    ) -> Result<Arc<dyn ChannelRpcHandler>, FixtureError> {
        self.descriptors.method_by_full_name(full_method_name)?;

        let state = RpcState::new(full_method_name, invocation_metadata, requests, requests_closed);
        let state = Arc::new(match timeout {
            Some(timeout) => {
                let deadline = self.clock.now() + timeout;
                state.with_deadline(self.clock.clone(), deadline)
            }
            None => state,
        });

        self.pending
            .lock()
            .entry(full_method_name.to_string())
            .or_default()
            .push_back(state.clone());
        self.arrived.notify_all();
        Ok(state)
    }
}

/// Hands the application a [`Channel`] and the test the calls made on it.
///
/// Calls on one method are taken in the order they were invoked. Taking a
/// call blocks until the application invokes one.
#[derive(Clone)]
pub struct ChannelFixture {
    calls: Arc<PendingCalls>,
}

impl ChannelFixture {
    pub fn new(descriptors: Descriptors, clock: Arc<dyn Clock>) -> Self {
        Self {
            calls: Arc::new(PendingCalls {
                descriptors: Arc::new(descriptors),
                clock,
                pending: Mutex::new(HashMap::new()),
                arrived: Condvar::new(),
            }),
        }
    }

    /// A channel whose calls land in this fixture.
    pub fn channel(&self) -> Channel {
        Channel::new(self.calls.clone())
    }

    pub fn descriptors(&self) -> &Descriptors {
        &self.calls.descriptors
    }

    /// Take the earliest pending call on `(service, method)`, waiting for one
    /// if there is none yet.
    pub fn take_rpc(&self, service: &str, method: &str) -> Result<ChannelRpc, FixtureError> {
        self.calls.descriptors.method(service, method)?;
        Ok(ChannelRpc {
            state: self.calls.take(&full_method_name(service, method)),
        })
    }

    /// Take a unary-unary call along with its invocation metadata and request.
    pub fn take_unary_unary<Req: RpcMessage>(
        &self,
        service: &str,
        method: &str,
    ) -> Result<(Metadata, Req, ChannelRpc), FixtureError> {
        self.take_with_request(service, method, Cardinality::UnaryUnary)
    }

    pub fn take_unary_stream<Req: RpcMessage>(
        &self,
        service: &str,
        method: &str,
    ) -> Result<(Metadata, Req, ChannelRpc), FixtureError> {
        self.take_with_request(service, method, Cardinality::UnaryStream)
    }

    pub fn take_stream_unary(&self, service: &str, method: &str) -> Result<(Metadata, ChannelRpc), FixtureError> {
        self.take_streaming(service, method, Cardinality::StreamUnary)
    }

    pub fn take_stream_stream(&self, service: &str, method: &str) -> Result<(Metadata, ChannelRpc), FixtureError> {
        self.take_streaming(service, method, Cardinality::StreamStream)
    }

    fn take_with_request<Req: RpcMessage>(
        &self,
        service: &str,
        method: &str,
        cardinality: Cardinality,
    ) -> Result<(Metadata, Req, ChannelRpc), FixtureError> {
        let (metadata, rpc) = self.take_streaming(service, method, cardinality)?;
        let request = rpc.take_request()?;
        Ok((metadata, request, rpc))
    }

    fn take_streaming(
        &self,
        service: &str,
        method: &str,
        cardinality: Cardinality,
    ) -> Result<(Metadata, ChannelRpc), FixtureError> {
        self.calls
            .descriptors
            .expect_cardinality(service, method, cardinality)?;
        let rpc = self.take_rpc(service, method)?;
        Ok((rpc.invocation_metadata(), rpc))
    }
}

impl fmt::Debug for ChannelFixture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pending: usize = self.calls.pending.lock().values().map(VecDeque::len).sum();
        f.debug_struct("ChannelFixture").field("pending", &pending).finish()
    }
}

/// Test code's handle on a call invoked by the application.
pub struct ChannelRpc {
    state: Arc<RpcState>,
}

impl ChannelRpc {
    pub fn call_id(&self) -> CallId {
        self.state.call_id()
    }

    pub fn invocation_metadata(&self) -> Metadata {
        self.state.invocation_metadata()
    }

    pub fn send_initial_metadata(&self, metadata: &Metadata) -> Result<(), FixtureError> {
        self.state.send_initial_metadata(fuss_with_metadata(Some(metadata)))
    }

    /// Next request from the application. Blocks until one arrives.
    pub fn take_request<Req: RpcMessage>(&self) -> Result<Req, FixtureError> {
        match self.state.take_request() {
            ServerRpcRead::Request(request) => Ok(Req::decode_message(request)?),
            ServerRpcRead::NoMoreRequests => Err(FixtureError::NoMoreRequests),
            ServerRpcRead::Terminated => Err(FixtureError::Terminated(self.state.termination().code)),
        }
    }

    pub fn send_response<Resp: RpcMessage>(&self, response: &Resp) -> Result<(), FixtureError> {
        self.state.add_response(response.encode_message()?);
        Ok(())
    }

    /// Block until the application closes its request stream and every
    /// request has been taken, or the call ends.
    pub fn no_more_requests(&self) {
        self.state.wait_for_requests_closed()
    }

    /// Block until the application cancels the call.
    pub fn cancelled(&self) -> Result<(), FixtureError> {
        self.state.wait_for_cancellation()
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn time_remaining(&self) -> Option<Duration> {
        self.state.time_remaining()
    }

    /// End the call. Returns `false` if it had already ended.
    pub fn terminate(&self, trailing_metadata: &Metadata, code: Code, details: &str) -> bool {
        let terminated = self
            .state
            .send_termination(fuss_with_metadata(Some(trailing_metadata)), code, details);
        debug!(call_id = %self.state.call_id(), ?code, terminated, "Test terminated call");
        terminated
    }

    /// Send the single response of a unary-response call and end it.
    pub fn terminate_with_response<Resp: RpcMessage>(
        &self,
        response: &Resp,
        trailing_metadata: &Metadata,
        code: Code,
        details: &str,
    ) -> Result<bool, FixtureError> {
        self.send_response(response)?;
        Ok(self.terminate(trailing_metadata, code, details))
    }
}

impl fmt::Debug for ChannelRpc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ChannelRpc").field(&self.state).finish()
    }
}
