//! Server fixture: test code plays the client against real service
//! implementations.
//!
//! Each invoked call runs its implementation on a dedicated thread. The
//! dispatch for every cardinality is composed from two steps: resolve the one
//! request of a unary-request method, then drive the implementation's
//! response (or response stream) to completion.

use crate::codec::RpcMessage;
use crate::connection::Connection;
use crate::context::{ServicerContext, CLIENT_INACTIVE};
use crate::descriptor::{full_method_name, Cardinality, Descriptors};
use crate::error::FixtureError;
use crate::handler::ServerRpcHandler;
use crate::metadata::{fuss_with_metadata, Metadata};
use crate::router::{MethodHandler, Responses, Router};
use crate::state::{ChannelRpcRead, RpcState, ServerRpcRead, Termination};
use bytes::Bytes;
use grpc_double_core::{call_span, panic_message, CallId, Clock, SimTime};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tonic::{Code, Status};
use tracing::{debug, error};

const ZERO_REQUESTS: &str = "Cardinality violation: needed one request; got zero!";
const EXTRA_REQUESTS: &str = "Cardinality violation: needed one request; got more than one!";
const LOCALLY_CANCELLED: &str = "Locally cancelled!";

/// Runs service implementations against calls created by someone else.
pub(crate) struct ServerCore {
    router: Router,
    clock: Arc<dyn Clock>,
}

impl ServerCore {
    pub(crate) fn new(router: Router, clock: Arc<dyn Clock>) -> Self {
        Self { router, clock }
    }

    pub(crate) fn descriptors(&self) -> &Descriptors {
        self.router.descriptors()
    }

    pub(crate) fn deadline_for(&self, timeout: Option<Duration>) -> Option<SimTime> {
        timeout.map(|timeout| self.clock.now() + timeout)
    }

    /// Wrap a call state with the deadline a `timeout` implies.
    pub(crate) fn rpc_state(
        &self,
        full_name: &str,
        invocation_metadata: Metadata,
        requests: Vec<Bytes>,
        requests_closed: bool,
        deadline: Option<SimTime>,
    ) -> Arc<RpcState> {
        let state = RpcState::new(full_name, invocation_metadata, requests, requests_closed);
        Arc::new(match deadline {
            Some(at) => state.with_deadline(self.clock.clone(), at),
            None => state,
        })
    }

    /// Start servicing `rpc` with the implementation registered for
    /// `(service, method)`.
    ///
    /// With a deadline, an expiry is scheduled on the clock that terminates
    /// the call with `DEADLINE_EXCEEDED`; completing first cancels it.
    pub(crate) fn invoke(
        &self,
        service: &str,
        method: &str,
        rpc: Arc<dyn ServerRpcHandler>,
        invocation_metadata: &Metadata,
        deadline: Option<SimTime>,
    ) -> Result<(), FixtureError> {
        let (_, handler) = self.router.handler(service, method)?;
        let handler = handler.clone();
        let full_name = full_method_name(service, method);

        let context = ServicerContext::new(
            full_name.clone(),
            rpc,
            self.clock.clone(),
            invocation_metadata,
            deadline,
        );
        context.arm_deadline();

        let span = call_span(&full_name, &context.call_id().to_string());
        let dispatched = context.clone();
        let spawned = thread::Builder::new()
            .name("grpc-double-service".to_string())
            .spawn(move || {
                let _entered = span.enter();
                service_call(handler, dispatched);
            });

        if let Err(source) = spawned {
            error!(call_id = %context.call_id(), error = %source, "Failed to spawn service thread");
            context.abort(Code::Internal, "Failed to start service thread!");
            return Err(FixtureError::Thread {
                name: "service",
                source,
            });
        }
        debug!(call_id = %context.call_id(), method = %full_name, ?deadline, "Call dispatched");
        Ok(())
    }
}

fn service_call(handler: MethodHandler, context: ServicerContext) {
    match handler {
        MethodHandler::UnaryUnary(implementation) => {
            if let Some(request) = unary_request(&context) {
                unary_response(&context, || implementation(request, &context));
            }
        }
        MethodHandler::UnaryStream(implementation) => {
            if let Some(request) = unary_request(&context) {
                stream_response(&context, || implementation(request, &context));
            }
        }
        MethodHandler::StreamUnary(implementation) => {
            unary_response(&context, || implementation(&context));
        }
        MethodHandler::StreamStream(implementation) => {
            stream_response(&context, || implementation(&context));
        }
    }
}

/// The single request of a unary-request call, or `None` after terminating
/// the call because there was not exactly one.
fn unary_request(context: &ServicerContext) -> Option<Bytes> {
    let request = match context.take_request() {
        ServerRpcRead::Request(request) => request,
        ServerRpcRead::NoMoreRequests => {
            context.abort(Code::Unimplemented, ZERO_REQUESTS);
            return None;
        }
        ServerRpcRead::Terminated => {
            context.abort(Code::Unknown, CLIENT_INACTIVE);
            return None;
        }
    };

    match context.take_request() {
        ServerRpcRead::NoMoreRequests => Some(request),
        ServerRpcRead::Request(_) => {
            context.abort(Code::Unimplemented, EXTRA_REQUESTS);
            None
        }
        ServerRpcRead::Terminated => {
            context.abort(Code::Unknown, CLIENT_INACTIVE);
            None
        }
    }
}

fn application_failed(context: &ServicerContext, what: &str, panic: Box<dyn std::any::Any + Send>) {
    let details = format!("{what}: {}", panic_message(panic.as_ref()));
    error!(call_id = %context.call_id(), method = %context.method(), "{details}");
    context.abort(Code::Unknown, &details);
}

fn returned_status(context: &ServicerContext, status: Status) {
    debug!(call_id = %context.call_id(), code = ?status.code(), "Application returned a status");
    context.fail(status.code(), status.message());
}

fn unary_response<F>(context: &ServicerContext, produce: F)
where
    F: FnOnce() -> Result<Bytes, Status>,
{
    match panic::catch_unwind(AssertUnwindSafe(produce)) {
        Ok(Ok(response)) => {
            context.send_response(response);
            context.complete();
        }
        Ok(Err(status)) => returned_status(context, status),
        Err(panic) => application_failed(context, "Exception calling application", panic),
    }
}

fn stream_response<F>(context: &ServicerContext, produce: F)
where
    F: FnOnce() -> Result<Responses, Status>,
{
    let mut responses = match panic::catch_unwind(AssertUnwindSafe(produce)) {
        Ok(Ok(responses)) => responses,
        Ok(Err(status)) => return returned_status(context, status),
        Err(panic) => return application_failed(context, "Exception calling application", panic),
    };

    loop {
        match panic::catch_unwind(AssertUnwindSafe(|| responses.next())) {
            Ok(Some(Ok(response))) => {
                if !context.is_active() {
                    return;
                }
                context.send_response(response);
            }
            Ok(Some(Err(status))) => return returned_status(context, status),
            Ok(None) => return context.complete(),
            Err(panic) => return application_failed(context, "Exception iterating responses", panic),
        }
    }
}

/// Test code's handle on a call serviced by the application.
pub struct ServerRpc {
    state: Arc<RpcState>,
}

impl ServerRpc {
    pub fn call_id(&self) -> CallId {
        self.state.call_id()
    }

    /// Blocks until the application sends initial metadata or the call ends.
    pub fn initial_metadata(&self) -> Metadata {
        self.state.initial_metadata()
    }

    /// Returns `false` if the request stream is closed or the call is over.
    pub fn send_request<Req: RpcMessage>(&self, request: &Req) -> Result<bool, FixtureError> {
        Ok(self.state.add_request(request.encode_message()?))
    }

    pub fn no_more_requests(&self) {
        self.state.close_requests()
    }

    /// Next response; [`FixtureError::NoMoreResponses`] once the call is over
    /// and every response has been taken.
    pub fn take_response<Resp: RpcMessage>(&self) -> Result<Resp, FixtureError> {
        match self.state.take_response() {
            ChannelRpcRead::Response(response) => Ok(Resp::decode_message(response)?),
            ChannelRpcRead::Terminated(_) => Err(FixtureError::NoMoreResponses),
        }
    }

    /// Cancel the call as a client would.
    pub fn cancel(&self) -> bool {
        self.state.cancel(Code::Cancelled, LOCALLY_CANCELLED)
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn time_remaining(&self) -> Option<Duration> {
        self.state.time_remaining()
    }

    /// Blocks until the call ends.
    pub fn terminate(&self) -> Termination {
        self.state.termination()
    }

    /// For unary-response methods: the response, if any, and the status.
    pub fn terminate_unary<Resp: RpcMessage>(&self) -> Result<(Option<Resp>, Termination), FixtureError> {
        match self.state.take_response() {
            ChannelRpcRead::Response(response) => {
                let response = Resp::decode_message(response)?;
                Ok((Some(response), self.state.termination()))
            }
            ChannelRpcRead::Terminated(termination) => Ok((None, termination)),
        }
    }
}

impl fmt::Debug for ServerRpc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ServerRpc").field(&self.state).finish()
    }
}

/// Invokes calls against the implementations in a [`Router`].
#[derive(Clone)]
pub struct ServerFixture {
    core: Arc<ServerCore>,
}

impl ServerFixture {
    pub fn descriptors(&self) -> &Descriptors {
        self.core.descriptors()
    }

    /// Invoke any method with pre-encoded requests.
    ///
    /// A unary-request method waits for the request stream to close before
    /// the implementation runs, so pass `close_requests = true` or call
    /// [`ServerRpc::no_more_requests`].
    pub fn invoke_rpc(
        &self,
        service: &str,
        method: &str,
        invocation_metadata: Option<&Metadata>,
        requests: Vec<Bytes>,
        close_requests: bool,
        timeout: Option<Duration>,
    ) -> Result<ServerRpc, FixtureError> {
        self.core.descriptors().method(service, method)?;
        let full_name = full_method_name(service, method);
        let invocation_metadata = fuss_with_metadata(invocation_metadata);
        let deadline = self.core.deadline_for(timeout);
        let state = self.core.rpc_state(
            &full_name,
            invocation_metadata.clone(),
            requests,
            close_requests,
            deadline,
        );
        self.core
            .invoke(service, method, state.clone(), &invocation_metadata, deadline)?;
        Ok(ServerRpc { state })
    }

    pub fn invoke_unary_unary<Req: RpcMessage>(
        &self,
        service: &str,
        method: &str,
        invocation_metadata: Option<&Metadata>,
        request: &Req,
        timeout: Option<Duration>,
    ) -> Result<ServerRpc, FixtureError> {
        let request = request.encode_message()?;
        self.invoke_checked(service, method, Cardinality::UnaryUnary, invocation_metadata, Some(request), timeout)
    }

    pub fn invoke_unary_stream<Req: RpcMessage>(
        &self,
        service: &str,
        method: &str,
        invocation_metadata: Option<&Metadata>,
        request: &Req,
        timeout: Option<Duration>,
    ) -> Result<ServerRpc, FixtureError> {
        let request = request.encode_message()?;
        self.invoke_checked(service, method, Cardinality::UnaryStream, invocation_metadata, Some(request), timeout)
    }

    pub fn invoke_stream_unary(
        &self,
        service: &str,
        method: &str,
        invocation_metadata: Option<&Metadata>,
        timeout: Option<Duration>,
    ) -> Result<ServerRpc, FixtureError> {
        self.invoke_checked(service, method, Cardinality::StreamUnary, invocation_metadata, None, timeout)
    }

    pub fn invoke_stream_stream(
        &self,
        service: &str,
        method: &str,
        invocation_metadata: Option<&Metadata>,
        timeout: Option<Duration>,
    ) -> Result<ServerRpc, FixtureError> {
        self.invoke_checked(service, method, Cardinality::StreamStream, invocation_metadata, None, timeout)
    }

    /// A unary-request call is invoked with its request and a closed request
    /// stream; a streaming one with an open, empty stream.
    fn invoke_checked(
        &self,
        service: &str,
        method: &str,
        cardinality: Cardinality,
        invocation_metadata: Option<&Metadata>,
        request: Option<Bytes>,
        timeout: Option<Duration>,
    ) -> Result<ServerRpc, FixtureError> {
        self.core
            .descriptors()
            .expect_cardinality(service, method, cardinality)?;
        match request {
            Some(request) => self.invoke_rpc(service, method, invocation_metadata, vec![request], true, timeout),
            None => self.invoke_rpc(service, method, invocation_metadata, Vec::new(), false, timeout),
        }
    }
}

impl fmt::Debug for ServerFixture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerFixture")
            .field("methods", &self.core.router.list_methods())
            .finish()
    }
}

/// Builder for the fixtures that run real service implementations.
///
/// ```rust
/// # use grpc_double_core::{Clock, SimulatedClock};
/// # use grpc_double_tonic::{Router, ServerBuilder, ServicerContext};
/// # use std::sync::Arc;
/// let mut router = Router::new();
/// router.add_unary_unary("demo.Math", "Double", |n: u64, _ctx: &ServicerContext| Ok(n * 2));
///
/// let clock: Arc<dyn Clock> = Arc::new(SimulatedClock::default());
/// let fixture = ServerBuilder::new(clock).add_router(router).build_fixture();
/// let rpc = fixture
///     .invoke_unary_unary("demo.Math", "Double", None, &21u64, None)
///     .unwrap();
/// let (response, status) = rpc.terminate_unary::<u64>().unwrap();
/// assert_eq!(response, Some(42));
/// assert!(status.is_ok());
/// ```
pub struct ServerBuilder {
    clock: Arc<dyn Clock>,
    router: Router,
}

impl ServerBuilder {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            router: Router::new(),
        }
    }

    #[must_use]
    pub fn add_router(mut self, router: Router) -> Self {
        self.router.merge(router);
        self
    }

    /// A fixture where test code invokes calls directly.
    pub fn build_fixture(self) -> ServerFixture {
        ServerFixture {
            core: Arc::new(ServerCore::new(self.router, self.clock)),
        }
    }

    /// A connection whose channel calls straight into the implementations.
    pub fn build_connection(self) -> Connection {
        Connection::new(Arc::new(ServerCore::new(self.router, self.clock)))
    }
}
