//! The channel surface application code calls through.
//!
//! A [`Channel`] hands out one multi-callable per method. Unary-response
//! callables offer a blocking call, a blocking call that also returns the
//! [`Call`] object, and a [`FutureCall`]. Stream-response callables return a
//! [`ResponseIterator`]. All of them sit on the same two handler operations:
//! take the next response, then wait for the status.

use crate::codec::RpcMessage;
use crate::error::{FixtureError, RpcError};
use crate::handler::{ChannelHandler, ChannelRpcHandler};
use crate::metadata::{fuss_with_metadata, Metadata};
use crate::state::ChannelRpcRead;
use bytes::Bytes;
use grpc_double_core::{panic_message, CallId};
use parking_lot::Mutex;
use std::fmt;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tonic::Code;
use tracing::{debug, error};

const LOCALLY_CANCELLED: &str = "Locally cancelled!";
const REQUEST_ITERATION_FAILED: &str = "Exception iterating requests!";

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub timeout: Option<Duration>,
    pub metadata: Option<Metadata>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// In-process stand-in for an RPC channel.
#[derive(Clone)]
pub struct Channel {
    handler: Arc<dyn ChannelHandler>,
}

impl Channel {
    /// A channel whose calls are created by `handler`.
    pub fn new(handler: Arc<dyn ChannelHandler>) -> Self {
        Self { handler }
    }

    /// `method` is the full `/service/method` path.
    pub fn unary_unary<Req, Resp>(&self, method: impl Into<String>) -> UnaryUnaryMultiCallable<Req, Resp> {
        UnaryUnaryMultiCallable {
            target: Target::new(self, method),
            _types: PhantomData,
        }
    }

    pub fn unary_stream<Req, Resp>(&self, method: impl Into<String>) -> UnaryStreamMultiCallable<Req, Resp> {
        UnaryStreamMultiCallable {
            target: Target::new(self, method),
            _types: PhantomData,
        }
    }

    pub fn stream_unary<Req, Resp>(&self, method: impl Into<String>) -> StreamUnaryMultiCallable<Req, Resp> {
        StreamUnaryMultiCallable {
            target: Target::new(self, method),
            _types: PhantomData,
        }
    }

    pub fn stream_stream<Req, Resp>(&self, method: impl Into<String>) -> StreamStreamMultiCallable<Req, Resp> {
        StreamStreamMultiCallable {
            target: Target::new(self, method),
            _types: PhantomData,
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").finish_non_exhaustive()
    }
}

#[derive(Clone)]
struct Target {
    handler: Arc<dyn ChannelHandler>,
    method: String,
}

impl Target {
    fn new(channel: &Channel, method: impl Into<String>) -> Self {
        Self {
            handler: channel.handler.clone(),
            method: method.into(),
        }
    }

    fn invoke_unary<Req: RpcMessage>(
        &self,
        request: &Req,
        options: CallOptions,
    ) -> Result<Arc<dyn ChannelRpcHandler>, RpcError> {
        let request = request.encode_message().map_err(FixtureError::from)?;
        self.invoke(vec![request], true, options)
    }

    fn invoke_streaming<Req, I>(
        &self,
        requests: I,
        options: CallOptions,
    ) -> Result<Arc<dyn ChannelRpcHandler>, RpcError>
    where
        Req: RpcMessage,
        I: IntoIterator<Item = Req>,
        I::IntoIter: Send + 'static,
    {
        let handler = self.invoke(Vec::new(), false, options)?;
        consume_requests(requests.into_iter(), handler.clone());
        Ok(handler)
    }

    fn invoke(
        &self,
        requests: Vec<Bytes>,
        requests_closed: bool,
        options: CallOptions,
    ) -> Result<Arc<dyn ChannelRpcHandler>, RpcError> {
        let metadata = fuss_with_metadata(options.metadata.as_ref());
        let handler = self.handler.invoke_rpc(
            &self.method,
            metadata,
            requests,
            requests_closed,
            options.timeout,
        )?;
        debug!(call_id = %handler.call_id(), method = %self.method, "Call invoked");
        Ok(handler)
    }
}

/// Feed `requests` into the call from a background thread.
///
/// A panicking iterator or an unencodable request cancels the call with
/// `UNKNOWN`; running out of requests closes the request stream.
fn consume_requests<Req, I>(requests: I, handler: Arc<dyn ChannelRpcHandler>)
where
    Req: RpcMessage,
    I: Iterator<Item = Req> + Send + 'static,
{
    let call_id = handler.call_id();
    let feeder = handler.clone();
    let spawned = thread::Builder::new()
        .name("grpc-double-requests".to_string())
        .spawn(move || {
            let mut requests = requests;
            loop {
                match panic::catch_unwind(AssertUnwindSafe(|| requests.next())) {
                    Ok(Some(request)) => {
                        let request = match request.encode_message() {
                            Ok(request) => request,
                            Err(e) => {
                                error!(call_id = %call_id, error = %e, "{REQUEST_ITERATION_FAILED}");
                                feeder.cancel(Code::Unknown, REQUEST_ITERATION_FAILED);
                                return;
                            }
                        };
                        if !feeder.add_request(request) {
                            return;
                        }
                    }
                    Ok(None) => {
                        feeder.close_requests();
                        return;
                    }
                    Err(panic) => {
                        error!(
                            call_id = %call_id,
                            panic = %panic_message(panic.as_ref()),
                            "{REQUEST_ITERATION_FAILED}"
                        );
                        feeder.cancel(Code::Unknown, REQUEST_ITERATION_FAILED);
                        return;
                    }
                }
            }
        });

    if let Err(e) = spawned {
        error!(call_id = %call_id, error = %e, "Failed to spawn request thread");
        handler.cancel(Code::Unknown, REQUEST_ITERATION_FAILED);
    }
}

fn rpc_error(handler: &dyn ChannelRpcHandler) -> RpcError {
    let termination = handler.termination();
    RpcError::from_termination(handler.initial_metadata(), termination)
}

fn decode_response<Resp: RpcMessage>(
    handler: &dyn ChannelRpcHandler,
    response: Bytes,
) -> Result<Resp, RpcError> {
    Resp::decode_message(response).map_err(|e| {
        let details = "Exception deserializing response!";
        error!(call_id = %handler.call_id(), error = %e, "{details}");
        if handler.cancel(Code::Unknown, details) {
            rpc_error(handler)
        } else {
            // The call already completed; report the local failure anyway.
            RpcError::new(Code::Unknown, details)
        }
    })
}

/// Take the single response and wait for the status.
fn blocking_unary_response<Resp: RpcMessage>(
    handler: &dyn ChannelRpcHandler,
) -> Result<Resp, RpcError> {
    match handler.take_response() {
        ChannelRpcRead::Response(response) => {
            let termination = handler.termination();
            if termination.is_ok() {
                decode_response(handler, response)
            } else {
                Err(RpcError::from_termination(handler.initial_metadata(), termination))
            }
        }
        ChannelRpcRead::Terminated(termination) => Err(RpcError::from_termination(
            handler.initial_metadata(),
            termination,
        )),
    }
}

/// Call object: control over and status of one invoked call.
#[derive(Clone)]
pub struct Call {
    handler: Arc<dyn ChannelRpcHandler>,
}

impl Call {
    fn new(handler: Arc<dyn ChannelRpcHandler>) -> Self {
        Self { handler }
    }

    pub fn call_id(&self) -> CallId {
        self.handler.call_id()
    }

    /// Cancel with `CANCELLED`. Returns `false` if the call already ended.
    pub fn cancel(&self) -> bool {
        self.handler.cancel(Code::Cancelled, LOCALLY_CANCELLED)
    }

    pub fn is_active(&self) -> bool {
        self.handler.is_active()
    }

    pub fn time_remaining(&self) -> Option<Duration> {
        self.handler.time_remaining()
    }

    /// Register a callback run when the call terminates. Returns `false`,
    /// dropping the callback, if the call already terminated.
    pub fn add_callback(&self, callback: impl FnOnce() + Send + 'static) -> bool {
        self.handler.add_callback(Box::new(callback)).is_ok()
    }

    pub fn initial_metadata(&self) -> Metadata {
        self.handler.initial_metadata()
    }

    /// Blocks until the call terminates.
    pub fn trailing_metadata(&self) -> Metadata {
        self.handler.termination().trailing_metadata
    }

    /// Blocks until the call terminates.
    pub fn code(&self) -> Code {
        self.handler.termination().code
    }

    /// Blocks until the call terminates.
    pub fn details(&self) -> String {
        self.handler.termination().details
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("id", &self.handler.call_id())
            .field("active", &self.handler.is_active())
            .finish()
    }
}

/// Responses of a stream-response call, in order.
///
/// Yields `Err` once if the call ends with a non-OK status, then `None`.
pub struct ResponseIterator<Resp> {
    call: Call,
    finished: bool,
    _resp: PhantomData<fn() -> Resp>,
}

impl<Resp> ResponseIterator<Resp> {
    fn new(handler: Arc<dyn ChannelRpcHandler>) -> Self {
        Self {
            call: Call::new(handler),
            finished: false,
            _resp: PhantomData,
        }
    }

    pub fn call(&self) -> &Call {
        &self.call
    }

    pub fn cancel(&self) -> bool {
        self.call.cancel()
    }
}

impl<Resp: RpcMessage> Iterator for ResponseIterator<Resp> {
    type Item = Result<Resp, RpcError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let handler = self.call.handler.as_ref();
        match handler.take_response() {
            ChannelRpcRead::Response(response) => {
                let decoded = decode_response(handler, response);
                self.finished = decoded.is_err();
                Some(decoded)
            }
            ChannelRpcRead::Terminated(termination) => {
                self.finished = true;
                if termination.is_ok() {
                    None
                } else {
                    Some(Err(RpcError::from_termination(
                        handler.initial_metadata(),
                        termination,
                    )))
                }
            }
        }
    }
}

impl<Resp> fmt::Debug for ResponseIterator<Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseIterator")
            .field("call", &self.call)
            .field("finished", &self.finished)
            .finish()
    }
}

struct FutureState<Resp> {
    outcome: Mutex<Option<Result<Resp, RpcError>>>,
    cancelled: AtomicBool,
}

/// A unary-response call running in the background.
///
/// [`FutureCall::result`] consumes the response at most once and caches the
/// outcome, so repeated calls agree.
pub struct FutureCall<Resp> {
    call: Call,
    state: Arc<FutureState<Resp>>,
}

impl<Resp> Clone for FutureCall<Resp> {
    fn clone(&self) -> Self {
        Self {
            call: self.call.clone(),
            state: self.state.clone(),
        }
    }
}

impl<Resp> FutureCall<Resp> {
    fn new(handler: Arc<dyn ChannelRpcHandler>) -> Self {
        Self {
            call: Call::new(handler),
            state: Arc::new(FutureState {
                outcome: Mutex::new(None),
                cancelled: AtomicBool::new(false),
            }),
        }
    }

    pub fn call(&self) -> &Call {
        &self.call
    }

    pub fn cancel(&self) -> bool {
        if self.call.cancel() {
            self.state.cancelled.store(true, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    /// Whether [`FutureCall::cancel`] succeeded on this future.
    pub fn cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    pub fn running(&self) -> bool {
        self.call.is_active()
    }

    pub fn done(&self) -> bool {
        !self.call.is_active()
    }
}

impl<Resp: RpcMessage + Clone> FutureCall<Resp> {
    /// Block until the call completes.
    pub fn result(&self) -> Result<Resp, RpcError> {
        let mut outcome = self.state.outcome.lock();
        if let Some(outcome) = outcome.as_ref() {
            return outcome.clone();
        }
        let fresh = blocking_unary_response::<Resp>(self.call.handler.as_ref());
        *outcome = Some(fresh.clone());
        fresh
    }

    /// Block until the call completes; the error it failed with, if any.
    pub fn exception(&self) -> Option<RpcError> {
        self.result().err()
    }

    /// Run `callback` once the call is done, immediately if it already is.
    pub fn add_done_callback<F>(&self, callback: F)
    where
        F: FnOnce(&FutureCall<Resp>) + Send + 'static,
        Resp: Send,
    {
        let future = self.clone();
        let wrapped: grpc_double_core::Behavior = Box::new(move || callback(&future));
        if let Err(wrapped) = self.call.handler.add_callback(wrapped) {
            wrapped();
        }
    }
}

impl<Resp> fmt::Debug for FutureCall<Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FutureCall").field("call", &self.call).finish()
    }
}

macro_rules! multi_callable {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        pub struct $name<Req, Resp> {
            target: Target,
            _types: PhantomData<fn(Req) -> Resp>,
        }

        impl<Req, Resp> Clone for $name<Req, Resp> {
            fn clone(&self) -> Self {
                Self {
                    target: self.target.clone(),
                    _types: PhantomData,
                }
            }
        }

        impl<Req, Resp> fmt::Debug for $name<Req, Resp> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("method", &self.target.method)
                    .finish()
            }
        }
    };
}

multi_callable!(
    /// One request, one response.
    UnaryUnaryMultiCallable
);
multi_callable!(
    /// One request, a stream of responses.
    UnaryStreamMultiCallable
);
multi_callable!(
    /// A stream of requests, one response.
    StreamUnaryMultiCallable
);
multi_callable!(
    /// Streams both ways.
    StreamStreamMultiCallable
);

impl<Req: RpcMessage, Resp: RpcMessage> UnaryUnaryMultiCallable<Req, Resp> {
    pub fn call(&self, request: &Req, options: CallOptions) -> Result<Resp, RpcError> {
        let handler = self.target.invoke_unary(request, options)?;
        blocking_unary_response(handler.as_ref())
    }

    pub fn with_call(&self, request: &Req, options: CallOptions) -> Result<(Resp, Call), RpcError> {
        let handler = self.target.invoke_unary(request, options)?;
        let response = blocking_unary_response(handler.as_ref())?;
        Ok((response, Call::new(handler)))
    }

    /// Start the call without waiting. Each [`FutureCall::result`] returns
    /// its own copy of the response.
    pub fn future(&self, request: &Req, options: CallOptions) -> Result<FutureCall<Resp>, RpcError>
    where
        Resp: Clone,
    {
        let handler = self.target.invoke_unary(request, options)?;
        Ok(FutureCall::new(handler))
    }
}

impl<Req: RpcMessage, Resp: RpcMessage> UnaryStreamMultiCallable<Req, Resp> {
    pub fn call(&self, request: &Req, options: CallOptions) -> Result<ResponseIterator<Resp>, RpcError> {
        let handler = self.target.invoke_unary(request, options)?;
        Ok(ResponseIterator::new(handler))
    }
}

impl<Req: RpcMessage, Resp: RpcMessage> StreamUnaryMultiCallable<Req, Resp> {
    pub fn call<I>(&self, requests: I, options: CallOptions) -> Result<Resp, RpcError>
    where
        I: IntoIterator<Item = Req>,
        I::IntoIter: Send + 'static,
    {
        let handler = self.target.invoke_streaming(requests, options)?;
        blocking_unary_response(handler.as_ref())
    }

    pub fn with_call<I>(&self, requests: I, options: CallOptions) -> Result<(Resp, Call), RpcError>
    where
        I: IntoIterator<Item = Req>,
        I::IntoIter: Send + 'static,
    {
        let handler = self.target.invoke_streaming(requests, options)?;
        let response = blocking_unary_response(handler.as_ref())?;
        Ok((response, Call::new(handler)))
    }

    pub fn future<I>(&self, requests: I, options: CallOptions) -> Result<FutureCall<Resp>, RpcError>
    where
        Resp: Clone,
        I: IntoIterator<Item = Req>,
        I::IntoIter: Send + 'static,
    {
        let handler = self.target.invoke_streaming(requests, options)?;
        Ok(FutureCall::new(handler))
    }
}

impl<Req: RpcMessage, Resp: RpcMessage> StreamStreamMultiCallable<Req, Resp> {
    pub fn call<I>(&self, requests: I, options: CallOptions) -> Result<ResponseIterator<Resp>, RpcError>
    where
        I: IntoIterator<Item = Req>,
        I::IntoIter: Send + 'static,
    {
        let handler = self.target.invoke_streaming(requests, options)?;
        Ok(ResponseIterator::new(handler))
    }
}
