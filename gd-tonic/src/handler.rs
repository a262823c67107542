//! The two directional views of a call.
//!
//! [`ChannelRpcHandler`] is what an invoking side needs: push requests, pull
//! responses, cancel, and wait for the status. [`ServerRpcHandler`] is what a
//! servicing side needs: pull requests, push responses, and terminate.
//! [`RpcState`] implements both, so the same record serves as the pipe
//! between a channel and a server.
//!
//! [`ChannelHandler`] is the seam between the application-facing
//! [`Channel`](crate::Channel) and whatever plays the server: the channel
//! fixture's pending-call queue, or a real service implementation in a
//! connection.

use crate::error::FixtureError;
use crate::metadata::Metadata;
use crate::state::{ChannelRpcRead, RpcState, ServerRpcRead, Termination};
use bytes::Bytes;
use grpc_double_core::{Behavior, CallId};
use std::sync::Arc;
use std::time::Duration;
use tonic::Code;

pub trait ChannelRpcHandler: Send + Sync {
    fn call_id(&self) -> CallId;

    fn initial_metadata(&self) -> Metadata;

    fn add_request(&self, request: Bytes) -> bool;

    fn close_requests(&self);

    fn take_response(&self) -> ChannelRpcRead;

    fn cancel(&self, code: Code, details: &str) -> bool;

    /// Block until the call is terminal.
    fn termination(&self) -> Termination;

    fn is_active(&self) -> bool;

    fn time_remaining(&self) -> Option<Duration>;

    /// Hands the callback back if the call is already terminal.
    fn add_callback(&self, callback: Behavior) -> Result<(), Behavior>;
}

pub trait ServerRpcHandler: Send + Sync {
    fn call_id(&self) -> CallId;

    fn send_initial_metadata(&self, metadata: Metadata) -> Result<(), FixtureError>;

    fn take_request(&self) -> ServerRpcRead;

    fn is_active(&self) -> bool;

    fn add_response(&self, response: Bytes);

    fn send_termination(&self, trailing_metadata: Metadata, code: Code, details: &str) -> bool;
}

/// Creates calls on behalf of a [`Channel`](crate::Channel).
pub trait ChannelHandler: Send + Sync {
    fn invoke_rpc(
        &self,
        full_method_name: &str,
        invocation_metadata: Metadata,
        requests: Vec<Bytes>,
        requests_closed: bool,
        timeout: Option<Duration>,
    ) -> Result<Arc<dyn ChannelRpcHandler>, FixtureError>;
}

impl ChannelRpcHandler for RpcState {
    fn call_id(&self) -> CallId {
        RpcState::call_id(self)
    }

    fn initial_metadata(&self) -> Metadata {
        RpcState::initial_metadata(self)
    }

    fn add_request(&self, request: Bytes) -> bool {
        RpcState::add_request(self, request)
    }

    fn close_requests(&self) {
        RpcState::close_requests(self)
    }

    fn take_response(&self) -> ChannelRpcRead {
        RpcState::take_response(self)
    }

    fn cancel(&self, code: Code, details: &str) -> bool {
        RpcState::cancel(self, code, details)
    }

    fn termination(&self) -> Termination {
        RpcState::termination(self)
    }

    fn is_active(&self) -> bool {
        RpcState::is_active(self)
    }

    fn time_remaining(&self) -> Option<Duration> {
        RpcState::time_remaining(self)
    }

    fn add_callback(&self, callback: Behavior) -> Result<(), Behavior> {
        RpcState::add_callback(self, callback)
    }
}

impl ServerRpcHandler for RpcState {
    fn call_id(&self) -> CallId {
        RpcState::call_id(self)
    }

    fn send_initial_metadata(&self, metadata: Metadata) -> Result<(), FixtureError> {
        RpcState::send_initial_metadata(self, metadata)
    }

    fn take_request(&self) -> ServerRpcRead {
        RpcState::take_request(self)
    }

    fn is_active(&self) -> bool {
        RpcState::is_active(self)
    }

    fn add_response(&self, response: Bytes) {
        RpcState::add_response(self, response)
    }

    fn send_termination(&self, trailing_metadata: Metadata, code: Code, details: &str) -> bool {
        RpcState::send_termination(self, trailing_metadata, code, details)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::fussed_empty_metadata;

    #[test]
    fn both_views_share_one_record() {
        let state = Arc::new(RpcState::new("/svc/M", Metadata::new(), [], false));
        let client: Arc<dyn ChannelRpcHandler> = state.clone();
        let server: Arc<dyn ServerRpcHandler> = state;

        assert!(client.add_request(Bytes::from_static(b"ping")));
        assert_eq!(server.take_request(), ServerRpcRead::Request(Bytes::from_static(b"ping")));

        server.add_response(Bytes::from_static(b"pong"));
        server.send_termination(fussed_empty_metadata(), Code::Ok, "");

        assert_eq!(
            client.take_response(),
            ChannelRpcRead::Response(Bytes::from_static(b"pong"))
        );
        assert!(client.termination().is_ok());
        assert!(!server.is_active());
        assert_eq!(client.call_id(), server.call_id());
    }
}
