//! `grpc-double-tonic` provides in-process test doubles for gRPC-style RPC
//! code, speaking tonic's `Code`/`Status` vocabulary.
//!
//! There are three fixtures, one per side of a call that test code may want
//! to play:
//! - [`ChannelFixture`]: application code calls through a [`Channel`]; the
//!   test takes each call ([`ChannelRpc`]) and plays the server.
//! - [`ServerFixture`]: the test invokes calls ([`ServerRpc`]) against real
//!   service implementations registered in a [`Router`].
//! - [`Connection`]: application client code calls application service code
//!   directly.
//!
//! Every call is one [`RpcState`] shared by both sides. Timeouts are enforced
//! on a [`Clock`](grpc_double_core::Clock), so a test driving a
//! [`SimulatedClock`](grpc_double_core::SimulatedClock) decides exactly when a
//! deadline passes.
//!
//! This crate does **not** implement HTTP/2 or gRPC framing. Messages cross the
//! simulated wire as encoded bytes, so codec failures behave as they would in
//! a real call.

pub mod channel;
pub mod client;
pub mod codec;
pub mod connection;
pub mod context;
pub mod descriptor;
pub mod error;
pub mod handler;
pub mod metadata;
pub mod router;
pub mod server;
pub mod state;
pub mod stream;

pub use channel::{ChannelFixture, ChannelRpc};
pub use client::{
    Call, CallOptions, Channel, FutureCall, ResponseIterator, StreamStreamMultiCallable,
    StreamUnaryMultiCallable, UnaryStreamMultiCallable, UnaryUnaryMultiCallable,
};
pub use codec::{Json, RpcMessage};
pub use connection::Connection;
pub use context::ServicerContext;
pub use descriptor::{
    full_method_name, split_full_method_name, Cardinality, Descriptors, MethodDescriptor,
    ServiceDescriptor,
};
pub use error::{CodecError, FixtureError, RpcError};
pub use handler::{ChannelHandler, ChannelRpcHandler, ServerRpcHandler};
pub use metadata::{fuss_with_metadata, fussed_empty_metadata, Metadata};
pub use router::Router;
pub use server::{ServerBuilder, ServerFixture, ServerRpc};
pub use state::{ChannelRpcRead, RpcState, ServerRpcRead, Termination};
pub use stream::{response_stream, RequestIterator, ResponseStream};

pub use tonic::{Code, Status};
