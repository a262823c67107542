//! # grpc-double - in-process gRPC test doubles
//!
//! Test RPC client code against a scripted server, test service code against
//! a scripted client, or wire the two together without a network. Deadlines
//! run on a virtual clock the test advances by hand.
//!
//! ## Quick Start
//!
//! ```toml
//! [dev-dependencies]
//! grpc-double = "0.1"
//! ```
//!
//! ```rust
//! use grpc_double::prelude::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let mut router = Router::new();
//! router.add_unary_unary("demo.Clock", "Wait", |secs: u64, ctx: &ServicerContext| {
//!     while ctx.is_active() {
//!         std::thread::sleep(Duration::from_millis(1));
//!     }
//!     Ok(secs)
//! });
//!
//! let clock = Arc::new(SimulatedClock::default());
//! let fixture = ServerBuilder::new(clock.clone()).add_router(router).build_fixture();
//! let rpc = fixture
//!     .invoke_unary_unary("demo.Clock", "Wait", None, &5u64, Some(Duration::from_secs(1)))
//!     .unwrap();
//!
//! clock.sleep_for(Duration::from_secs(2));
//! assert_eq!(rpc.terminate().code, Code::DeadlineExceeded);
//! ```

pub use grpc_double_core as core;

pub use grpc_double_tonic as tonic;

pub mod prelude {
    //! Commonly used types and traits

    pub use grpc_double_core::{Clock, RealClock, ScheduledCall, SimTime, SimulatedClock};

    pub use grpc_double_tonic::{
        response_stream, CallOptions, Cardinality, Channel, ChannelFixture, ChannelRpc, Code,
        Connection, Descriptors, FixtureError, Json, Metadata, MethodDescriptor, RequestIterator,
        ResponseStream, Router, RpcError, RpcMessage, ServerBuilder, ServerFixture, ServerRpc,
        ServiceDescriptor, ServicerContext, Status,
    };
}
