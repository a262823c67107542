//! Time and logging foundations for in-process RPC test doubles.
//!
//! This crate provides the pieces of the fixture framework that have nothing
//! to do with RPC itself:
//!
//! - [`SimTime`]: a point on a clock's timeline.
//! - [`Clock`]: the virtual clock contract, with a wall-clock
//!   [`RealClock`] and a fully controllable [`SimulatedClock`].
//! - [`ScheduledCall`]: the cancellable handle returned when scheduling a
//!   behavior on a clock.
//! - [`CallId`]: identifiers used to correlate log lines for one call.
//! - [`logging`]: `tracing-subscriber` setup for tests.
//!
//! # Time model
//!
//! ```rust
//! use grpc_double_core::{Clock, SimTime, SimulatedClock};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let clock: Arc<dyn Clock> = Arc::new(SimulatedClock::new(SimTime::zero()));
//! let expiry = clock.call_in(Duration::from_secs(1), Box::new(|| println!("expired")));
//!
//! // Nothing happens until the test advances time.
//! assert!(expiry.cancel());
//! clock.sleep_for(Duration::from_secs(2));
//! assert_eq!(clock.now(), SimTime::from_secs(2));
//! ```

pub mod clock;
pub mod error;
pub mod ids;
pub mod logging;
pub mod time;

pub use clock::{panic_message, Behavior, Clock, RealClock, ScheduledCall, SimulatedClock};
pub use error::ClockError;
pub use ids::CallId;
pub use logging::{
    call_span, clock_span, init_detailed_fixture_logging, init_fixture_logging,
    init_fixture_logging_with_level,
};
pub use time::SimTime;
