//! Structured logging for fixture-driven tests
//!
//! Fixtures log through `tracing`. Nothing is printed unless a subscriber is
//! installed, which is what the functions in this module do.
//!
//! # Controlling output
//!
//! ```bash
//! # Default (info level)
//! cargo test
//!
//! # Watch every call state transition
//! RUST_LOG=grpc_double_tonic=trace cargo test -- --nocapture
//!
//! # Clock scheduling only
//! RUST_LOG=grpc_double_core::clock=debug cargo test -- --nocapture
//! ```
//!
//! Level guidelines used across the workspace:
//! - **TRACE**: per-message queue traffic and clock scheduling
//! - **DEBUG**: call lifecycle (invoked, terminated, deadline armed)
//! - **WARN**: misuse that is tolerated, e.g. responses added after termination
//! - **ERROR**: faults converted into a terminal status (panics, codec failures)
//!
//! Every initializer is safe to call more than once; only the first call in a
//! process installs a subscriber.

use tracing::{info, Span};
use tracing_subscriber::{filter::EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize logging at `info` unless `RUST_LOG` says otherwise.
pub fn init_fixture_logging() {
    init_fixture_logging_with_level("info")
}

/// Initialize logging with a specific level for the fixture crates.
///
/// # Arguments
/// * `level` - Log level: "trace", "debug", "info", "warn", or "error"
///
/// # Example
/// ```rust
/// use grpc_double_core::logging::init_fixture_logging_with_level;
///
/// init_fixture_logging_with_level("debug");
/// ```
pub fn init_fixture_logging_with_level(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("{level},grpc_double_core={level},grpc_double_tonic={level}").into()
    });

    let installed = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_test_writer()
                .with_target(true)
                .with_thread_names(true)
                .with_level(true),
        )
        .with(filter)
        .try_init()
        .is_ok();

    if installed {
        info!("Fixture logging initialized at level: {}", level);
    }
}

/// Initialize very verbose, pretty-printed logging for debugging a single
/// test.
pub fn init_detailed_fixture_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "trace,grpc_double_core=trace,grpc_double_tonic=trace".into());

    let installed = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_test_writer()
                .with_target(true)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true)
                .pretty(),
        )
        .with(filter)
        .try_init()
        .is_ok();

    if installed {
        info!("Detailed fixture logging initialized");
    }
}

/// Span covering the background work done for one call.
pub fn call_span(method: &str, call_id: &str) -> Span {
    tracing::debug_span!("call", method = method, id = call_id)
}

/// Span covering the background work of a clock (timer thread, callbacks).
pub fn clock_span(kind: &str) -> Span {
    tracing::trace_span!("clock", kind = kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialization_is_repeatable() {
        init_fixture_logging_with_level("debug");
        init_fixture_logging();
        init_detailed_fixture_logging();
        tracing::debug!("still logging");
    }

    #[test]
    fn spans_can_be_entered() {
        let span = call_span("/svc.Echo/Unary", "Call(1)");
        let _guard = span.enter();
        let _clock = clock_span("simulated").entered();
    }
}
