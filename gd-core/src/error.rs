//! Error types for the clock layer

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClockError {
    #[error("time value must be finite, got {0}")]
    NonFinite(f64),

    #[error("time value must be non-negative, got {0}")]
    Negative(f64),

    #[error("time value too large: {secs} seconds (max: {max} seconds)")]
    Overflow { secs: f64, max: f64 },

    #[error("failed to start timer thread: {0}")]
    TimerThread(#[source] std::io::Error),
}
