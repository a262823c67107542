//! Points in time as seen by a [`Clock`](crate::Clock)

use crate::error::ClockError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};
use std::time::Duration;

/// A point on a clock's timeline with nanosecond precision.
///
/// `SimTime` is measured from the origin of whichever clock produced it: the
/// moment a [`RealClock`](crate::RealClock) was created, or the start value
/// handed to a [`SimulatedClock`](crate::SimulatedClock). Values from
/// different clocks are not comparable.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SimTime(u64);

impl SimTime {
    /// The origin of the timeline.
    pub const fn zero() -> Self {
        SimTime(0)
    }

    pub const fn from_nanos(nanos: u64) -> Self {
        SimTime(nanos)
    }

    pub const fn from_millis(millis: u64) -> Self {
        SimTime(millis.saturating_mul(1_000_000))
    }

    pub const fn from_secs(secs: u64) -> Self {
        SimTime(secs.saturating_mul(1_000_000_000))
    }

    /// Offset from the origin, saturating at the largest representable time.
    pub fn from_duration(offset: Duration) -> Self {
        SimTime(u64::try_from(offset.as_nanos()).unwrap_or(u64::MAX))
    }

    /// Parse a fractional number of seconds, the unit test code most often
    /// thinks in when it passes timeouts around.
    ///
    /// # Examples
    /// ```
    /// # use grpc_double_core::SimTime;
    /// let t = SimTime::try_from_secs_f64(1.5).unwrap();
    /// assert_eq!(t.as_nanos(), 1_500_000_000);
    /// assert!(SimTime::try_from_secs_f64(-1.0).is_err());
    /// ```
    pub fn try_from_secs_f64(secs: f64) -> Result<Self, ClockError> {
        const MAX_SECS: f64 = (u64::MAX as f64) / 1_000_000_000.0;

        if !secs.is_finite() {
            return Err(ClockError::NonFinite(secs));
        }
        if secs < 0.0 {
            return Err(ClockError::Negative(secs));
        }
        if secs > MAX_SECS {
            return Err(ClockError::Overflow {
                secs,
                max: MAX_SECS,
            });
        }
        Ok(SimTime((secs * 1_000_000_000.0) as u64))
    }

    pub const fn as_nanos(&self) -> u64 {
        self.0
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_nanos(self.0)
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.as_duration().as_secs_f64()
    }

    /// Time elapsed since `earlier`, or zero if `earlier` is in the future.
    pub fn saturating_duration_since(&self, earlier: SimTime) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for SimTime {
    type Output = SimTime;

    fn add(self, rhs: Duration) -> Self::Output {
        SimTime(self.0.saturating_add(SimTime::from_duration(rhs).0))
    }
}

impl Sub<Duration> for SimTime {
    type Output = SimTime;

    fn sub(self, rhs: Duration) -> Self::Output {
        SimTime(self.0.saturating_sub(SimTime::from_duration(rhs).0))
    }
}

impl Sub<SimTime> for SimTime {
    type Output = Duration;

    fn sub(self, rhs: SimTime) -> Self::Output {
        self.saturating_duration_since(rhs)
    }
}

impl fmt::Display for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let duration = self.as_duration();
        let secs = duration.as_secs();
        let millis = duration.subsec_millis();
        let micros = duration.subsec_micros() % 1000;

        if secs > 0 {
            write!(f, "{secs}.{millis:03}s")
        } else if millis > 0 {
            write!(f, "{millis}.{micros:03}ms")
        } else {
            write!(f, "{}ns", self.0)
        }
    }
}
