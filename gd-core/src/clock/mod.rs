//! Virtual clocks.
//!
//! Fixtures never read the system time directly. They go through a [`Clock`],
//! which is either a [`RealClock`] (wall-clock time, real sleeping) or a
//! [`SimulatedClock`] whose time only moves when a test calls
//! [`Clock::sleep_for`] or [`Clock::sleep_until`]. Timeout and deadline
//! behavior under a simulated clock is therefore fully deterministic.
//!
//! Scheduled behaviors are returned as [`ScheduledCall`] handles. Firing and
//! cancelling race on a per-call guard, so a behavior runs at most once and a
//! successful [`ScheduledCall::cancel`] guarantees it never runs.

mod queue;
mod real;
mod simulated;

pub use real::RealClock;
pub use simulated::SimulatedClock;

use crate::SimTime;
use parking_lot::Mutex;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, trace};

/// A behavior scheduled on a clock. Runs at most once, with no arguments.
pub type Behavior = Box<dyn FnOnce() + Send + 'static>;

/// Contract shared by the real and simulated clocks.
pub trait Clock: Send + Sync {
    /// Current time on this clock's timeline.
    fn now(&self) -> SimTime;

    /// Schedule `behavior` to run once, at or after `at`.
    fn call_at(&self, at: SimTime, behavior: Behavior) -> ScheduledCall;

    /// Schedule `behavior` to run once, `delay` after [`Clock::now`].
    fn call_in(&self, delay: Duration, behavior: Behavior) -> ScheduledCall {
        self.call_at(self.now() + delay, behavior)
    }

    /// Block the calling thread for `duration` of this clock's time.
    fn sleep_for(&self, duration: Duration) {
        self.sleep_until(self.now() + duration)
    }

    /// Block the calling thread until this clock reads at least `at`.
    fn sleep_until(&self, at: SimTime);
}

enum Slot {
    Pending(Behavior),
    Running,
    Done,
    Cancelled,
}

struct ScheduledInner {
    at: SimTime,
    slot: Mutex<Slot>,
}

/// Cancellable handle to a behavior scheduled on a [`Clock`].
#[derive(Clone)]
pub struct ScheduledCall {
    inner: Arc<ScheduledInner>,
}

impl ScheduledCall {
    pub(crate) fn new(at: SimTime, behavior: Behavior) -> Self {
        Self {
            inner: Arc::new(ScheduledInner {
                at,
                slot: Mutex::new(Slot::Pending(behavior)),
            }),
        }
    }

    /// The time the behavior was scheduled for.
    pub fn at(&self) -> SimTime {
        self.inner.at
    }

    /// Prevent the behavior from running.
    ///
    /// Returns `true` if the behavior had not started yet and now never will;
    /// `false` if it already started, finished, or was cancelled before.
    pub fn cancel(&self) -> bool {
        let behavior = {
            let mut slot = self.inner.slot.lock();
            match std::mem::replace(&mut *slot, Slot::Cancelled) {
                Slot::Pending(behavior) => behavior,
                other => {
                    *slot = other;
                    return false;
                }
            }
        };
        // Dropped outside the guard: the closure may own arbitrary state.
        drop(behavior);
        trace!(at = %self.inner.at, "Scheduled call cancelled");
        true
    }

    pub fn cancelled(&self) -> bool {
        matches!(*self.inner.slot.lock(), Slot::Cancelled)
    }

    pub fn running(&self) -> bool {
        matches!(*self.inner.slot.lock(), Slot::Running)
    }

    pub fn done(&self) -> bool {
        matches!(*self.inner.slot.lock(), Slot::Done | Slot::Cancelled)
    }

    pub(crate) fn is_live(&self) -> bool {
        matches!(*self.inner.slot.lock(), Slot::Pending(_))
    }

    /// Run the behavior if nobody cancelled it first. Returns whether it ran.
    ///
    /// A panicking behavior is logged and treated as finished; it must not
    /// take down the thread that drives the clock.
    pub(crate) fn fire(&self) -> bool {
        let behavior = {
            let mut slot = self.inner.slot.lock();
            match std::mem::replace(&mut *slot, Slot::Running) {
                Slot::Pending(behavior) => behavior,
                other => {
                    *slot = other;
                    return false;
                }
            }
        };

        trace!(at = %self.inner.at, "Firing scheduled call");
        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(behavior)) {
            error!(
                at = %self.inner.at,
                panic = %panic_message(panic.as_ref()),
                "Scheduled behavior panicked"
            );
        }

        *self.inner.slot.lock() = Slot::Done;
        true
    }
}

impl fmt::Debug for ScheduledCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match *self.inner.slot.lock() {
            Slot::Pending(_) => "pending",
            Slot::Running => "running",
            Slot::Done => "done",
            Slot::Cancelled => "cancelled",
        };
        f.debug_struct("ScheduledCall")
            .field("at", &self.inner.at)
            .field("state", &state)
            .finish()
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
