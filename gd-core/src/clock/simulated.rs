use super::queue::TimerQueue;
use super::{Behavior, Clock, ScheduledCall};
use crate::logging::clock_span;
use crate::SimTime;
use parking_lot::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, trace};

struct SimulatedState {
    now: SimTime,
    queue: TimerQueue,
}

/// A clock whose time only advances inside [`Clock::sleep_for`] and
/// [`Clock::sleep_until`].
///
/// Advancing fires every scheduled behavior that comes due, in target-time
/// order, on the sleeping thread and before the sleep returns. While a
/// behavior runs, [`Clock::now`] reads that behavior's target time.
///
/// Behaviors scheduled at or before the current time are not run inline by
/// [`Clock::call_at`]; they fire on the next sleep, even a zero-length one.
///
/// # Example
///
/// ```
/// # use grpc_double_core::{Clock, SimTime, SimulatedClock};
/// # use std::sync::atomic::{AtomicBool, Ordering};
/// # use std::sync::Arc;
/// # use std::time::Duration;
/// let clock = SimulatedClock::new(SimTime::zero());
/// let fired = Arc::new(AtomicBool::new(false));
/// let flag = fired.clone();
/// clock.call_in(Duration::from_secs(1), Box::new(move || flag.store(true, Ordering::SeqCst)));
///
/// clock.sleep_for(Duration::from_millis(999));
/// assert!(!fired.load(Ordering::SeqCst));
/// clock.sleep_for(Duration::from_millis(1));
/// assert!(fired.load(Ordering::SeqCst));
/// ```
pub struct SimulatedClock {
    state: Mutex<SimulatedState>,
}

impl SimulatedClock {
    pub fn new(start: SimTime) -> Self {
        Self {
            state: Mutex::new(SimulatedState {
                now: start,
                queue: TimerQueue::default(),
            }),
        }
    }

    /// A simulated clock whose timeline starts at the current Unix time.
    pub fn starting_now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self::new(SimTime::from_duration(since_epoch))
    }

    /// Number of scheduled behaviors that have neither fired nor been
    /// cancelled.
    pub fn pending(&self) -> usize {
        self.state.lock().queue.live()
    }
}

impl Default for SimulatedClock {
    fn default() -> Self {
        Self::new(SimTime::zero())
    }
}

impl Clock for SimulatedClock {
    fn now(&self) -> SimTime {
        self.state.lock().now
    }

    fn call_at(&self, at: SimTime, behavior: Behavior) -> ScheduledCall {
        let call = ScheduledCall::new(at, behavior);
        let mut state = self.state.lock();
        trace!(at = %at, now = %state.now, "Scheduling simulated call");
        state.queue.push(call.clone());
        call
    }

    fn sleep_until(&self, target: SimTime) {
        let _span = clock_span("simulated").entered();
        let mut fired = 0usize;
        let now = loop {
            // The lock is released before firing so behaviors may read the
            // clock or schedule further behaviors.
            let call = {
                let mut state = self.state.lock();
                match state.queue.pop_due(target) {
                    Some(call) => {
                        if call.at() > state.now {
                            state.now = call.at();
                        }
                        call
                    }
                    None => {
                        if target > state.now {
                            state.now = target;
                        }
                        break state.now;
                    }
                }
            };

            if call.fire() {
                fired += 1;
            }
        };
        debug!(%now, fired, "Simulated clock advanced");
    }
}
