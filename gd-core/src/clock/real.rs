use super::queue::TimerQueue;
use super::{Behavior, Clock, ScheduledCall};
use crate::error::ClockError;
use crate::logging::clock_span;
use crate::SimTime;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{debug, trace};

struct TimerState {
    queue: TimerQueue,
    shutdown: bool,
}

struct TimerShared {
    origin: Instant,
    state: Mutex<TimerState>,
    wakeup: Condvar,
}

impl TimerShared {
    fn now(&self) -> SimTime {
        SimTime::from_duration(self.origin.elapsed())
    }
}

/// A clock backed by wall-clock time.
///
/// [`Clock::now`] is the time elapsed since the clock was created. Scheduled
/// behaviors run on a timer thread owned by the clock; the thread exits once
/// the clock is dropped.
pub struct RealClock {
    shared: Arc<TimerShared>,
}

impl RealClock {
    pub fn new() -> Result<Self, ClockError> {
        let shared = Arc::new(TimerShared {
            origin: Instant::now(),
            state: Mutex::new(TimerState {
                queue: TimerQueue::default(),
                shutdown: false,
            }),
            wakeup: Condvar::new(),
        });

        let timer = shared.clone();
        thread::Builder::new()
            .name("grpc-double-timer".to_string())
            .spawn(move || run_timer(&timer))
            .map_err(ClockError::TimerThread)?;

        Ok(Self { shared })
    }
}

impl Drop for RealClock {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.wakeup.notify_all();
    }
}

fn run_timer(shared: &TimerShared) {
    let _span = clock_span("real").entered();
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            let abandoned = state.queue.live();
            debug!(abandoned, "Timer thread shutting down");
            return;
        }

        let now = shared.now();
        match state.queue.next_time() {
            Some(at) if at <= now => {
                if let Some(call) = state.queue.pop_due(now) {
                    MutexGuard::unlocked(&mut state, || {
                        call.fire();
                    });
                }
            }
            Some(at) => {
                shared.wakeup.wait_for(&mut state, at - now);
            }
            None => {
                shared.wakeup.wait(&mut state);
            }
        }
    }
}

impl Clock for RealClock {
    fn now(&self) -> SimTime {
        self.shared.now()
    }

    fn call_at(&self, at: SimTime, behavior: Behavior) -> ScheduledCall {
        let call = ScheduledCall::new(at, behavior);
        {
            let mut state = self.shared.state.lock();
            trace!(at = %at, "Scheduling real-time call");
            state.queue.push(call.clone());
        }
        // The new call may be earlier than whatever the timer is waiting for.
        self.shared.wakeup.notify_all();
        call
    }

    fn sleep_until(&self, at: SimTime) {
        let now = self.now();
        if at > now {
            thread::sleep(at - now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn now_is_monotonic() {
        let clock = RealClock::new().unwrap();
        let a = clock.now();
        clock.sleep_for(Duration::from_millis(5));
        let b = clock.now();
        assert!(b >= a + Duration::from_millis(5));
    }

    #[test]
    fn scheduled_behavior_runs_on_the_timer_thread() {
        let clock = RealClock::new().unwrap();
        let (tx, rx) = mpsc::channel();
        clock.call_in(
            Duration::from_millis(10),
            Box::new(move || {
                let _ = tx.send(thread::current().name().map(str::to_string));
            }),
        );

        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("grpc-double-timer"));
    }
}
