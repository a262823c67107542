use grpc_double_core::{Clock, RealClock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

#[test]
fn call_in_fires_after_the_delay() {
    let clock = RealClock::new().unwrap();
    let (tx, rx) = mpsc::channel();
    let scheduled_at = clock.now();
    let call = clock.call_in(
        Duration::from_millis(20),
        Box::new(move || {
            let _ = tx.send(());
        }),
    );

    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(clock.now() >= scheduled_at + Duration::from_millis(20));
    // The timer thread marks the call done right after the behavior returns.
    while !call.done() {
        std::thread::yield_now();
    }
    assert!(!call.cancelled());
}

#[test]
fn cancelled_call_does_not_fire() {
    let clock = RealClock::new().unwrap();
    let fired = Arc::new(AtomicBool::new(false));
    let flag = fired.clone();
    let call = clock.call_in(
        Duration::from_millis(30),
        Box::new(move || flag.store(true, Ordering::SeqCst)),
    );

    assert!(call.cancel());
    clock.sleep_for(Duration::from_millis(80));
    assert!(!fired.load(Ordering::SeqCst));
    assert!(call.cancelled());
}

#[test]
fn earlier_call_scheduled_later_still_fires_first() {
    let clock = RealClock::new().unwrap();
    let (tx, rx) = mpsc::channel();

    let late_tx = tx.clone();
    clock.call_in(
        Duration::from_millis(300),
        Box::new(move || {
            let _ = late_tx.send("late");
        }),
    );
    clock.call_in(
        Duration::from_millis(10),
        Box::new(move || {
            let _ = tx.send("early");
        }),
    );

    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "early");
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "late");
}
