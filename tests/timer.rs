//! Timer behavior observed through a running IO manager.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fibrio::io::IoManager;

#[test]
fn recurring_timer_stops_at_cancel() {
    let io = IoManager::new(2, false, "timer_cancel").unwrap();
    let ticks = Arc::new(AtomicUsize::new(0));

    let sink = ticks.clone();
    let timer = io.add_timer(
        100,
        move || {
            sink.fetch_add(1, Ordering::SeqCst);
        },
        true,
    );

    std::thread::sleep(Duration::from_millis(250));
    assert!(timer.cancel());
    let at_cancel = ticks.load(Ordering::SeqCst);
    assert!(
        (2..=3).contains(&at_cancel),
        "expected 2..=3 ticks after 250ms, got {}",
        at_cancel
    );

    std::thread::sleep(Duration::from_millis(250));
    assert_eq!(ticks.load(Ordering::SeqCst), at_cancel);
    io.stop();
}

#[test]
fn conditional_timer_with_dropped_condition_fires_nothing() {
    let io = IoManager::new(1, false, "timer_cond").unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let cond = Arc::new(());
    let sink = hits.clone();
    let _timer = io.add_conditional_timer(
        50,
        move || {
            sink.fetch_add(1, Ordering::SeqCst);
        },
        Arc::downgrade(&cond),
        false,
    );
    drop(cond);

    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    io.stop();
}

#[test]
fn one_shot_timer_fires_once_near_its_deadline() {
    let io = IoManager::new(1, false, "timer_once").unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let sink = hits.clone();
    io.add_timer(
        50,
        move || {
            sink.fetch_add(1, Ordering::SeqCst);
        },
        false,
    );

    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(hits.load(Ordering::SeqCst), 0, "fired before its deadline");
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    io.stop();
}
