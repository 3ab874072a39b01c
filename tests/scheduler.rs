//! Multi-thread dispatch behavior of the base scheduler.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fibrio::scheduler::{Scheduler, Task};
use fibrio::thread;

#[test]
fn thousand_callbacks_spread_over_four_workers() {
    let appends: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));
    let sched = Scheduler::new(4, false, "dispatch4");
    sched.start().unwrap();

    for _ in 0..1000 {
        let sink = appends.clone();
        sched.schedule(
            Task::call(move || {
                // enough work per task that every worker gets a share
                std::thread::sleep(Duration::from_millis(1));
                sink.lock().unwrap().push(thread::current_id());
            }),
            -1,
        );
    }
    sched.stop();

    let appends = appends.lock().unwrap();
    assert_eq!(appends.len(), 1000);
    let distinct: HashSet<i32> = appends.iter().copied().collect();
    assert_eq!(distinct.len(), 4, "all four workers must have dispatched");
}

#[test]
fn stop_drains_already_queued_tasks() {
    let ran = Arc::new(Mutex::new(0));
    let sched = Scheduler::new(2, false, "drain");
    sched.start().unwrap();
    for _ in 0..64 {
        let sink = ran.clone();
        sched.schedule(Task::call(move || *sink.lock().unwrap() += 1), -1);
    }
    sched.stop();
    assert_eq!(*ran.lock().unwrap(), 64);
}
