//! Reactor behavior: event slots, cancellation, the tickle channel.

use std::os::raw::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fibrio::io::{Event, IoManager};
use fibrio::scheduler::Task;

fn pipe() -> (i32, i32) {
    let mut fds: [libc::c_int; 2] = [0; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    (fds[0], fds[1])
}

fn close_fd(fd: i32) {
    unsafe { libc::close(fd) };
}

fn wait_until(deadline: Duration, mut ready: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if ready() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn pipe_echo_wakes_the_reader() {
    let io = IoManager::new(2, false, "pipe_echo").unwrap();
    let (read_end, write_end) = pipe();

    let result: Arc<Mutex<Option<(isize, u8)>>> = Arc::new(Mutex::new(None));
    let sink = result.clone();
    io.schedule(
        Task::call(move || {
            let mut buf = [0u8; 1];
            let n = unsafe { libc::read(read_end, buf.as_mut_ptr() as *mut c_void, 1) };
            *sink.lock().unwrap() = Some((n, buf[0]));
        }),
        -1,
    );
    io.add_timer(
        10,
        move || {
            let n = unsafe { libc::write(write_end, b"T".as_ptr() as *const c_void, 1) };
            assert_eq!(n, 1);
        },
        false,
    );

    assert!(wait_until(Duration::from_secs(2), || result.lock().unwrap().is_some()));
    let (n, byte) = result.lock().unwrap().unwrap();
    assert_eq!(n, 1);
    assert_eq!(byte, b'T');

    io.stop();
    close_fd(read_end);
    close_fd(write_end);
}

#[test]
fn del_event_disarms_without_firing() {
    let io = IoManager::new(1, false, "del_event").unwrap();
    let (read_end, write_end) = pipe();

    let fired = Arc::new(AtomicUsize::new(0));
    let sink = fired.clone();
    io.add_event(
        read_end,
        Event::READ,
        Some(Box::new(move || {
            sink.fetch_add(1, Ordering::SeqCst);
        })),
    )
    .unwrap();

    assert!(io.del_event(read_end, Event::READ));
    assert!(!io.del_event(read_end, Event::READ));

    // data arriving after the disarm must not wake anything
    let n = unsafe { libc::write(write_end, b"x".as_ptr() as *const c_void, 1) };
    assert_eq!(n, 1);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    // stop() only completes once the pending-event count is back to zero
    io.stop();
    close_fd(read_end);
    close_fd(write_end);
}

#[test]
fn cancel_event_fires_the_handler() {
    let io = IoManager::new(1, false, "cancel_event").unwrap();
    let (read_end, write_end) = pipe();

    let fired = Arc::new(AtomicUsize::new(0));
    let sink = fired.clone();
    io.add_event(
        read_end,
        Event::READ,
        Some(Box::new(move || {
            sink.fetch_add(1, Ordering::SeqCst);
        })),
    )
    .unwrap();

    assert!(io.cancel_event(read_end, Event::READ));
    assert!(wait_until(Duration::from_secs(2), || {
        fired.load(Ordering::SeqCst) == 1
    }));
    assert!(!io.cancel_event(read_end, Event::READ));

    io.stop();
    close_fd(read_end);
    close_fd(write_end);
}

#[test]
fn cancel_all_fires_every_armed_direction() {
    let io = IoManager::new(1, false, "cancel_all").unwrap();
    let (read_end, write_end) = pipe();

    let fired = Arc::new(AtomicUsize::new(0));
    let read_sink = fired.clone();
    io.add_event(
        read_end,
        Event::READ,
        Some(Box::new(move || {
            read_sink.fetch_add(1, Ordering::SeqCst);
        })),
    )
    .unwrap();
    let write_sink = fired.clone();
    io.add_event(
        read_end,
        Event::WRITE,
        Some(Box::new(move || {
            write_sink.fetch_add(1, Ordering::SeqCst);
        })),
    )
    .unwrap();

    assert!(io.cancel_all(read_end));
    assert!(wait_until(Duration::from_secs(2), || {
        fired.load(Ordering::SeqCst) == 2
    }));
    assert!(!io.cancel_all(read_end));

    io.stop();
    close_fd(read_end);
    close_fd(write_end);
}

#[test]
fn tickle_burst_is_idempotent_per_poll() {
    let io = IoManager::new(1, false, "tickle_burst").unwrap();
    let done = Arc::new(AtomicUsize::new(0));

    // every schedule on an empty queue tickles the reactor; the pipe is
    // drained fully per pass, so a burst must not wedge anything
    for _ in 0..100 {
        let sink = done.clone();
        io.schedule(
            Task::call(move || {
                sink.fetch_add(1, Ordering::SeqCst);
            }),
            -1,
        );
    }
    assert!(wait_until(Duration::from_secs(2), || {
        done.load(Ordering::SeqCst) == 100
    }));
    io.stop();
}

#[test]
fn front_timer_insertion_interrupts_a_long_poll() {
    let io = IoManager::new(1, false, "front_timer").unwrap();
    // park the reactor in its long 5s poll first
    std::thread::sleep(Duration::from_millis(50));

    let fired_at: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));
    let sink = fired_at.clone();
    let start = Instant::now();
    io.add_timer(
        50,
        move || {
            sink.lock().unwrap().get_or_insert_with(Instant::now);
        },
        false,
    );
    assert!(wait_until(Duration::from_secs(2), || fired_at.lock().unwrap().is_some()));
    let elapsed = start.elapsed();
    assert!(
        elapsed < Duration::from_secs(2),
        "front insertion must re-enter epoll with the shorter timeout, took {:?}",
        elapsed
    );
    io.stop();
}
