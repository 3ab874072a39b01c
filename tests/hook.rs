//! Hooked syscalls end to end: sleeping fibers, cooperative socket I/O,
//! socket timeouts.

use std::mem;
use std::os::raw::{c_int, c_void};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fibrio::io::IoManager;
use fibrio::scheduler::Task;

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
fn hooked_sleep_suspends_instead_of_blocking() {
    let io = IoManager::new(2, false, "hook_sleep").unwrap();

    let slept: Arc<Mutex<Option<(u32, Duration)>>> = Arc::new(Mutex::new(None));
    let side_work = Arc::new(AtomicUsize::new(0));

    let sink = slept.clone();
    io.schedule(
        Task::call(move || {
            let start = Instant::now();
            let rc = unsafe { libc::sleep(1) };
            *sink.lock().unwrap() = Some((rc, start.elapsed()));
        }),
        -1,
    );
    // other work proceeds while the first fiber sleeps
    let worker = side_work.clone();
    io.schedule(
        Task::call(move || {
            for _ in 0..10 {
                worker.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(10));
            }
        }),
        -1,
    );

    assert!(wait_until(Duration::from_secs(3), || slept.lock().unwrap().is_some()));
    let (rc, elapsed) = slept.lock().unwrap().unwrap();
    assert_eq!(rc, 0);
    assert!(elapsed >= Duration::from_secs(1), "slept only {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1200), "overslept: {:?}", elapsed);
    assert_eq!(side_work.load(Ordering::SeqCst), 10);

    io.stop();
}

fn loopback_addr(port: u16) -> libc::sockaddr_in {
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_addr.s_addr = u32::to_be(libc::INADDR_LOOPBACK);
    addr.sin_port = port.to_be();
    addr
}

#[test]
fn tcp_accept_connect_and_echo_through_hooks() {
    let io = IoManager::new(3, false, "hook_tcp").unwrap();
    let (port_tx, port_rx) = mpsc::channel::<u16>();
    let (server_tx, server_rx) = mpsc::channel::<()>();
    let (client_tx, client_rx) = mpsc::channel::<()>();

    io.schedule(
        Task::call(move || unsafe {
            let listener = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
            assert!(listener >= 0);
            let one: c_int = 1;
            libc::setsockopt(
                listener,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &one as *const c_int as *const c_void,
                mem::size_of::<c_int>() as libc::socklen_t,
            );
            let mut addr = loopback_addr(0);
            let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
            assert_eq!(
                libc::bind(
                    listener,
                    &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                    len,
                ),
                0
            );
            assert_eq!(libc::listen(listener, 16), 0);
            assert_eq!(
                libc::getsockname(
                    listener,
                    &mut addr as *mut libc::sockaddr_in as *mut libc::sockaddr,
                    &mut len,
                ),
                0
            );
            port_tx.send(u16::from_be(addr.sin_port)).unwrap();

            // no client yet: this suspends the fiber on a READ event
            let conn = libc::accept(listener, ptr::null_mut(), ptr::null_mut());
            assert!(conn >= 0);

            let mut buf = [0u8; 5];
            let mut got = 0;
            while got < buf.len() {
                let n = libc::recv(
                    conn,
                    buf[got..].as_mut_ptr() as *mut c_void,
                    buf.len() - got,
                    0,
                );
                assert!(n > 0);
                got += n as usize;
            }
            assert_eq!(&buf, b"hello");

            let n = libc::send(conn, b"world".as_ptr() as *const c_void, 5, 0);
            assert_eq!(n, 5);
            libc::close(conn);
            libc::close(listener);
            server_tx.send(()).unwrap();
        }),
        -1,
    );

    let port = port_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    io.schedule(
        Task::call(move || unsafe {
            let sock = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
            assert!(sock >= 0);
            let addr = loopback_addr(port);
            // rides through EINPROGRESS and a WRITE suspension
            let rc = libc::connect(
                sock,
                &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            );
            assert_eq!(rc, 0, "connect failed: {}", std::io::Error::last_os_error());

            let n = libc::send(sock, b"hello".as_ptr() as *const c_void, 5, 0);
            assert_eq!(n, 5);
            let mut buf = [0u8; 5];
            let mut got = 0;
            while got < buf.len() {
                let n = libc::recv(
                    sock,
                    buf[got..].as_mut_ptr() as *mut c_void,
                    buf.len() - got,
                    0,
                );
                assert!(n > 0);
                got += n as usize;
            }
            assert_eq!(&buf, b"world");
            libc::close(sock);
            client_tx.send(()).unwrap();
        }),
        -1,
    );

    server_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    client_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    io.stop();
}

#[test]
fn recv_reports_etimedout_after_so_rcvtimeo() {
    let io = IoManager::new(2, false, "hook_timeout").unwrap();
    let (tx, rx) = mpsc::channel::<(isize, c_int, Duration)>();

    io.schedule(
        Task::call(move || unsafe {
            let sock = libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0);
            assert!(sock >= 0);
            let addr = loopback_addr(0);
            assert_eq!(
                libc::bind(
                    sock,
                    &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                    mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                ),
                0
            );
            let timeout = libc::timeval {
                tv_sec: 0,
                tv_usec: 100_000,
            };
            assert_eq!(
                libc::setsockopt(
                    sock,
                    libc::SOL_SOCKET,
                    libc::SO_RCVTIMEO,
                    &timeout as *const libc::timeval as *const c_void,
                    mem::size_of::<libc::timeval>() as libc::socklen_t,
                ),
                0
            );

            let start = Instant::now();
            let mut buf = [0u8; 8];
            let n = libc::recv(sock, buf.as_mut_ptr() as *mut c_void, buf.len(), 0);
            let err = *libc::__errno_location();
            libc::close(sock);
            tx.send((n, err, start.elapsed())).unwrap();
        }),
        -1,
    );

    let (n, err, elapsed) = rx.recv_timeout(Duration::from_secs(3)).unwrap();
    assert_eq!(n, -1);
    assert_eq!(err, libc::ETIMEDOUT);
    assert!(elapsed >= Duration::from_millis(100), "woke early: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(1), "woke late: {:?}", elapsed);
    io.stop();
}
