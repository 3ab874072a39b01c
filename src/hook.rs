//! Interposed libc symbols.
//!
//! Every exported function here shadows the libc symbol of the same name.
//! With hooking disabled (the default, per thread) a hook is a plain
//! forwarder to the real symbol, resolved once at first use through
//! `dlsym(RTLD_NEXT, ...)`. With hooking enabled — the scheduler enables it
//! on every worker thread — a call that would block becomes a fiber
//! suspension point instead:
//!
//! - the sleep family arms a one-shot timer that reschedules the current
//!   fiber, then yields;
//! - socket I/O calls the real syscall once and, on `EAGAIN`, arms the
//!   matching READ/WRITE event (plus a timeout timer when the socket has
//!   one), yields, and retries after being woken. Because registration is
//!   edge-triggered, the waiter must keep retrying until the syscall
//!   itself reports would-block again before re-arming.
//!
//! Only descriptors tracked by the [fd metadata table](crate::fd) are
//! wrapped: sockets created through the hooked `socket`/`accept`. A
//! descriptor the user explicitly set non-blocking is forwarded untouched —
//! the caller opted into handling `EAGAIN`.

use std::cell::Cell;
use std::os::raw::{c_char, c_int, c_long, c_uint, c_ulong, c_void};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::fd::{self, TimeoutKind};
use crate::fiber;
use crate::io::{Event, IoManager};
use crate::scheduler::Task;
use crate::timer::NO_TIMEOUT;

/// Default timeout for a hooked `connect` on sockets without an explicit
/// send timeout.
const CONNECT_TIMEOUT_MS: u64 = 5000;

thread_local! {
    static HOOK_ENABLED: Cell<bool> = Cell::new(false);
}

/// Whether hooked syscalls on this thread suspend fibers instead of
/// blocking.
///
/// Reads `false` during thread teardown, when the thread-local is already
/// gone but libc symbols (notably `close`) are still being called.
pub fn is_hook_enable() -> bool {
    HOOK_ENABLED.try_with(|flag| flag.get()).unwrap_or(false)
}

/// Enable or disable syscall hooking for the calling thread.
pub fn set_hook_enable(flag: bool) {
    let _ = HOOK_ENABLED.try_with(|cell| cell.set(flag));
}

macro_rules! real_fns {
    ($($name:ident: $ty:ty,)*) => {
        /// The real libc entry points, resolved past our own exports.
        pub(crate) struct RealFns {
            $(pub(crate) $name: $ty,)*
        }

        impl RealFns {
            unsafe fn load() -> RealFns {
                RealFns {
                    $($name: {
                        let sym = libc::dlsym(
                            libc::RTLD_NEXT,
                            concat!(stringify!($name), "\0").as_ptr() as *const c_char,
                        );
                        assert!(
                            !sym.is_null(),
                            concat!("dlsym(RTLD_NEXT) failed for ", stringify!($name))
                        );
                        std::mem::transmute_copy::<*mut c_void, $ty>(&sym)
                    },)*
                }
            }
        }
    };
}

real_fns! {
    sleep: unsafe extern "C" fn(c_uint) -> c_uint,
    usleep: unsafe extern "C" fn(libc::useconds_t) -> c_int,
    nanosleep: unsafe extern "C" fn(*const libc::timespec, *mut libc::timespec) -> c_int,
    socket: unsafe extern "C" fn(c_int, c_int, c_int) -> c_int,
    connect: unsafe extern "C" fn(c_int, *const libc::sockaddr, libc::socklen_t) -> c_int,
    accept: unsafe extern "C" fn(c_int, *mut libc::sockaddr, *mut libc::socklen_t) -> c_int,
    read: unsafe extern "C" fn(c_int, *mut c_void, libc::size_t) -> libc::ssize_t,
    readv: unsafe extern "C" fn(c_int, *const libc::iovec, c_int) -> libc::ssize_t,
    recv: unsafe extern "C" fn(c_int, *mut c_void, libc::size_t, c_int) -> libc::ssize_t,
    recvfrom: unsafe extern "C" fn(
        c_int,
        *mut c_void,
        libc::size_t,
        c_int,
        *mut libc::sockaddr,
        *mut libc::socklen_t,
    ) -> libc::ssize_t,
    recvmsg: unsafe extern "C" fn(c_int, *mut libc::msghdr, c_int) -> libc::ssize_t,
    write: unsafe extern "C" fn(c_int, *const c_void, libc::size_t) -> libc::ssize_t,
    writev: unsafe extern "C" fn(c_int, *const libc::iovec, c_int) -> libc::ssize_t,
    send: unsafe extern "C" fn(c_int, *const c_void, libc::size_t, c_int) -> libc::ssize_t,
    sendto: unsafe extern "C" fn(
        c_int,
        *const c_void,
        libc::size_t,
        c_int,
        *const libc::sockaddr,
        libc::socklen_t,
    ) -> libc::ssize_t,
    sendmsg: unsafe extern "C" fn(c_int, *const libc::msghdr, c_int) -> libc::ssize_t,
    close: unsafe extern "C" fn(c_int) -> c_int,
    fcntl: unsafe extern "C" fn(c_int, c_int, ...) -> c_int,
    ioctl: unsafe extern "C" fn(c_int, c_ulong, ...) -> c_int,
    getsockopt: unsafe extern "C" fn(
        c_int,
        c_int,
        c_int,
        *mut c_void,
        *mut libc::socklen_t,
    ) -> c_int,
    setsockopt: unsafe extern "C" fn(
        c_int,
        c_int,
        c_int,
        *const c_void,
        libc::socklen_t,
    ) -> c_int,
}

static REAL: Lazy<RealFns> = Lazy::new(|| unsafe { RealFns::load() });

pub(crate) fn real() -> &'static RealFns {
    &REAL
}

/// The un-interposed `fcntl`, for runtime-internal flag manipulation.
pub(crate) unsafe fn real_fcntl(fd: c_int, cmd: c_int, arg: c_long) -> c_int {
    (real().fcntl)(fd, cmd, arg)
}

#[inline]
fn errno() -> c_int {
    unsafe { *libc::__errno_location() }
}

#[inline]
fn set_errno(value: c_int) {
    unsafe { *libc::__errno_location() = value };
}

/// Shared note between a waiting fiber and its timeout timer: the timer
/// records why the wait was abandoned.
#[derive(Default)]
struct TimerInfo {
    cancelled: AtomicI32,
}

/// Park the current fiber until `ms` elapses; the timer reschedules it.
fn sleep_ms(iom: &IoManager, ms: u64) {
    let current = fiber::current();
    let iom2 = iom.clone();
    iom.add_timer(
        ms,
        move || {
            iom2.schedule(Task::fiber(current.clone()), -1);
        },
        false,
    );
    fiber::current().yield_now();
}

/// The common wrap for socket I/O: call, retry on `EINTR`, and on `EAGAIN`
/// arm the event (with an optional timeout timer), yield, and try again
/// once woken. Reports `ETIMEDOUT` upward when the timer won the race.
unsafe fn do_io<F>(
    fd: c_int,
    mut fun: F,
    name: &'static str,
    event: Event,
    kind: TimeoutKind,
) -> libc::ssize_t
where
    F: FnMut() -> libc::ssize_t,
{
    if !is_hook_enable() {
        return fun();
    }
    let ctx = match fd::manager().get(fd, false) {
        Some(ctx) => ctx,
        None => return fun(),
    };
    if !ctx.is_socket() || ctx.user_nonblock() {
        return fun();
    }
    let timeout_ms = ctx.timeout(kind);

    loop {
        let mut n = fun();
        while n == -1 && errno() == libc::EINTR {
            n = fun();
        }
        if n != -1 || errno() != libc::EAGAIN {
            return n;
        }

        let iom = match IoManager::current() {
            Some(iom) => iom,
            None => return n,
        };
        let tinfo = Arc::new(TimerInfo::default());
        let timer = if timeout_ms != NO_TIMEOUT {
            let note = Arc::downgrade(&tinfo);
            let canceller = iom.clone();
            Some(iom.add_conditional_timer(
                timeout_ms,
                move || {
                    if let Some(info) = note.upgrade() {
                        info.cancelled.store(libc::ETIMEDOUT, Ordering::SeqCst);
                    }
                    canceller.cancel_event(fd, event);
                },
                Arc::downgrade(&tinfo),
                false,
            ))
        } else {
            None
        };

        if iom.add_event(fd, event, None).is_err() {
            if let Some(timer) = &timer {
                timer.cancel();
            }
            log::error!("{}: failed to arm {:?} on fd {}", name, event, fd);
            return -1;
        }
        fiber::current().yield_now();
        if let Some(timer) = &timer {
            timer.cancel();
        }
        let cancelled = tinfo.cancelled.load(Ordering::SeqCst);
        if cancelled != 0 {
            set_errno(cancelled);
            return -1;
        }
        // woken by readiness or cancellation: retry and let the syscall
        // speak for itself
    }
}

unsafe fn connect_with_timeout(
    fd: c_int,
    addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
    timeout_ms: u64,
) -> c_int {
    if !is_hook_enable() {
        return (real().connect)(fd, addr, addrlen);
    }
    let ctx = match fd::manager().get(fd, false) {
        Some(ctx) => ctx,
        None => return (real().connect)(fd, addr, addrlen),
    };
    if !ctx.is_socket() || ctx.user_nonblock() {
        return (real().connect)(fd, addr, addrlen);
    }

    let n = (real().connect)(fd, addr, addrlen);
    if n == 0 {
        return 0;
    }
    if n != -1 || errno() != libc::EINPROGRESS {
        return n;
    }
    let iom = match IoManager::current() {
        Some(iom) => iom,
        None => return n,
    };

    let tinfo = Arc::new(TimerInfo::default());
    let timer = if timeout_ms != NO_TIMEOUT {
        let note = Arc::downgrade(&tinfo);
        let canceller = iom.clone();
        Some(iom.add_conditional_timer(
            timeout_ms,
            move || {
                if let Some(info) = note.upgrade() {
                    info.cancelled.store(libc::ETIMEDOUT, Ordering::SeqCst);
                }
                canceller.cancel_event(fd, Event::WRITE);
            },
            Arc::downgrade(&tinfo),
            false,
        ))
    } else {
        None
    };

    match iom.add_event(fd, Event::WRITE, None) {
        Ok(()) => {
            fiber::current().yield_now();
            if let Some(timer) = &timer {
                timer.cancel();
            }
            let cancelled = tinfo.cancelled.load(Ordering::SeqCst);
            if cancelled != 0 {
                set_errno(cancelled);
                return -1;
            }
        }
        Err(_) => {
            if let Some(timer) = &timer {
                timer.cancel();
            }
            log::error!("connect: failed to arm WRITE on fd {}", fd);
        }
    }

    // the connection attempt finished; ask the socket how it went
    let mut error: c_int = 0;
    let mut len = std::mem::size_of::<c_int>() as libc::socklen_t;
    if (real().getsockopt)(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut error as *mut c_int as *mut c_void,
        &mut len,
    ) == -1
    {
        return -1;
    }
    if error == 0 {
        0
    } else {
        set_errno(error);
        -1
    }
}

////////////////////////////////////////////////////////////////////////////////
// sleep family
////////////////////////////////////////////////////////////////////////////////

#[no_mangle]
pub unsafe extern "C" fn sleep(seconds: c_uint) -> c_uint {
    if !is_hook_enable() {
        return (real().sleep)(seconds);
    }
    let iom = match IoManager::current() {
        Some(iom) => iom,
        None => return (real().sleep)(seconds),
    };
    sleep_ms(&iom, seconds as u64 * 1000);
    0
}

#[no_mangle]
pub unsafe extern "C" fn usleep(usec: libc::useconds_t) -> c_int {
    if !is_hook_enable() {
        return (real().usleep)(usec);
    }
    let iom = match IoManager::current() {
        Some(iom) => iom,
        None => return (real().usleep)(usec),
    };
    sleep_ms(&iom, usec as u64 / 1000);
    0
}

#[no_mangle]
pub unsafe extern "C" fn nanosleep(
    req: *const libc::timespec,
    rem: *mut libc::timespec,
) -> c_int {
    if !is_hook_enable() || req.is_null() {
        return (real().nanosleep)(req, rem);
    }
    let iom = match IoManager::current() {
        Some(iom) => iom,
        None => return (real().nanosleep)(req, rem),
    };
    let req = &*req;
    let ms = req.tv_sec as u64 * 1000 + req.tv_nsec as u64 / 1_000_000;
    sleep_ms(&iom, ms);
    0
}

////////////////////////////////////////////////////////////////////////////////
// socket creation and teardown
////////////////////////////////////////////////////////////////////////////////

#[no_mangle]
pub unsafe extern "C" fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    let fd = (real().socket)(domain, ty, protocol);
    if is_hook_enable() && fd >= 0 {
        fd::manager().get(fd, true);
    }
    fd
}

#[no_mangle]
pub unsafe extern "C" fn connect(
    sockfd: c_int,
    addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
) -> c_int {
    connect_with_timeout(sockfd, addr, addrlen, CONNECT_TIMEOUT_MS)
}

#[no_mangle]
pub unsafe extern "C" fn accept(
    sockfd: c_int,
    addr: *mut libc::sockaddr,
    addrlen: *mut libc::socklen_t,
) -> c_int {
    let fd = do_io(
        sockfd,
        || (real().accept)(sockfd, addr, addrlen) as libc::ssize_t,
        "accept",
        Event::READ,
        TimeoutKind::Recv,
    ) as c_int;
    if fd >= 0 {
        fd::manager().get(fd, true);
    }
    fd
}

#[no_mangle]
pub unsafe extern "C" fn close(fd: c_int) -> c_int {
    if is_hook_enable() && fd::manager().get(fd, false).is_some() {
        if let Some(iom) = IoManager::current() {
            iom.cancel_all(fd);
        }
        fd::manager().remove(fd);
    }
    (real().close)(fd)
}

////////////////////////////////////////////////////////////////////////////////
// read family
////////////////////////////////////////////////////////////////////////////////

#[no_mangle]
pub unsafe extern "C" fn read(fd: c_int, buf: *mut c_void, count: libc::size_t) -> libc::ssize_t {
    do_io(
        fd,
        || (real().read)(fd, buf, count),
        "read",
        Event::READ,
        TimeoutKind::Recv,
    )
}

#[no_mangle]
pub unsafe extern "C" fn readv(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> libc::ssize_t {
    do_io(
        fd,
        || (real().readv)(fd, iov, iovcnt),
        "readv",
        Event::READ,
        TimeoutKind::Recv,
    )
}

#[no_mangle]
pub unsafe extern "C" fn recv(
    sockfd: c_int,
    buf: *mut c_void,
    len: libc::size_t,
    flags: c_int,
) -> libc::ssize_t {
    do_io(
        sockfd,
        || (real().recv)(sockfd, buf, len, flags),
        "recv",
        Event::READ,
        TimeoutKind::Recv,
    )
}

#[no_mangle]
pub unsafe extern "C" fn recvfrom(
    sockfd: c_int,
    buf: *mut c_void,
    len: libc::size_t,
    flags: c_int,
    src_addr: *mut libc::sockaddr,
    addrlen: *mut libc::socklen_t,
) -> libc::ssize_t {
    do_io(
        sockfd,
        || (real().recvfrom)(sockfd, buf, len, flags, src_addr, addrlen),
        "recvfrom",
        Event::READ,
        TimeoutKind::Recv,
    )
}

#[no_mangle]
pub unsafe extern "C" fn recvmsg(
    sockfd: c_int,
    msg: *mut libc::msghdr,
    flags: c_int,
) -> libc::ssize_t {
    do_io(
        sockfd,
        || (real().recvmsg)(sockfd, msg, flags),
        "recvmsg",
        Event::READ,
        TimeoutKind::Recv,
    )
}

////////////////////////////////////////////////////////////////////////////////
// write family
////////////////////////////////////////////////////////////////////////////////

#[no_mangle]
pub unsafe extern "C" fn write(
    fd: c_int,
    buf: *const c_void,
    count: libc::size_t,
) -> libc::ssize_t {
    do_io(
        fd,
        || (real().write)(fd, buf, count),
        "write",
        Event::WRITE,
        TimeoutKind::Send,
    )
}

#[no_mangle]
pub unsafe extern "C" fn writev(
    fd: c_int,
    iov: *const libc::iovec,
    iovcnt: c_int,
) -> libc::ssize_t {
    do_io(
        fd,
        || (real().writev)(fd, iov, iovcnt),
        "writev",
        Event::WRITE,
        TimeoutKind::Send,
    )
}

#[no_mangle]
pub unsafe extern "C" fn send(
    sockfd: c_int,
    buf: *const c_void,
    len: libc::size_t,
    flags: c_int,
) -> libc::ssize_t {
    do_io(
        sockfd,
        || (real().send)(sockfd, buf, len, flags),
        "send",
        Event::WRITE,
        TimeoutKind::Send,
    )
}

#[no_mangle]
pub unsafe extern "C" fn sendto(
    sockfd: c_int,
    buf: *const c_void,
    len: libc::size_t,
    flags: c_int,
    dest_addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
) -> libc::ssize_t {
    do_io(
        sockfd,
        || (real().sendto)(sockfd, buf, len, flags, dest_addr, addrlen),
        "sendto",
        Event::WRITE,
        TimeoutKind::Send,
    )
}

#[no_mangle]
pub unsafe extern "C" fn sendmsg(
    sockfd: c_int,
    msg: *const libc::msghdr,
    flags: c_int,
) -> libc::ssize_t {
    do_io(
        sockfd,
        || (real().sendmsg)(sockfd, msg, flags),
        "sendmsg",
        Event::WRITE,
        TimeoutKind::Send,
    )
}

////////////////////////////////////////////////////////////////////////////////
// descriptor control
////////////////////////////////////////////////////////////////////////////////

/// The optional argument is received as one machine word, which is how the
/// SysV ABI passes it for every `fcntl` command we interpose; C callers of
/// the exported symbol are unaffected.
#[no_mangle]
pub unsafe extern "C" fn fcntl(fd: c_int, cmd: c_int, arg: c_long) -> c_int {
    match cmd {
        libc::F_SETFL => {
            let mut flags = arg as c_int;
            if let Some(ctx) = fd::manager().get(fd, false) {
                if ctx.is_socket() {
                    ctx.set_user_nonblock(flags & libc::O_NONBLOCK != 0);
                    // the kernel-level flag belongs to the reactor
                    if ctx.sys_nonblock() {
                        flags |= libc::O_NONBLOCK;
                    } else {
                        flags &= !libc::O_NONBLOCK;
                    }
                }
            }
            (real().fcntl)(fd, cmd, flags as c_long)
        }
        libc::F_GETFL => {
            let flags = (real().fcntl)(fd, cmd);
            if let Some(ctx) = fd::manager().get(fd, false) {
                if ctx.is_socket() {
                    // report the user's view of the flag, not the reactor's
                    return if ctx.user_nonblock() {
                        flags | libc::O_NONBLOCK
                    } else {
                        flags & !libc::O_NONBLOCK
                    };
                }
            }
            flags
        }
        _ => (real().fcntl)(fd, cmd, arg),
    }
}

#[no_mangle]
pub unsafe extern "C" fn ioctl(fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
    if request == libc::FIONBIO as c_ulong && !arg.is_null() {
        if let Some(ctx) = fd::manager().get(fd, false) {
            if ctx.is_socket() {
                // record the user's wish; the descriptor stays non-blocking
                // at kernel level for the reactor
                ctx.set_user_nonblock(*(arg as *mut c_int) != 0);
                return 0;
            }
        }
    }
    (real().ioctl)(fd, request, arg)
}

#[no_mangle]
pub unsafe extern "C" fn getsockopt(
    sockfd: c_int,
    level: c_int,
    optname: c_int,
    optval: *mut c_void,
    optlen: *mut libc::socklen_t,
) -> c_int {
    (real().getsockopt)(sockfd, level, optname, optval, optlen)
}

#[no_mangle]
pub unsafe extern "C" fn setsockopt(
    sockfd: c_int,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: libc::socklen_t,
) -> c_int {
    if is_hook_enable()
        && level == libc::SOL_SOCKET
        && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
        && !optval.is_null()
        && optlen as usize >= std::mem::size_of::<libc::timeval>()
    {
        if let Some(ctx) = fd::manager().get(sockfd, false) {
            let tv = &*(optval as *const libc::timeval);
            let ms = tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000;
            // a zero timeval means "no timeout", like the kernel's
            let ms = if ms == 0 { NO_TIMEOUT } else { ms };
            let kind = if optname == libc::SO_RCVTIMEO {
                TimeoutKind::Recv
            } else {
                TimeoutKind::Send
            };
            ctx.set_timeout(kind, ms);
        }
    }
    (real().setsockopt)(sockfd, level, optname, optval, optlen)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_flag_is_per_thread_and_defaults_off() {
        assert!(!is_hook_enable());
        set_hook_enable(true);
        assert!(is_hook_enable());
        let t = std::thread::spawn(|| is_hook_enable());
        assert!(!t.join().unwrap());
        set_hook_enable(false);
    }

    #[test]
    fn disabled_hooks_forward_to_libc() {
        assert!(!is_hook_enable());
        // resolves the real symbol table and round-trips through it
        let rc = unsafe { usleep(1_000) };
        assert_eq!(rc, 0);
    }
}
