//! Per-descriptor metadata backing the syscall hooks.
//!
//! The hooks only wrap descriptors they know to be sockets that the user
//! has *not* put in non-blocking mode themselves. That knowledge lives
//! here: a process-wide table of `{is_socket, user_nonblock, send/recv
//! timeout}` records, populated by the `socket`/`accept` hooks, consulted
//! by every hooked I/O call and updated by `fcntl`/`ioctl`/`setsockopt`.
//!
//! Tracked sockets are switched to kernel non-blocking mode on first
//! sight — the reactor is edge-triggered and a call that would block must
//! return `EAGAIN` so the hook can park the fiber instead.

use std::mem;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;

use crate::hook;
use crate::timer::NO_TIMEOUT;

/// Which direction a timeout applies to; maps to `SO_RCVTIMEO` /
/// `SO_SNDTIMEO`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimeoutKind {
    Recv,
    Send,
}

pub(crate) struct FdCtx {
    is_socket: bool,
    sys_nonblock: AtomicBool,
    user_nonblock: AtomicBool,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdCtx {
    fn new(fd: RawFd) -> FdCtx {
        let mut st: libc::stat = unsafe { mem::zeroed() };
        let is_socket = unsafe { libc::fstat(fd, &mut st) } == 0
            && (st.st_mode & libc::S_IFMT) == libc::S_IFSOCK;
        let mut sys_nonblock = false;
        if is_socket {
            let flags = unsafe { hook::real_fcntl(fd, libc::F_GETFL, 0) };
            if flags >= 0 && flags & libc::O_NONBLOCK == 0 {
                unsafe {
                    hook::real_fcntl(fd, libc::F_SETFL, (flags | libc::O_NONBLOCK) as libc::c_long)
                };
            }
            sys_nonblock = true;
        }
        FdCtx {
            is_socket,
            sys_nonblock: AtomicBool::new(sys_nonblock),
            user_nonblock: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(NO_TIMEOUT),
            send_timeout_ms: AtomicU64::new(NO_TIMEOUT),
        }
    }

    pub(crate) fn is_socket(&self) -> bool {
        self.is_socket
    }

    /// Whether the runtime itself holds the descriptor in kernel
    /// non-blocking mode.
    pub(crate) fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Relaxed)
    }

    /// Whether the *user* asked for non-blocking mode; such descriptors are
    /// never wrapped, the caller handles `EAGAIN` on their own.
    pub(crate) fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Relaxed)
    }

    pub(crate) fn set_user_nonblock(&self, nonblock: bool) {
        self.user_nonblock.store(nonblock, Ordering::Relaxed);
    }

    pub(crate) fn timeout(&self, kind: TimeoutKind) -> u64 {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.load(Ordering::Relaxed),
            TimeoutKind::Send => self.send_timeout_ms.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn set_timeout(&self, kind: TimeoutKind, ms: u64) {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.store(ms, Ordering::Relaxed),
            TimeoutKind::Send => self.send_timeout_ms.store(ms, Ordering::Relaxed),
        }
    }
}

pub(crate) struct FdManager {
    fds: RwLock<Vec<Option<Arc<FdCtx>>>>,
}

static MANAGER: Lazy<FdManager> = Lazy::new(|| FdManager {
    fds: RwLock::new(Vec::new()),
});

pub(crate) fn manager() -> &'static FdManager {
    &MANAGER
}

impl FdManager {
    /// Look up the record for `fd`, creating it when `auto_create` is set.
    /// Descriptors the hooks never created a record for are not wrapped.
    pub(crate) fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdCtx>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;
        {
            let fds = self.fds.read().unwrap();
            if let Some(Some(ctx)) = fds.get(idx) {
                return Some(ctx.clone());
            }
        }
        if !auto_create {
            return None;
        }
        let mut fds = self.fds.write().unwrap();
        if idx >= fds.len() {
            fds.resize((idx * 3 / 2).max(idx + 1), None);
        }
        if fds[idx].is_none() {
            fds[idx] = Some(Arc::new(FdCtx::new(fd)));
        }
        fds[idx].clone()
    }

    /// Forget the record for `fd`; called by the `close` hook.
    pub(crate) fn remove(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut fds = self.fds.write().unwrap();
        if let Some(slot) = fds.get_mut(fd as usize) {
            slot.take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_ends_are_not_sockets() {
        let mut fds: [libc::c_int; 2] = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let ctx = manager().get(fds[0], true).unwrap();
        assert!(!ctx.is_socket());
        manager().remove(fds[0]);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn sockets_are_detected_and_forced_nonblocking() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);
        let ctx = manager().get(fd, true).unwrap();
        assert!(ctx.is_socket());
        assert!(ctx.sys_nonblock());
        assert!(!ctx.user_nonblock());
        assert_eq!(ctx.timeout(TimeoutKind::Recv), NO_TIMEOUT);

        let flags = unsafe { hook::real_fcntl(fd, libc::F_GETFL, 0) };
        assert_ne!(flags & libc::O_NONBLOCK, 0);

        manager().remove(fd);
        assert!(manager().get(fd, false).is_none());
        unsafe { libc::close(fd) };
    }
}
