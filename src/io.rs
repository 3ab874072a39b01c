//! Cooperative I/O: the epoll reactor fused with the scheduler and timers.
//!
//! An [`IoManager`] is a scheduler whose idle fiber is an epoll loop. A
//! fiber (or plain callback) parks itself on a file descriptor with
//! [`add_event`](IoManager::add_event); when the descriptor becomes ready —
//! or the wait is cancelled — the parked handler is pushed back onto the
//! task queue and resumed by a worker.
//!
//! Registration is always edge-triggered: an armed event drains to NONE
//! when it fires, and the waiter re-arms after consuming data. Per
//! descriptor there is one slot for READ and one for WRITE; arming a slot
//! that is already armed is a programming error.
//!
//! A process-private pipe ("tickle channel") is registered in every epoll
//! instance so that [`schedule`](IoManager::schedule) and freshly inserted
//! front timers can interrupt a poll in progress. The reactor drains the
//! pipe completely on every pass, which makes tickling idempotent per poll
//! cycle.

use std::cell::RefCell;
use std::os::raw::c_void;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::error::{Error, Result};
use crate::fiber::{self, Fiber, State};
use crate::scheduler::{self, Dispatcher, SchedCore, Task};
use crate::thread;
use crate::timer::{Timer, TimerManager};

bitflags! {
    /// Event directions a descriptor can be armed for. The bit values
    /// mirror `EPOLLIN` / `EPOLLOUT`.
    pub struct Event: u32 {
        const NONE  = 0x0;
        const READ  = 0x1;
        const WRITE = 0x4;
    }
}

/// epoll data token reserved for the tickle pipe's read end. Real entries
/// carry an `FdContext` pointer, which can never be all-ones.
const TICKLE_TOKEN: u64 = u64::MAX;

const MAX_EVENTS: usize = 256;
const MAX_TIMEOUT_MS: u64 = 5000;

/// One parked handler: either a fiber to resume or a callback to run,
/// plus the scheduler it should wake up on (captured at arm time).
#[derive(Default)]
struct EventCtx {
    scheduler: Weak<SchedCore>,
    fiber: Option<Arc<Fiber>>,
    callback: Option<Box<dyn FnOnce() + Send>>,
}

struct FdSlots {
    armed: Event,
    read: EventCtx,
    write: EventCtx,
}

/// Per-descriptor record. Created on first use of the descriptor and kept
/// until manager shutdown; only the armed mask and the slots change, so the
/// address stays valid for the epoll data field.
struct FdContext {
    fd: RawFd,
    slots: Mutex<FdSlots>,
}

impl FdContext {
    fn new(fd: RawFd) -> Arc<FdContext> {
        Arc::new(FdContext {
            fd,
            slots: Mutex::new(FdSlots {
                armed: Event::NONE,
                read: EventCtx::default(),
                write: EventCtx::default(),
            }),
        })
    }
}

pub(crate) struct IoInner {
    core: Arc<SchedCore>,
    weak_self: Weak<IoInner>,
    timers: TimerManager,
    epoll_fd: RawFd,
    tickle_fds: [RawFd; 2],
    pending: AtomicUsize,
    contexts: RwLock<Vec<Arc<FdContext>>>,
}

thread_local! {
    static CURRENT_IO: RefCell<Weak<IoInner>> = RefCell::new(Weak::new());
}

impl IoInner {
    fn context(&self, fd: RawFd) -> Arc<FdContext> {
        assert!(fd >= 0, "negative file descriptor");
        let idx = fd as usize;
        {
            let contexts = self.contexts.read().unwrap();
            if idx < contexts.len() {
                return contexts[idx].clone();
            }
        }
        let mut contexts = self.contexts.write().unwrap();
        if idx >= contexts.len() {
            let target = (idx * 3 / 2).max(idx + 1);
            for fd in contexts.len()..target {
                contexts.push(FdContext::new(fd as RawFd));
            }
        }
        contexts[idx].clone()
    }

    fn lookup(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        self.contexts.read().unwrap().get(fd as usize).cloned()
    }

    fn epoll_update(&self, fd: RawFd, op: libc::c_int, mask: Event, token: u64) -> i32 {
        let mut ev = libc::epoll_event {
            events: libc::EPOLLET as u32 | mask.bits(),
            u64: token,
        };
        unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut ev) }
    }

    /// Hand the parked handler of `event` to its scheduler and clear the
    /// slot. A slot that fired does not fire again until re-armed.
    fn trigger(&self, slots: &mut FdSlots, event: Event) {
        assert!(slots.armed.contains(event), "triggering an unarmed event");
        slots.armed.remove(event);
        let slot = if event == Event::READ {
            &mut slots.read
        } else {
            &mut slots.write
        };
        let scheduler = slot.scheduler.upgrade();
        let task = if let Some(callback) = slot.callback.take() {
            Some(Task::Call(callback))
        } else {
            slot.fiber.take().map(Task::Fiber)
        };
        slot.scheduler = Weak::new();
        match (scheduler, task) {
            (Some(scheduler), Some(task)) => scheduler.schedule(task, -1),
            (None, Some(_)) => log::warn!("dropping event handler: its scheduler is gone"),
            _ => {}
        }
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }

    /// The reactor: epoll fused with the timer set. Hosted in the idle
    /// fiber of every worker thread.
    fn reactor_loop(&self) {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        loop {
            if Dispatcher::stopping(self) {
                log::debug!(
                    "io manager {} reactor exiting on thread {}",
                    self.core.name(),
                    thread::current_id()
                );
                // Stop-time tickles coalesce in the pipe; pass the wake
                // along so sibling reactors notice shutdown promptly
                // instead of riding out their full poll timeout.
                self.tickle();
                break;
            }

            let ready = loop {
                let timeout = self.timers.next_timeout().min(MAX_TIMEOUT_MS);
                let n = unsafe {
                    libc::epoll_wait(
                        self.epoll_fd,
                        events.as_mut_ptr(),
                        MAX_EVENTS as libc::c_int,
                        timeout as libc::c_int,
                    )
                };
                if n < 0 && std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                break n;
            };
            if ready < 0 {
                log::error!("epoll_wait failed: {}", std::io::Error::last_os_error());
            }

            let mut due = Vec::new();
            self.timers.drain_expired(&mut due);
            for callback in due {
                self.core.schedule(Task::call(move || callback()), -1);
            }

            for i in 0..ready.max(0) as usize {
                let token = events[i].u64;
                let mut reported = events[i].events;

                if token == TICKLE_TOKEN {
                    // Edge-triggered: consume every pending tickle byte so
                    // a burst of wakes costs one pass.
                    let mut buf = [0u8; 256];
                    loop {
                        let n = unsafe {
                            libc::read(
                                self.tickle_fds[0],
                                buf.as_mut_ptr() as *mut c_void,
                                buf.len(),
                            )
                        };
                        if n <= 0 {
                            break;
                        }
                    }
                    continue;
                }

                let ctx = unsafe { &*(token as usize as *const FdContext) };
                let mut slots = ctx.slots.lock().unwrap();

                // An error or hangup wakes whichever directions are armed;
                // the waiter observes the failure by retrying its syscall.
                if reported & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                    reported |= (libc::EPOLLIN | libc::EPOLLOUT) as u32 & slots.armed.bits();
                }
                let fired = Event::from_bits_truncate(reported) & slots.armed;
                if fired.is_empty() {
                    continue;
                }

                let remaining = slots.armed - fired;
                let op = if remaining.is_empty() {
                    libc::EPOLL_CTL_DEL
                } else {
                    libc::EPOLL_CTL_MOD
                };
                if self.epoll_update(ctx.fd, op, remaining, token) != 0 {
                    log::error!(
                        "epoll_ctl rearm failed on fd {}: {}",
                        ctx.fd,
                        std::io::Error::last_os_error()
                    );
                    continue;
                }

                if fired.contains(Event::READ) {
                    self.trigger(&mut slots, Event::READ);
                }
                if fired.contains(Event::WRITE) {
                    self.trigger(&mut slots, Event::WRITE);
                }
            }

            // Let the dispatch loop run what we just scheduled before the
            // next poll.
            fiber::current().yield_now();
        }
    }
}

impl Dispatcher for IoInner {
    fn core(&self) -> &Arc<SchedCore> {
        &self.core
    }

    fn tickle(&self) {
        if !self.core.has_idle_workers() {
            return;
        }
        let n = unsafe { libc::write(self.tickle_fds[1], b"T".as_ptr() as *const c_void, 1) };
        if n != 1 {
            log::warn!("tickle write returned {}", n);
        }
    }

    fn stopping(&self) -> bool {
        !self.timers.has_timer()
            && self.pending.load(Ordering::SeqCst) == 0
            && self.core.base_stopping()
    }

    fn idle(&self) {
        self.reactor_loop();
    }

    fn bind_thread(&self) {
        CURRENT_IO.with(|io| *io.borrow_mut() = self.weak_self.clone());
    }

    fn unbind_thread(&self) {
        CURRENT_IO.with(|io| *io.borrow_mut() = Weak::new());
    }
}

impl Drop for IoInner {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
            libc::close(self.tickle_fds[0]);
            libc::close(self.tickle_fds[1]);
        }
    }
}

/// Scheduler + timer manager + epoll reactor.
///
/// Cloning the handle is cheap; the runtime itself is shared. The manager
/// starts its workers on construction and runs until [`stop`](Self::stop).
#[derive(Clone)]
pub struct IoManager {
    inner: Arc<IoInner>,
}

impl IoManager {
    /// Build and start an IO manager with `threads` workers; see
    /// [`Scheduler::new`](crate::scheduler::Scheduler::new) for
    /// `use_caller`. Fails if the epoll instance or the tickle pipe cannot
    /// be created.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Result<IoManager> {
        let epoll_fd = unsafe { libc::epoll_create1(0) };
        if epoll_fd < 0 {
            return Err(Error::last_os_error());
        }
        let mut tickle_fds: [RawFd; 2] = [0; 2];
        if unsafe { libc::pipe(tickle_fds.as_mut_ptr()) } != 0 {
            let err = Error::last_os_error();
            unsafe { libc::close(epoll_fd) };
            return Err(err);
        }

        // Non-blocking read end, registered edge-triggered: the reactor
        // drains it fully on every pass.
        let rc = unsafe { libc::fcntl(tickle_fds[0], libc::F_SETFL, libc::O_NONBLOCK) };
        assert_eq!(rc, 0, "fcntl(O_NONBLOCK) failed on the tickle pipe");
        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: TICKLE_TOKEN,
        };
        let rc = unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, tickle_fds[0], &mut ev) };
        assert_eq!(rc, 0, "epoll_ctl(ADD) failed on the tickle pipe");

        let core = SchedCore::new(threads, use_caller, name);
        let inner = Arc::new_cyclic(|weak: &Weak<IoInner>| {
            let timer_waker = {
                let weak = weak.clone();
                Box::new(move || {
                    // A new front deadline must shorten the poll in flight.
                    if let Some(io) = weak.upgrade() {
                        Dispatcher::tickle(&*io);
                    }
                }) as Box<dyn Fn() + Send + Sync>
            };
            IoInner {
                core,
                weak_self: weak.clone(),
                timers: TimerManager::with_waker(timer_waker),
                epoll_fd,
                tickle_fds,
                pending: AtomicUsize::new(0),
                contexts: RwLock::new(Vec::new()),
            }
        });
        inner.core.set_waker({
            let weak = Arc::downgrade(&inner);
            Box::new(move || {
                if let Some(io) = weak.upgrade() {
                    Dispatcher::tickle(&*io);
                }
            })
        });
        // pre-size the context table the way the reactor will grow it
        inner.context(31);

        scheduler::setup(&inner);
        if let Err(err) = scheduler::start(&inner) {
            scheduler::stop(&inner);
            return Err(err);
        }
        Ok(IoManager { inner })
    }

    /// The IO manager whose worker (or caller) thread this is, if any.
    /// This is how hooked syscalls reach the reactor.
    pub fn current() -> Option<IoManager> {
        CURRENT_IO
            .try_with(|io| io.borrow().upgrade())
            .ok()
            .flatten()
            .map(|inner| IoManager { inner })
    }

    pub fn name(&self) -> String {
        self.inner.core.name().to_string()
    }

    /// Stop dispatching, drain the reactor and join every worker.
    pub fn stop(&self) {
        scheduler::stop(&self.inner);
    }

    /// Enqueue a task; see [`Scheduler::schedule`](crate::scheduler::Scheduler::schedule).
    pub fn schedule(&self, task: Task, thread: i32) {
        self.inner.core.schedule(task, thread);
    }

    /// Arm `event` on `fd`. Without a callback the *current fiber* is
    /// parked in the slot and will be rescheduled when the event fires; the
    /// caller is expected to yield right after.
    ///
    /// Arming an already-armed direction is a programming error and
    /// asserts. A failing `epoll_ctl` leaves the slot untouched and returns
    /// the error.
    pub fn add_event(
        &self,
        fd: RawFd,
        event: Event,
        callback: Option<Box<dyn FnOnce() + Send>>,
    ) -> Result<()> {
        assert!(
            event == Event::READ || event == Event::WRITE,
            "add_event takes exactly one of READ or WRITE"
        );
        let ctx = self.inner.context(fd);
        let mut slots = ctx.slots.lock().unwrap();
        assert!(
            !slots.armed.contains(event),
            "fd {} already has {:?} armed",
            fd,
            event
        );

        let op = if slots.armed.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let token = Arc::as_ptr(&ctx) as u64;
        if self.inner.epoll_update(fd, op, slots.armed | event, token) != 0 {
            let err = Error::last_os_error();
            log::error!("epoll_ctl arm failed on fd {}: {}", fd, err);
            return Err(err);
        }

        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        slots.armed |= event;
        let slot = if event == Event::READ {
            &mut slots.read
        } else {
            &mut slots.write
        };
        debug_assert!(slot.fiber.is_none() && slot.callback.is_none());
        slot.scheduler = match scheduler::bound_core() {
            Some(core) => Arc::downgrade(&core),
            None => Arc::downgrade(&self.inner.core),
        };
        match callback {
            Some(callback) => slot.callback = Some(callback),
            None => {
                let current = fiber::current();
                debug_assert_eq!(current.state(), State::Running);
                slot.fiber = Some(current);
            }
        }
        Ok(())
    }

    /// Disarm `event` on `fd` without waking the handler.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let ctx = match self.inner.lookup(fd) {
            Some(ctx) => ctx,
            None => return false,
        };
        let mut slots = ctx.slots.lock().unwrap();
        if !slots.armed.contains(event) {
            return false;
        }
        let remaining = slots.armed - event;
        let op = if remaining.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        if self
            .inner
            .epoll_update(fd, op, remaining, Arc::as_ptr(&ctx) as u64)
            != 0
        {
            log::error!(
                "epoll_ctl disarm failed on fd {}: {}",
                fd,
                std::io::Error::last_os_error()
            );
            return false;
        }
        slots.armed = remaining;
        let slot = if event == Event::READ {
            &mut slots.read
        } else {
            &mut slots.write
        };
        *slot = EventCtx::default();
        self.inner.pending.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Disarm `event` on `fd` and wake its handler: "stop waiting, observe
    /// your situation yourself".
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        let ctx = match self.inner.lookup(fd) {
            Some(ctx) => ctx,
            None => return false,
        };
        let mut slots = ctx.slots.lock().unwrap();
        if !slots.armed.contains(event) {
            return false;
        }
        let remaining = slots.armed - event;
        let op = if remaining.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        if self
            .inner
            .epoll_update(fd, op, remaining, Arc::as_ptr(&ctx) as u64)
            != 0
        {
            log::error!(
                "epoll_ctl cancel failed on fd {}: {}",
                fd,
                std::io::Error::last_os_error()
            );
            return false;
        }
        self.inner.trigger(&mut slots, event);
        true
    }

    /// Drop the descriptor from the reactor entirely, waking every armed
    /// handler.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let ctx = match self.inner.lookup(fd) {
            Some(ctx) => ctx,
            None => return false,
        };
        let mut slots = ctx.slots.lock().unwrap();
        if slots.armed.is_empty() {
            return false;
        }
        if self
            .inner
            .epoll_update(fd, libc::EPOLL_CTL_DEL, Event::NONE, 0)
            != 0
        {
            log::error!(
                "epoll_ctl delete failed on fd {}: {}",
                fd,
                std::io::Error::last_os_error()
            );
            return false;
        }
        if slots.armed.contains(Event::READ) {
            self.inner.trigger(&mut slots, Event::READ);
        }
        if slots.armed.contains(Event::WRITE) {
            self.inner.trigger(&mut slots, Event::WRITE);
        }
        debug_assert!(slots.armed.is_empty());
        true
    }

    /// Arm a timer on the manager's timer set; the callback is scheduled
    /// onto the task queue when it expires.
    pub fn add_timer<F>(&self, ms: u64, callback: F, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.timers.add_timer(ms, callback, recurring)
    }

    /// See [`TimerManager::add_conditional_timer`].
    pub fn add_conditional_timer<F, T>(
        &self,
        ms: u64,
        callback: F,
        cond: Weak<T>,
        recurring: bool,
    ) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        self.inner.timers.add_conditional_timer(ms, callback, cond, recurring)
    }
}
