//! Cooperative multitasking primitives: stackful fibers.
//!
//! A fiber is a set of instructions executed with cooperative multitasking:
//! it owns a call stack and a saved machine context, and control moves
//! between fibers only at explicit [`resume`](Fiber::resume) /
//! [`yield_now`](Fiber::yield_now) points.
//!
//! A fiber has three possible states: **READY**, **RUNNING** or **TERM**.
//! A freshly created fiber is READY. `resume` moves it to RUNNING,
//! `yield_now` moves it back to READY, and returning from the entry
//! callback moves it to TERM. A TERM fiber still owns its stack, which can
//! be reused for a fresh callback with [`reset`](Fiber::reset).
//!
//! Every thread tracks three distinguished fibers:
//! - the *running* fiber — whatever is executing right now;
//! - the *thread-main* fiber — the thread's native stack, created lazily by
//!   [`current`] and never scheduled as a task;
//! - the *scheduler* fiber — the fiber hosting the dispatch loop, installed
//!   by the scheduler.
//!
//! A fiber built with `run_in_scheduler == true` switches to and from the
//! scheduler fiber; one built with `false` switches to and from the
//! thread-main fiber. The pairing is fixed at construction.

use std::cell::{RefCell, UnsafeCell};
use std::mem;
use std::os::raw::c_void;
use std::ptr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Stack size used when a fiber is created with `stack_size == 0`.
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// Execution state of a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    /// Runnable: freshly created, reset, or yielded.
    Ready = 0,
    /// Currently executing on some thread.
    Running = 1,
    /// The entry callback has returned; the stack may be reused.
    Term = 2,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Ready,
            1 => State::Running,
            2 => State::Term,
            _ => unreachable!("invalid fiber state"),
        }
    }
}

/// The stack a fiber runs on. The thread-main fiber is the unique fiber
/// executing on the host thread's native stack.
enum Stack {
    Host,
    Owned(Box<[u8]>),
}

type EntryFn = Box<dyn FnOnce() + Send + 'static>;

/// A stackful fiber.
///
/// Shared ownership: the task queue, timer callbacks, event slots and the
/// running thread all hold `Arc<Fiber>` handles; the fiber is destroyed
/// when the last owner drops it.
pub struct Fiber {
    id: u64,
    state: AtomicU8,
    stack: Stack,
    ctx: UnsafeCell<libc::ucontext_t>,
    entry: Mutex<Option<EntryFn>>,
    run_in_scheduler: bool,
    weak_self: Weak<Fiber>,
}

// A fiber's context and stack are only touched by the thread that currently
// runs or resumes it, and at most one thread does so at any instant (one
// RUNNING fiber per thread, enforced by the resume/yield assertions). Under
// that invariant the handle may move between threads freely.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

thread_local! {
    static CURRENT: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
    static THREAD_MAIN: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
    static SCHEDULER: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
}

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(0);

/// The fiber currently executing on this thread.
///
/// Lazily creates the thread-main fiber the first time it is called on a
/// thread, so it always returns a live handle.
pub fn current() -> Arc<Fiber> {
    if let Some(f) = CURRENT.with(|c| c.borrow().clone()) {
        return f;
    }
    let main = Fiber::new_main();
    CURRENT.with(|c| *c.borrow_mut() = Some(main.clone()));
    THREAD_MAIN.with(|m| *m.borrow_mut() = Some(main.clone()));
    main
}

/// Id of the fiber currently executing on this thread, or `u64::MAX` when
/// the thread has not run any fiber yet. Cheap; meant for log lines.
pub fn current_id() -> u64 {
    CURRENT.with(|c| c.borrow().as_ref().map_or(u64::MAX, |f| f.id))
}

/// Thread-main fiber of the calling thread, created on demand.
pub(crate) fn thread_main() -> Arc<Fiber> {
    if let Some(f) = THREAD_MAIN.with(|m| m.borrow().clone()) {
        return f;
    }
    current();
    THREAD_MAIN.with(|m| m.borrow().clone()).unwrap()
}

/// Install (or clear) the scheduler fiber of the calling thread.
pub(crate) fn set_scheduler_fiber(f: Option<Arc<Fiber>>) {
    SCHEDULER.with(|s| *s.borrow_mut() = f);
}

pub(crate) fn scheduler_fiber() -> Option<Arc<Fiber>> {
    SCHEDULER.with(|s| s.borrow().clone())
}

impl Fiber {
    /// Create a fiber that will run `entry` when first resumed.
    ///
    /// `stack_size == 0` selects [`DEFAULT_STACK_SIZE`]. `run_in_scheduler`
    /// chooses the switch partner: `true` pairs the fiber with the thread's
    /// scheduler fiber, `false` with the thread-main fiber.
    pub fn new<F>(entry: F, stack_size: usize, run_in_scheduler: bool) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        let stack_size = if stack_size == 0 { DEFAULT_STACK_SIZE } else { stack_size };
        let mut stack = vec![0u8; stack_size].into_boxed_slice();
        let mut ctx: libc::ucontext_t = unsafe { mem::zeroed() };
        if unsafe { libc::getcontext(&mut ctx) } != 0 {
            fatal_context_error("getcontext");
        }
        ctx.uc_link = ptr::null_mut();
        ctx.uc_stack.ss_sp = stack.as_mut_ptr() as *mut c_void;
        ctx.uc_stack.ss_size = stack.len();
        unsafe { libc::makecontext(&mut ctx, fiber_entry, 0) };

        Arc::new_cyclic(|weak| Fiber {
            id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(State::Ready as u8),
            stack: Stack::Owned(stack),
            ctx: UnsafeCell::new(ctx),
            entry: Mutex::new(Some(Box::new(entry))),
            run_in_scheduler,
            weak_self: weak.clone(),
        })
    }

    /// The fiber representing the calling thread itself. Created RUNNING,
    /// without an owned stack, and never scheduled as a task.
    fn new_main() -> Arc<Fiber> {
        let mut ctx: libc::ucontext_t = unsafe { mem::zeroed() };
        if unsafe { libc::getcontext(&mut ctx) } != 0 {
            fatal_context_error("getcontext");
        }
        Arc::new_cyclic(|weak| Fiber {
            id: NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(State::Running as u8),
            stack: Stack::Host,
            ctx: UnsafeCell::new(ctx),
            entry: Mutex::new(None),
            run_in_scheduler: false,
            weak_self: weak.clone(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn is_main(&self) -> bool {
        matches!(self.stack, Stack::Host)
    }

    /// Reuse a TERM fiber's stack for a fresh entry callback.
    ///
    /// The fiber becomes READY again with a rebuilt initial context.
    pub fn reset<F>(&self, entry: F)
    where
        F: FnOnce() + Send + 'static,
    {
        assert_eq!(self.state(), State::Term, "reset() requires a TERM fiber");
        let stack = match &self.stack {
            Stack::Owned(stack) => stack,
            Stack::Host => panic!("reset() on the thread-main fiber"),
        };
        // TERM means nothing executes on this stack, so rebuilding the
        // context through the UnsafeCell cannot race.
        let ctx = self.ctx.get();
        unsafe {
            if libc::getcontext(ctx) != 0 {
                fatal_context_error("getcontext");
            }
            (*ctx).uc_link = ptr::null_mut();
            (*ctx).uc_stack.ss_sp = stack.as_ptr() as *mut c_void;
            (*ctx).uc_stack.ss_size = stack.len();
            libc::makecontext(ctx, fiber_entry, 0);
        }
        *self.entry.lock().unwrap() = Some(Box::new(entry));
        self.set_state(State::Ready);
    }

    /// Switch the calling thread's execution into this fiber.
    ///
    /// The current context is saved into the fiber's switch partner (the
    /// scheduler fiber or the thread-main fiber, per `run_in_scheduler`);
    /// `resume` returns when the fiber yields or terminates.
    pub fn resume(&self) {
        assert_eq!(self.state(), State::Ready, "resume() requires a READY fiber");
        assert!(!self.is_main(), "resume() on the thread-main fiber");

        let me = self.weak_self.upgrade().expect("resume() on a dropped fiber");
        let partner = self.switch_partner();
        self.set_state(State::Running);
        CURRENT.with(|c| *c.borrow_mut() = Some(me));

        // errno belongs to the suspended execution, not to the thread
        let errno = errno_get();
        let rc = unsafe { libc::swapcontext(partner.ctx.get(), self.ctx.get()) };
        if rc != 0 {
            fatal_context_error("swapcontext");
        }
        errno_set(errno);
    }

    /// Switch from this fiber back to its switch partner.
    ///
    /// Permitted only for the RUNNING fiber of the calling thread (or a
    /// TERM fiber finishing its trampoline). A RUNNING fiber becomes READY.
    pub fn yield_now(&self) {
        let state = self.state();
        assert!(
            state == State::Running || state == State::Term,
            "yield_now() requires a RUNNING or TERM fiber"
        );
        assert!(!self.is_main(), "yield_now() on the thread-main fiber");

        let partner = self.switch_partner();
        if state != State::Term {
            self.set_state(State::Ready);
        }
        CURRENT.with(|c| *c.borrow_mut() = Some(partner.clone()));

        let errno = errno_get();
        let rc = unsafe { libc::swapcontext(self.ctx.get(), partner.ctx.get()) };
        if rc != 0 {
            fatal_context_error("swapcontext");
        }
        errno_set(errno);
    }

    fn switch_partner(&self) -> Arc<Fiber> {
        if self.run_in_scheduler {
            scheduler_fiber().expect("no scheduler fiber installed on this thread")
        } else {
            thread_main()
        }
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Entry trampoline of every user fiber.
///
/// Runs the entry callback, releases it, marks the fiber TERM and yields.
/// The final yield must not hold a strong handle on this stack: the
/// trampoline never returns, so anything it still owns would leak.
extern "C" fn fiber_entry() {
    let entry = {
        let curr = current();
        let entry = curr.entry.lock().unwrap().take();
        entry
    };
    if let Some(entry) = entry {
        // No unwind may cross a context switch: a panicking fiber is
        // contained here, logged, and terminated like any other.
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(entry));
        if result.is_err() {
            log::error!("fiber {} panicked; terminating it", current_id());
        }
    }
    // The resume() caller's frame and the CURRENT slot both keep the fiber
    // alive across this final switch; a raw pointer is enough here.
    let raw = CURRENT.with(|c| {
        c.borrow()
            .as_ref()
            .map(|f| Arc::as_ptr(f))
            .expect("fiber trampoline with no current fiber")
    });
    unsafe {
        (*raw).set_state(State::Term);
        (*raw).entry.lock().unwrap().take();
        (*raw).yield_now();
    }
    unreachable!("terminated fiber was resumed");
}

#[inline]
fn errno_get() -> i32 {
    unsafe { *libc::__errno_location() }
}

#[inline]
fn errno_set(errno: i32) {
    unsafe { *libc::__errno_location() = errno };
}

/// Context save/restore is a precondition of the whole runtime; there is no
/// defined recovery from losing it.
fn fatal_context_error(op: &str) -> ! {
    log::error!(
        "{} failed in fiber {}: {}",
        op,
        current_id(),
        std::io::Error::last_os_error()
    );
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn sequence_generator() {
        let out = Arc::new(Mutex::new(Vec::new()));
        let sink = out.clone();
        let fiber = Fiber::new(
            move || {
                for i in 1..=5 {
                    sink.lock().unwrap().push(i);
                    if i < 5 {
                        current().yield_now();
                    }
                }
            },
            0,
            false,
        );

        for expected in 1..=5 {
            assert_eq!(fiber.state(), State::Ready);
            fiber.resume();
            assert_eq!(*out.lock().unwrap().last().unwrap(), expected);
        }
        assert_eq!(fiber.state(), State::Term);
        assert_eq!(out.lock().unwrap().len(), 5);
    }

    #[test]
    fn term_fiber_releases_its_entry() {
        let fiber = Fiber::new(|| {}, 0, false);
        fiber.resume();
        assert_eq!(fiber.state(), State::Term);
        assert!(fiber.entry.lock().unwrap().is_none());
    }

    #[test]
    fn reset_reuses_the_stack() {
        let hits = Arc::new(Mutex::new(0));
        let fiber = Fiber::new(|| {}, 0, false);
        fiber.resume();
        assert_eq!(fiber.state(), State::Term);

        let sink = hits.clone();
        fiber.reset(move || *sink.lock().unwrap() += 1);
        assert_eq!(fiber.state(), State::Ready);
        fiber.resume();
        assert_eq!(fiber.state(), State::Term);
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[test]
    fn main_fiber_has_no_owned_stack_and_is_running() {
        let main = current();
        assert!(main.is_main());
        assert_eq!(main.state(), State::Running);
        assert_eq!(current_id(), main.id());
    }

    #[test]
    fn yield_preserves_errno() {
        let fiber = Fiber::new(
            || {
                errno_set(libc::EAGAIN);
                current().yield_now();
                assert_eq!(errno_get(), libc::EAGAIN);
            },
            0,
            false,
        );
        fiber.resume();
        errno_set(0);
        fiber.resume();
        assert_eq!(fiber.state(), State::Term);
    }

    #[test]
    #[should_panic(expected = "requires a READY fiber")]
    fn resume_term_fiber_panics() {
        let fiber = Fiber::new(|| {}, 0, false);
        fiber.resume();
        fiber.resume();
    }
}
