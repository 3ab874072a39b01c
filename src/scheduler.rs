//! Multi-threaded cooperative task scheduler.
//!
//! A [`Scheduler`] owns N worker threads and a FIFO queue of [`Task`]s —
//! fibers to resume or callbacks to wrap in a fresh fiber. Each worker runs
//! the dispatch loop: pop the first task eligible for this thread, resume
//! it, and fall back to the thread's *idle fiber* when the queue is empty.
//! The base idle fiber naps and yields; the IO manager replaces it with the
//! epoll reactor.
//!
//! In *caller mode* (`use_caller == true`) the thread constructing the
//! scheduler is itself a worker: the dispatch loop is hosted in a dedicated
//! scheduler fiber which [`stop`](Scheduler::stop) resumes exactly once on
//! that thread. On plain worker threads the loop runs on the thread's
//! native stack and the scheduler fiber coincides with the thread-main
//! fiber.
//!
//! Tasks may be pinned to a worker with a kernel thread id; `-1` means any
//! worker. A worker that skips past a pinned task wakes its peers so the
//! owning thread gets a chance to pick it up.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use once_cell::sync::OnceCell;

use crate::error::Result;
use crate::fiber::{self, Fiber, State};
use crate::hook;
use crate::thread::{self, Thread};

/// A schedulable unit: a fiber to resume, or a callback to run inside a
/// fresh fiber.
pub enum Task {
    Fiber(Arc<Fiber>),
    Call(Box<dyn FnOnce() + Send + 'static>),
}

impl Task {
    pub fn call<F>(f: F) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        Task::Call(Box::new(f))
    }

    pub fn fiber(fiber: Arc<Fiber>) -> Task {
        Task::Fiber(fiber)
    }
}

struct Queued {
    task: Task,
    thread: i32,
}

struct TaskQueue {
    tasks: VecDeque<Queued>,
    stopping: bool,
}

/// Shared scheduler state: the queue, the worker roster and the counters.
/// Owned behind an `Arc` by the public handle, by every worker thread, and
/// (weakly) by armed event slots.
pub(crate) struct SchedCore {
    name: String,
    queue: Mutex<TaskQueue>,
    worker_count: usize,
    active: AtomicUsize,
    idle: AtomicUsize,
    use_caller: bool,
    root_tid: i32,
    scheduler_fiber: Mutex<Option<Arc<Fiber>>>,
    workers: Mutex<Vec<Thread>>,
    started: AtomicBool,
    // Installed by the IO manager: wakes one idling worker. Unset on the
    // base scheduler, whose idle fiber polls on its own.
    waker: OnceCell<Box<dyn Fn() + Send + Sync>>,
}

thread_local! {
    static BOUND: RefCell<Option<Arc<SchedCore>>> = RefCell::new(None);
}

/// The scheduler core bound to the calling thread, if any. Captured by
/// event slots at arm time so cancellations wake the right queue.
pub(crate) fn bound_core() -> Option<Arc<SchedCore>> {
    BOUND.with(|b| b.borrow().clone())
}

impl SchedCore {
    pub(crate) fn new(threads: usize, use_caller: bool, name: &str) -> Arc<SchedCore> {
        assert!(threads > 0, "scheduler needs at least one thread");
        let (worker_count, root_tid) = if use_caller {
            (threads - 1, thread::current_id())
        } else {
            (threads, -1)
        };
        Arc::new(SchedCore {
            name: name.to_string(),
            queue: Mutex::new(TaskQueue {
                tasks: VecDeque::new(),
                stopping: false,
            }),
            worker_count,
            active: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            use_caller,
            root_tid,
            scheduler_fiber: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            waker: OnceCell::new(),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_waker(&self, waker: Box<dyn Fn() + Send + Sync>) {
        if self.waker.set(waker).is_err() {
            panic!("scheduler waker installed twice");
        }
    }

    /// Enqueue a task for `thread` (`-1` = any worker) and deliver an
    /// at-least-once wake when the queue was empty. Scheduling into a
    /// stopped scheduler returns without enqueueing.
    pub(crate) fn schedule(&self, task: Task, thread: i32) {
        let need_wake = {
            let mut queue = self.queue.lock().unwrap();
            if queue.stopping {
                return;
            }
            let was_empty = queue.tasks.is_empty();
            queue.tasks.push_back(Queued { task, thread });
            was_empty
        };
        if need_wake {
            if let Some(waker) = self.waker.get() {
                waker();
            }
        }
    }

    /// Base stop condition: stop requested, queue drained, no worker busy.
    pub(crate) fn base_stopping(&self) -> bool {
        let queue = self.queue.lock().unwrap();
        queue.stopping && queue.tasks.is_empty() && self.active.load(Ordering::SeqCst) == 0
    }

    /// Whether any worker is currently parked in its idle fiber.
    pub(crate) fn has_idle_workers(&self) -> bool {
        self.idle.load(Ordering::SeqCst) > 0
    }
}

/// The scheduler behaviors the IO manager overrides. Defaults implement the
/// base scheduler; the worker loop is generic over this, so the overrides
/// bind statically.
pub(crate) trait Dispatcher: Send + Sync + Sized + 'static {
    fn core(&self) -> &Arc<SchedCore>;

    /// Wake one idling worker. The base scheduler's idle fiber polls, so
    /// there is nobody to signal.
    fn tickle(&self) {}

    /// Whether the dispatch loop may exit.
    fn stopping(&self) -> bool {
        self.core().base_stopping()
    }

    /// Body of the per-thread idle fiber. Runs until `stopping()`;
    /// terminating tells the dispatch loop to exit.
    fn idle(&self) {
        while !self.stopping() {
            std::thread::sleep(Duration::from_millis(1));
            fiber::current().yield_now();
        }
    }

    /// Per-thread bookkeeping when a worker (or the caller thread) attaches.
    fn bind_thread(&self) {}

    /// Undo `bind_thread` on the caller thread during `stop`.
    fn unbind_thread(&self) {}
}

/// Bind the constructing thread and, in caller mode, build the scheduler
/// fiber hosting the dispatch loop.
pub(crate) fn setup<D: Dispatcher>(owner: &Arc<D>) {
    let core = owner.core().clone();
    BOUND.with(|bound| {
        let mut bound = bound.borrow_mut();
        assert!(
            bound.is_none(),
            "a scheduler is already bound to this thread"
        );
        *bound = Some(core.clone());
    });
    thread::set_current_name(core.name());
    owner.bind_thread();

    if core.use_caller {
        // The caller thread is a worker: its dispatch loop lives in a
        // dedicated fiber that stop() resumes.
        fiber::current();
        let runner = owner.clone();
        let scheduler_fiber = Fiber::new(move || run(runner), 0, false);
        fiber::set_scheduler_fiber(Some(scheduler_fiber.clone()));
        *core.scheduler_fiber.lock().unwrap() = Some(scheduler_fiber);
    }
}

/// Spawn the worker threads. Idempotent.
pub(crate) fn start<D: Dispatcher>(owner: &Arc<D>) -> Result<()> {
    let core = owner.core();
    if core.started.swap(true, Ordering::SeqCst) {
        return Ok(());
    }
    log::debug!(
        "scheduler {} starting {} worker thread(s)",
        core.name,
        core.worker_count
    );
    let mut workers = core.workers.lock().unwrap();
    for i in 0..core.worker_count {
        let runner = owner.clone();
        let worker = Thread::spawn(&format!("{}_{}", core.name, i), move || run(runner))?;
        workers.push(worker);
    }
    Ok(())
}

/// Request shutdown and wait for it: set the stopping flag, wake every
/// worker plus the caller-mode scheduler fiber, resume that fiber exactly
/// once so its loop observes the flag, then join all workers. Idempotent.
pub(crate) fn stop<D: Dispatcher>(owner: &Arc<D>) {
    let core = owner.core();
    {
        let mut queue = core.queue.lock().unwrap();
        if queue.stopping {
            return;
        }
        queue.stopping = true;
    }
    log::debug!("scheduler {} stopping", core.name);

    for _ in 0..core.worker_count {
        owner.tickle();
    }
    let scheduler_fiber = core.scheduler_fiber.lock().unwrap().clone();
    if scheduler_fiber.is_some() {
        owner.tickle();
    }
    if let Some(scheduler_fiber) = scheduler_fiber {
        debug_assert_eq!(
            thread::current_id(),
            core.root_tid,
            "caller-mode stop must run on the thread that built the scheduler"
        );
        if scheduler_fiber.state() != State::Term {
            scheduler_fiber.resume();
        }
    }

    let workers = mem::take(&mut *core.workers.lock().unwrap());
    for worker in workers {
        worker.join();
    }
    core.scheduler_fiber.lock().unwrap().take();

    // Release this thread's binding so another scheduler may be built here.
    BOUND.with(|bound| {
        let mut bound = bound.borrow_mut();
        if bound.as_ref().map_or(false, |b| Arc::ptr_eq(b, core)) {
            bound.take();
        }
    });
    if core.use_caller && thread::current_id() == core.root_tid {
        fiber::set_scheduler_fiber(None);
    }
    owner.unbind_thread();
    log::debug!("scheduler {} stopped", core.name);
}

/// The dispatch loop every worker runs — on its native stack for spawned
/// workers, inside the scheduler fiber on the caller thread.
pub(crate) fn run<D: Dispatcher>(owner: Arc<D>) {
    let core = owner.core().clone();
    hook::set_hook_enable(true);
    BOUND.with(|bound| *bound.borrow_mut() = Some(core.clone()));
    owner.bind_thread();
    thread::set_current_name(core.name());

    let my_tid = thread::current_id();
    if my_tid != core.root_tid {
        // Spawned worker: the dispatch loop runs as the thread-main fiber,
        // which doubles as the scheduler fiber for task switches.
        let main = fiber::current();
        fiber::set_scheduler_fiber(Some(main));
    }
    log::debug!("scheduler {} worker {} dispatching", core.name, my_tid);

    let idler = owner.clone();
    let idle_fiber = Fiber::new(move || idler.idle(), 0, true);
    let mut call_fiber: Option<Arc<Fiber>> = None;

    loop {
        let mut picked: Option<Task> = None;
        let mut tickle_me = false;
        {
            let mut queue = core.queue.lock().unwrap();
            let mut i = 0;
            while i < queue.tasks.len() {
                let pinned_elsewhere = {
                    let queued = &queue.tasks[i];
                    queued.thread != -1 && queued.thread != my_tid
                };
                if pinned_elsewhere {
                    // someone else's task; make sure its owner wakes up
                    tickle_me = true;
                    i += 1;
                    continue;
                }
                picked = queue.tasks.remove(i).map(|q| q.task);
                break;
            }
            tickle_me = tickle_me || !queue.tasks.is_empty();
        }
        if tickle_me {
            owner.tickle();
        }

        match picked {
            Some(Task::Fiber(task_fiber)) => match task_fiber.state() {
                State::Term => {}
                State::Running => {
                    // A waker (timer or event) got to the fiber before its
                    // yield completed on another thread; run it next pass.
                    core.schedule(Task::Fiber(task_fiber), -1);
                }
                State::Ready => {
                    core.active.fetch_add(1, Ordering::SeqCst);
                    task_fiber.resume();
                    core.active.fetch_sub(1, Ordering::SeqCst);
                }
            },
            Some(Task::Call(callback)) => {
                // Reuse the terminated callback fiber's stack when we can.
                match &call_fiber {
                    Some(fiber) if fiber.state() == State::Term => fiber.reset(callback),
                    _ => call_fiber = Some(Fiber::new(callback, 0, true)),
                }
                let fiber = call_fiber.clone().unwrap();
                core.active.fetch_add(1, Ordering::SeqCst);
                fiber.resume();
                core.active.fetch_sub(1, Ordering::SeqCst);
                if fiber.state() != State::Term {
                    // suspended mid-callback: the fiber is parked somewhere
                    // and its stack must not be reused
                    call_fiber = None;
                }
            }
            None => {
                if idle_fiber.state() == State::Term {
                    break;
                }
                core.idle.fetch_add(1, Ordering::SeqCst);
                idle_fiber.resume();
                core.idle.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
    log::debug!("scheduler {} worker {} exiting", core.name, my_tid);
}

/// Base scheduler: FIFO dispatch over a worker pool, with no reactor
/// behind the idle fiber.
pub(crate) struct BaseScheduler {
    core: Arc<SchedCore>,
}

impl Dispatcher for BaseScheduler {
    fn core(&self) -> &Arc<SchedCore> {
        &self.core
    }
}

/// Public handle to a base scheduler.
pub struct Scheduler {
    inner: Arc<BaseScheduler>,
}

impl Scheduler {
    /// Build a scheduler with `threads` workers. With `use_caller` the
    /// constructing thread is one of them and [`stop`](Self::stop) runs its
    /// share of the dispatching. Panics if this thread already hosts a
    /// scheduler.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Scheduler {
        let core = SchedCore::new(threads, use_caller, name);
        let inner = Arc::new(BaseScheduler { core });
        setup(&inner);
        Scheduler { inner }
    }

    pub fn name(&self) -> &str {
        self.inner.core.name()
    }

    /// Spawn the worker threads. Idempotent.
    pub fn start(&self) -> Result<()> {
        start(&self.inner)
    }

    /// Stop dispatching and join every worker. Idempotent.
    pub fn stop(&self) {
        stop(&self.inner)
    }

    /// Enqueue `task` for `thread` (`-1` = any worker).
    pub fn schedule(&self, task: Task, thread: i32) {
        self.inner.core.schedule(task, thread);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn caller_mode_dispatches_during_stop() {
        let order = Arc::new(StdMutex::new(Vec::new()));
        let sched = Scheduler::new(1, true, "caller_only");
        sched.start().unwrap();
        for i in 0..3 {
            let sink = order.clone();
            sched.schedule(
                Task::call(move || sink.lock().unwrap().push(i)),
                -1,
            );
        }
        assert!(order.lock().unwrap().is_empty());
        sched.stop();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn workers_drain_the_queue() {
        let (tx, rx) = mpsc::channel();
        let sched = Scheduler::new(2, false, "workers");
        sched.start().unwrap();
        for i in 0..16 {
            let tx = tx.clone();
            sched.schedule(Task::call(move || tx.send(i).unwrap()), -1);
        }
        let mut got: Vec<i32> = (0..16).map(|_| rx.recv().unwrap()).collect();
        got.sort_unstable();
        assert_eq!(got, (0..16).collect::<Vec<_>>());
        sched.stop();
    }

    #[test]
    fn pinned_tasks_run_on_their_thread() {
        let (tx, rx) = mpsc::channel();
        let sched = Scheduler::new(2, false, "pinned");
        sched.start().unwrap();

        let probe = tx.clone();
        sched.schedule(
            Task::call(move || probe.send(thread::current_id()).unwrap()),
            -1,
        );
        let target = rx.recv().unwrap();

        for _ in 0..8 {
            let tx = tx.clone();
            sched.schedule(
                Task::call(move || tx.send(thread::current_id()).unwrap()),
                target,
            );
        }
        for _ in 0..8 {
            assert_eq!(rx.recv().unwrap(), target);
        }
        sched.stop();
    }

    #[test]
    fn scheduling_into_a_stopped_scheduler_is_dropped() {
        let ran = Arc::new(StdMutex::new(false));
        let sched = Scheduler::new(1, true, "stopped");
        sched.start().unwrap();
        sched.stop();
        // double stop is a no-op
        sched.stop();
        let sink = ran.clone();
        sched.schedule(Task::call(move || *sink.lock().unwrap() = true), -1);
        assert!(!*ran.lock().unwrap());
    }

    #[test]
    fn scheduled_fiber_resumes_until_term() {
        let steps = Arc::new(StdMutex::new(0));
        let sink = steps.clone();
        let sched = Scheduler::new(1, true, "fiber_task");
        sched.start().unwrap();
        let fiber = Fiber::new(
            move || {
                *sink.lock().unwrap() += 1;
                fiber::current().yield_now();
                *sink.lock().unwrap() += 1;
            },
            0,
            true,
        );
        sched.schedule(Task::fiber(fiber.clone()), -1);
        sched.stop();
        // first dispatch ran to the yield; the fiber then became READY
        // again but nothing rescheduled it
        assert_eq!(*steps.lock().unwrap(), 1);
        assert_eq!(fiber.state(), State::Ready);
    }
}
