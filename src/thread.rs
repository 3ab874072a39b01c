//! Named OS threads with a synchronous start handshake.
//!
//! The scheduler identifies workers by their kernel thread id, so a thread
//! must have published its id before the spawner is allowed to proceed.
//! [`Thread::spawn`] blocks until the child has stored its id and posted the
//! start semaphore, which is what makes thread-affinity scheduling race-free
//! from the moment `spawn` returns.

use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::error::Result;

/// A counting semaphore for thread synchronization.
///
/// Only used for the start handshake; fibers synchronize through the
/// scheduler, never through this type.
pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(count: usize) -> Self {
        Semaphore {
            count: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    /// Block until a permit is available, then take it.
    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cond.wait(count).unwrap();
        }
        *count -= 1;
    }

    /// Release one permit and wake a waiter.
    pub fn signal(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.cond.notify_one();
    }
}

thread_local! {
    static THREAD_ID: Cell<i32> = Cell::new(-1);
    static THREAD_NAME: RefCell<String> = RefCell::new(String::new());
}

/// The kernel thread id (`gettid`) of the calling thread.
///
/// Cached in a thread-local after the first call.
pub fn current_id() -> i32 {
    THREAD_ID.with(|id| {
        if id.get() == -1 {
            id.set(unsafe { libc::syscall(libc::SYS_gettid) } as i32);
        }
        id.get()
    })
}

/// The name the runtime assigned to the calling thread, or an empty string.
pub fn current_name() -> String {
    THREAD_NAME.with(|name| name.borrow().clone())
}

/// Name the calling thread for logs and diagnostics.
pub fn set_current_name(name: &str) {
    THREAD_NAME.with(|n| *n.borrow_mut() = name.to_string());
}

/// A named OS thread whose kernel id is known to the spawner.
pub struct Thread {
    id: i32,
    name: String,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl Thread {
    /// Spawn a named thread and wait for it to come up.
    ///
    /// Returns only after the child thread has published its kernel id and
    /// posted the start semaphore; the closure body runs after the
    /// handshake.
    pub fn spawn<F>(name: &str, f: F) -> Result<Thread>
    where
        F: FnOnce() + Send + 'static,
    {
        let sem = Arc::new(Semaphore::new(0));
        let tid = Arc::new(AtomicI32::new(-1));
        let thread_name = name.to_string();
        let handle = {
            let sem = sem.clone();
            let tid = tid.clone();
            let thread_name = thread_name.clone();
            std::thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || {
                    set_current_name(&thread_name);
                    tid.store(current_id(), Ordering::Release);
                    sem.signal();
                    f();
                })
                .map_err(crate::error::Error::IO)?
        };
        sem.wait();
        Ok(Thread {
            id: tid.load(Ordering::Acquire),
            name: thread_name,
            handle: Some(handle),
        })
    }

    /// Kernel thread id of the spawned thread.
    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the thread to finish.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("thread {} panicked", self.name);
            }
        }
    }
}
