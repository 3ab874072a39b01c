//! A user-space cooperative concurrency runtime for Linux.
//! This library contains the following building blocks:
//!
//! - [Fibers: stackful coroutines with explicit resume/yield](fiber)
//! - [Scheduler: a multi-threaded FIFO task queue of fibers and callbacks](scheduler)
//! - [Timers: an ordered set of absolute deadlines](timer)
//! - [IO manager: an epoll reactor fused with the scheduler and timers](io)
//! - [Syscall hooks: interposed libc symbols that suspend fibers instead of blocking](hook)
//! - [Threads: named workers with a synchronous start handshake](thread)
//! - [Error handling](error)
//!
//! Ordinary blocking code becomes cooperative once it runs inside an
//! [`IoManager`](io::IoManager) worker: a hooked `read` that would block
//! registers an epoll event naming the current fiber and yields; the
//! reactor wakes the fiber when the descriptor turns ready and the call
//! transparently retries. `sleep` and friends park the fiber on a timer
//! the same way.
//!
//! Scheduling is parallel but strictly non-preemptive: many OS threads,
//! each multiplexing fibers that only switch at explicit resume/yield
//! points.
//!
//! The runtime assumes a Linux-like platform: epoll, a unix pipe for
//! reactor wakeups, and ucontext-style stack switching.

#[macro_use]
extern crate bitflags;

pub mod clock;
pub mod error;
mod fd;
pub mod fiber;
pub mod hook;
pub mod io;
pub mod scheduler;
pub mod thread;
pub mod timer;

pub use error::{Error, Result};
pub use fiber::Fiber;
pub use hook::{is_hook_enable, set_hook_enable};
pub use io::{Event, IoManager};
pub use scheduler::{Scheduler, Task};
pub use timer::{Timer, TimerManager};
