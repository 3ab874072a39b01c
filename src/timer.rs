//! Deadline timers.
//!
//! A [`TimerManager`] keeps an ordered set of absolute deadlines on the
//! monotonic clock. The reactor asks it for the next poll timeout with
//! [`next_timeout`](TimerManager::next_timeout) and collects due callbacks
//! with [`drain_expired`](TimerManager::drain_expired); recurring timers are
//! re-armed with a fresh `now + period` deadline on every expiry.
//!
//! Deadlines sort the set; two timers with an identical deadline are kept
//! distinct by a per-timer sequence number, so the set never collapses
//! entries. Individual timers are located through that identity, not
//! through their (mutable) deadline.
//!
//! The wall clock is only observed to detect a rollover: if it is ever more
//! than one hour behind the previous observation, every pending timer is
//! treated as expired on that tick.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::clock;

/// Returned by [`TimerManager::next_timeout`] when no timer is pending.
pub const NO_TIMEOUT: u64 = u64::MAX;

const CLOCK_ROLLOVER_MS: u64 = 60 * 60 * 1000;

/// A timer callback. Stored behind an `Arc` because recurring timers fire
/// more than once; every expiry hands out a fresh clone.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

static NEXT_TIMER_SEQ: AtomicU64 = AtomicU64::new(0);

struct When {
    deadline_ms: u64,
    period_ms: u64,
}

struct TimerShared {
    seq: u64,
    recurring: bool,
    // Both fields below are only mutated under the manager's write lock;
    // lock order is always set-lock first, then per-timer locks.
    when: Mutex<When>,
    callback: Mutex<Option<TimerCallback>>,
    manager: Weak<TimerCore>,
}

impl TimerShared {
    fn key(&self) -> (u64, u64) {
        (self.when.lock().unwrap().deadline_ms, self.seq)
    }
}

/// Handle to a pending (or already fired) timer.
#[derive(Clone)]
pub struct Timer {
    inner: Arc<TimerShared>,
}

impl Timer {
    /// Cancel the timer.
    ///
    /// The callback is nulled first, so a dispatch racing with the
    /// cancellation observes a void callback and fires nothing. Returns
    /// `false` when the timer was already cancelled or consumed.
    pub fn cancel(&self) -> bool {
        let core = match self.inner.manager.upgrade() {
            Some(core) => core,
            None => return false,
        };
        let mut set = core.set.write().unwrap();
        {
            let mut callback = self.inner.callback.lock().unwrap();
            if callback.is_none() {
                return false;
            }
            *callback = None;
        }
        set.timers.remove(&self.inner.key());
        true
    }

    /// Push the deadline forward to `now + period`.
    ///
    /// Returns `false` when the timer is no longer pending.
    pub fn refresh(&self) -> bool {
        let core = match self.inner.manager.upgrade() {
            Some(core) => core,
            None => return false,
        };
        let mut set = core.set.write().unwrap();
        if self.inner.callback.lock().unwrap().is_none() {
            return false;
        }
        if set.timers.remove(&self.inner.key()).is_none() {
            return false;
        }
        let mut when = self.inner.when.lock().unwrap();
        when.deadline_ms = clock::monotonic_ms() + when.period_ms;
        drop(when);
        set.timers.insert(self.inner.key(), self.inner.clone());
        true
    }

    /// Change the period to `ms` and recompute the deadline: from `now`
    /// when `from_now` is set, otherwise from the timer's original start
    /// point (`deadline - old_period`).
    ///
    /// Returns `false` when the timer is no longer pending.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        let same_period = {
            let when = self.inner.when.lock().unwrap();
            ms == when.period_ms
        };
        if same_period && !from_now {
            // nothing to move, but a consumed or cancelled timer still
            // reports that it is gone
            return self.inner.callback.lock().unwrap().is_some();
        }
        let core = match self.inner.manager.upgrade() {
            Some(core) => core,
            None => return false,
        };
        let need_wake;
        {
            let mut set = core.set.write().unwrap();
            if self.inner.callback.lock().unwrap().is_none() {
                return false;
            }
            if set.timers.remove(&self.inner.key()).is_none() {
                return false;
            }
            let mut when = self.inner.when.lock().unwrap();
            let start = if from_now {
                clock::monotonic_ms()
            } else {
                when.deadline_ms.saturating_sub(when.period_ms)
            };
            when.period_ms = ms;
            when.deadline_ms = start + ms;
            drop(when);
            need_wake = set.insert(self.inner.clone());
        }
        if need_wake {
            core.wake();
        }
        true
    }
}

struct TimerSet {
    timers: BTreeMap<(u64, u64), Arc<TimerShared>>,
    // Whether the front-insertion hook already ran since the last
    // next_timeout() call; at most one wake per poll interval.
    tickled: bool,
    prev_realtime_ms: u64,
}

impl TimerSet {
    /// Insert under the write lock; returns whether the front-insertion
    /// hook should run after the lock is released.
    fn insert(&mut self, timer: Arc<TimerShared>) -> bool {
        let key = timer.key();
        self.timers.insert(key, timer);
        let at_front = self.timers.keys().next() == Some(&key);
        if at_front && !self.tickled {
            self.tickled = true;
            return true;
        }
        false
    }
}

pub(crate) struct TimerCore {
    set: RwLock<TimerSet>,
    waker: Option<Box<dyn Fn() + Send + Sync>>,
}

impl TimerCore {
    fn wake(&self) {
        if let Some(waker) = &self.waker {
            waker();
        }
    }
}

/// Ordered set of deadline timers.
pub struct TimerManager {
    core: Arc<TimerCore>,
}

impl TimerManager {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// A manager whose front-insertion hook is `waker`. The reactor installs
    /// a tickle here so a newly inserted earliest deadline shortens the
    /// current epoll timeout.
    pub(crate) fn with_waker(waker: Box<dyn Fn() + Send + Sync>) -> Self {
        Self::build(Some(waker))
    }

    fn build(waker: Option<Box<dyn Fn() + Send + Sync>>) -> Self {
        TimerManager {
            core: Arc::new(TimerCore {
                set: RwLock::new(TimerSet {
                    timers: BTreeMap::new(),
                    tickled: false,
                    prev_realtime_ms: clock::realtime_ms(),
                }),
                waker,
            }),
        }
    }

    /// Arm a timer `ms` milliseconds from now.
    pub fn add_timer<F>(&self, ms: u64, callback: F, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        let callback: TimerCallback = Arc::new(callback);
        let shared = Arc::new(TimerShared {
            seq: NEXT_TIMER_SEQ.fetch_add(1, Ordering::Relaxed),
            recurring,
            when: Mutex::new(When {
                deadline_ms: clock::monotonic_ms() + ms,
                period_ms: ms,
            }),
            callback: Mutex::new(Some(callback)),
            manager: Arc::downgrade(&self.core),
        });
        let need_wake = {
            let mut set = self.core.set.write().unwrap();
            set.insert(shared.clone())
        };
        if need_wake {
            self.core.wake();
        }
        Timer { inner: shared }
    }

    /// Like [`add_timer`](Self::add_timer), but the callback only runs if
    /// `cond` is still observable when the timer fires.
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
        self.add_timer(
            ms,
            move || {
                if cond.upgrade().is_some() {
                    callback();
                }
            },
            recurring,
        )
    }

    /// Milliseconds until the earliest deadline: `0` when it is already
    /// overdue, [`NO_TIMEOUT`] when the set is empty. Re-arms the
    /// front-insertion hook.
    pub fn next_timeout(&self) -> u64 {
        let mut set = self.core.set.write().unwrap();
        set.tickled = false;
        match set.timers.keys().next() {
            None => NO_TIMEOUT,
            Some(&(deadline_ms, _)) => deadline_ms.saturating_sub(clock::monotonic_ms()),
        }
    }

    /// Whether any timer is pending.
    pub fn has_timer(&self) -> bool {
        !self.core.set.read().unwrap().timers.is_empty()
    }

    /// Append the callbacks of every overdue timer to `out`, removing them
    /// from the set. Recurring timers are re-armed at `now + period`. A
    /// detected clock rollover expires every pending timer on this tick.
    pub fn drain_expired(&self, out: &mut Vec<TimerCallback>) {
        let now_ms = clock::monotonic_ms();
        let mut set = self.core.set.write().unwrap();

        let now_wall = clock::realtime_ms();
        let rollover = now_wall < set.prev_realtime_ms.saturating_sub(CLOCK_ROLLOVER_MS);
        if rollover {
            log::warn!(
                "wall clock rolled back by more than an hour; expiring all {} pending timers",
                set.timers.len()
            );
        }
        set.prev_realtime_ms = now_wall;

        let mut rearm = Vec::new();
        loop {
            let key = match set.timers.keys().next() {
                Some(&key) if rollover || key.0 <= now_ms => key,
                _ => break,
            };
            let shared = set.timers.remove(&key).unwrap();
            let callback = shared.callback.lock().unwrap().clone();
            match callback {
                // cancelled while expiring; nothing to dispatch
                None => {}
                Some(callback) => {
                    out.push(callback);
                    if shared.recurring {
                        let mut when = shared.when.lock().unwrap();
                        when.deadline_ms = now_ms + when.period_ms;
                        drop(when);
                        rearm.push(shared);
                    } else {
                        shared.callback.lock().unwrap().take();
                    }
                }
            }
        }
        for shared in rearm {
            let key = shared.key();
            set.timers.insert(key, shared);
        }
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}
