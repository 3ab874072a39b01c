//! The `clock` module returns time values derived from the Posix / C
//! [CLOCK_GETTIME](http://pubs.opengroup.org/onlinepubs/9699919799/functions/clock_getres.html)
//! function.
//!
//! - [monotonic_ms()](fn.monotonic_ms.html) - Get the monotonic time in milliseconds
//! - [realtime_ms()](fn.realtime_ms.html) - Get the wall clock time in milliseconds
//!
//! Timer deadlines are expressed on the monotonic clock; the wall clock is
//! only observed by the rollover detector in the timer manager.

use std::mem::MaybeUninit;

/// The monotonic time in milliseconds since an unspecified epoch.
///
/// Derived from C function `clock_gettime(CLOCK_MONOTONIC)`.
/// Monotonic time is not affected by changes done by a user or by leaps to
/// or from daylight saving time, which makes it the right basis for
/// deadlines and elapsed-time measurement.
#[inline(always)]
pub fn monotonic_ms() -> u64 {
    clock_ms(libc::CLOCK_MONOTONIC)
}

/// The wall clock time in milliseconds since epoch (1970-01-01 00:00:00).
///
/// Derived from C function `clock_gettime(CLOCK_REALTIME)`. May jump
/// backwards when the system administrator adjusts the clock.
#[inline(always)]
pub fn realtime_ms() -> u64 {
    clock_ms(libc::CLOCK_REALTIME)
}

#[inline]
fn clock_ms(clock: libc::clockid_t) -> u64 {
    let mut ts = MaybeUninit::<libc::timespec>::uninit();
    let rc = unsafe { libc::clock_gettime(clock, ts.as_mut_ptr()) };
    // clock_gettime only fails for invalid clock ids
    assert_eq!(rc, 0, "clock_gettime failed");
    let ts = unsafe { ts.assume_init() };
    ts.tv_sec as u64 * 1000 + ts.tv_nsec as u64 / 1_000_000
}
