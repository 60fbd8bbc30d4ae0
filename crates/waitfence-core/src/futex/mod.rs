//! Kernel futex interface.
//!
//! The three primitives the synchronization cores are written against:
//! wait, wake, and requeue, all operating on 32-bit words addressed
//! through [`AtomicU32`]. Deadlines are absolute CLOCK_MONOTONIC
//! nanoseconds; waits use `FUTEX_WAIT_BITSET`, which takes an absolute
//! timespec natively.
//!
//! Value-changed and interrupted returns are folded into `Ok`: callers sit
//! in re-check loops around their futex word, so both cases are handled by
//! the reload. Only deadline expiry is distinguished.

use core::fmt;
use core::sync::atomic::AtomicU32;

use crate::syscall;

const FUTEX_WAKE: i32 = 1;
const FUTEX_CMP_REQUEUE: i32 = 4;
const FUTEX_WAIT_BITSET: i32 = 9;
const FUTEX_PRIVATE_FLAG: i32 = 0x80;
const FUTEX_BITSET_MATCH_ANY: u32 = 0xFFFF_FFFF;

/// Deadline value meaning "never time out".
pub const DEADLINE_INFINITE: i64 = i64::MAX;

/// The deadline expired before a wake arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedOut;

impl fmt::Display for TimedOut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("wait deadline expired")
    }
}

impl std::error::Error for TimedOut {}

/// Current CLOCK_MONOTONIC time in nanoseconds.
#[must_use]
pub fn monotonic_now() -> i64 {
    let ts = syscall::sys_clock_gettime_monotonic();
    ts[0].saturating_mul(1_000_000_000).saturating_add(ts[1])
}

/// Absolute deadline `nanos` nanoseconds from now.
#[must_use]
pub fn deadline_after(nanos: i64) -> i64 {
    monotonic_now().saturating_add(nanos)
}

/// Atomically check `*futex == expected` and sleep until woken or `deadline`.
///
/// `Ok` covers a genuine wake, a value mismatch, and a spurious return;
/// the caller re-checks the word either way. `Err(TimedOut)` is returned
/// only for deadline expiry.
pub fn wait(futex: &AtomicU32, expected: u32, deadline: i64) -> Result<(), TimedOut> {
    let op = FUTEX_WAIT_BITSET | FUTEX_PRIVATE_FLAG;
    let result = if deadline == DEADLINE_INFINITE {
        // SAFETY: the word address comes from a live reference.
        unsafe { syscall::sys_futex(futex.as_ptr(), op, expected, 0, 0, FUTEX_BITSET_MATCH_ANY) }
    } else {
        let deadline = deadline.max(0);
        let ts: [i64; 2] = [deadline / 1_000_000_000, deadline % 1_000_000_000];
        // SAFETY: the word address comes from a live reference and ts
        // outlives the call.
        unsafe {
            syscall::sys_futex(
                futex.as_ptr(),
                op,
                expected,
                ts.as_ptr() as usize,
                0,
                FUTEX_BITSET_MATCH_ANY,
            )
        }
    };
    match result {
        Ok(_) => Ok(()),
        Err(syscall::EAGAIN) | Err(syscall::EINTR) => Ok(()),
        Err(syscall::ETIMEDOUT) => Err(TimedOut),
        Err(errno) => panic!("futex wait failed: errno {errno}"),
    }
}

/// Wake up to `count` threads blocked on `futex`.
pub fn wake(futex: &AtomicU32, count: u32) {
    // SAFETY: the word address comes from a live reference; FUTEX_WAKE
    // does not access the word.
    let _ = unsafe {
        syscall::sys_futex(futex.as_ptr(), FUTEX_WAKE | FUTEX_PRIVATE_FLAG, count, 0, 0, 0)
    };
}

/// Wake up to `count` threads blocked on a raw futex address.
///
/// The kernel uses the address purely as a key and FUTEX_WAKE does not
/// access the word, so the storage behind `addr` may already be gone.
/// Used by the condvar notify rendezvous, where the counter's owner can
/// return between the final decrement and this wake.
///
/// # Safety
///
/// `addr` must have been a valid futex word at the time waiters blocked
/// on it.
pub(crate) unsafe fn wake_raw(addr: *const AtomicU32, count: u32) {
    // SAFETY: per the function contract; the word itself is never read.
    let _ = unsafe {
        syscall::sys_futex(
            addr as *const u32,
            FUTEX_WAKE | FUTEX_PRIVATE_FLAG,
            count,
            0,
            0,
            0,
        )
    };
}

/// If `*src == src_expected`, wake `wake_count` threads blocked on `src`
/// and move up to `requeue_count` of the remainder to block on `dst`.
///
/// A value mismatch means `src` changed under the caller; every use in
/// this crate makes that benign, so the status is discarded.
pub fn requeue(src: &AtomicU32, wake_count: u32, src_expected: u32, dst: &AtomicU32, requeue_count: u32) {
    // SAFETY: both word addresses come from live references.
    let _ = unsafe {
        syscall::sys_futex(
            src.as_ptr(),
            FUTEX_CMP_REQUEUE | FUTEX_PRIVATE_FLAG,
            wake_count,
            requeue_count as usize,
            dst.as_ptr() as usize,
            src_expected,
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn op_constants_match_libc() {
        assert_eq!(FUTEX_WAKE, libc::FUTEX_WAKE);
        assert_eq!(FUTEX_CMP_REQUEUE, libc::FUTEX_CMP_REQUEUE);
        assert_eq!(FUTEX_WAIT_BITSET, libc::FUTEX_WAIT_BITSET);
        assert_eq!(FUTEX_PRIVATE_FLAG, libc::FUTEX_PRIVATE_FLAG);
    }

    #[test]
    fn wait_returns_immediately_on_mismatch() {
        let word = AtomicU32::new(1);
        // Expected value differs from the stored one; the kernel reports
        // EAGAIN, which folds into Ok.
        assert_eq!(wait(&word, 0, DEADLINE_INFINITE), Ok(()));
    }

    #[test]
    fn wait_times_out_on_unchanged_word() {
        let word = AtomicU32::new(7);
        let start = monotonic_now();
        let result = wait(&word, 7, deadline_after(20_000_000));
        let elapsed = monotonic_now() - start;
        assert_eq!(result, Err(TimedOut));
        assert!(elapsed >= 15_000_000, "woke after {elapsed}ns");
    }

    #[test]
    fn wait_times_out_on_past_deadline() {
        let word = AtomicU32::new(7);
        assert_eq!(wait(&word, 7, 0), Err(TimedOut));
        assert_eq!(wait(&word, 7, monotonic_now() - 1), Err(TimedOut));
    }

    #[test]
    fn wake_releases_a_parked_thread() {
        let word = Arc::new(AtomicU32::new(0));
        let theirs = Arc::clone(&word);
        let parked = thread::spawn(move || {
            while theirs.load(Ordering::SeqCst) == 0 {
                let _ = wait(&theirs, 0, DEADLINE_INFINITE);
            }
        });
        thread::sleep(Duration::from_millis(50));
        word.store(1, Ordering::SeqCst);
        wake(&word, 1);
        parked.join().unwrap();
    }

    #[test]
    fn requeue_moves_a_sleeper_to_the_target_word() {
        let src = Arc::new(AtomicU32::new(0));
        let dst = Arc::new(AtomicU32::new(0));
        let (src2, dst2) = (Arc::clone(&src), Arc::clone(&dst));
        let parked = thread::spawn(move || {
            // Block on src until the test releases us through dst.
            while src2.load(Ordering::SeqCst) == 0 && dst2.load(Ordering::SeqCst) == 0 {
                let _ = wait(&src2, 0, DEADLINE_INFINITE);
            }
        });
        thread::sleep(Duration::from_millis(50));

        // Move the sleeper without waking it, then release via dst.
        requeue(&src, 0, 0, &dst, 1);
        dst.store(1, Ordering::SeqCst);
        wake(&dst, 1);
        parked.join().unwrap();
    }
}
