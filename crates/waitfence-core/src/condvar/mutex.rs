//! Mutex capability for the condition variable.
//!
//! [`Condvar::timed_wait`](super::Condvar::timed_wait) is generic over
//! [`MutexOps`] rather than tied to one mutex: any lock that can expose
//! its futex word and track handed-off waiters can participate in the
//! requeue-based wake chain. [`FutexMutex`] is the reference
//! implementation, running the same three-state protocol as the condvar's
//! internal lock.

use core::sync::atomic::{AtomicU32, Ordering};

use super::spinlock::{self, LOCKED_MAYBE_WAITERS, LOCKED_NO_WAITERS, UNLOCKED};

/// Capability set a mutex must provide to participate in a condvar wait.
pub trait MutexOps {
    /// The word the mutex actually blocks on. Requeued condvar waiters
    /// are parked on this word, so it must be the real sleep address.
    fn futex_word(&self) -> &AtomicU32;

    /// Acquire the mutex. `Err` carries an implementation-defined code
    /// that the condvar surfaces inside
    /// [`WaitError::BadState`](super::WaitError::BadState).
    fn lock(&self) -> Result<(), i32>;

    /// Acquire the mutex and account for condvar waiters being handed to
    /// it: adjust an exact waiter count by `waiters_delta`, or mark the
    /// mutex as potentially having waiters.
    fn lock_with_waiters(&self, waiters_delta: i32) -> Result<(), i32>;

    /// Release the mutex, waking a successor if one may be queued.
    fn unlock(&self);
}

/// Three-state futex mutex.
///
/// Fast path is a single CAS; contended acquisitions promote the state to
/// LOCKED_MAYBE_WAITERS so that unlock knows to issue a wake. The waiter
/// accounting is of the sticky-bit flavor: `lock_with_waiters` acquires
/// directly into the contended state, because a requeued condvar waiter
/// sleeps on this word without the fast path ever having observed it.
pub struct FutexMutex {
    state: AtomicU32,
}

impl FutexMutex {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(UNLOCKED),
        }
    }
}

impl Default for FutexMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl MutexOps for FutexMutex {
    fn futex_word(&self) -> &AtomicU32 {
        &self.state
    }

    fn lock(&self) -> Result<(), i32> {
        spinlock::lock(&self.state);
        Ok(())
    }

    fn lock_with_waiters(&self, _waiters_delta: i32) -> Result<(), i32> {
        loop {
            if self
                .state
                .compare_exchange(UNLOCKED, LOCKED_MAYBE_WAITERS, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Ok(());
            }
            let _ = self.state.compare_exchange(
                LOCKED_NO_WAITERS,
                LOCKED_MAYBE_WAITERS,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
            spinlock::wait_while(&self.state, LOCKED_MAYBE_WAITERS);
        }
    }

    fn unlock(&self) {
        spinlock::unlock(&self.state);
    }
}
