//! Three-state futex lock protocol.
//!
//! State values: UNLOCKED, LOCKED_NO_WAITERS, LOCKED_MAYBE_WAITERS. The
//! third state records that an unlock must issue a futex wake. The
//! operations work on bare [`AtomicU32`] words rather than a lock type:
//! the condvar runs the same protocol over its internal queue lock and
//! over every waiter's barrier word, including the requeue variant of
//! unlock used for the wake handoff.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::futex;

pub(crate) const UNLOCKED: u32 = 0;
pub(crate) const LOCKED_NO_WAITERS: u32 = 1;
pub(crate) const LOCKED_MAYBE_WAITERS: u32 = 2;

const SPIN_LIMIT: u32 = 100;

/// Spin briefly, then futex-wait, until `word` moves off `current`.
pub(crate) fn wait_while(word: &AtomicU32, current: u32) {
    let mut spins = SPIN_LIMIT;
    while spins > 0 {
        if word.load(Ordering::SeqCst) != current {
            return;
        }
        core::hint::spin_loop();
        spins -= 1;
    }
    while word.load(Ordering::SeqCst) == current {
        let _ = futex::wait(word, current, futex::DEADLINE_INFINITE);
    }
}

pub(crate) fn lock(word: &AtomicU32) {
    if word
        .compare_exchange(UNLOCKED, LOCKED_NO_WAITERS, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        return;
    }
    let _ = word.compare_exchange(
        LOCKED_NO_WAITERS,
        LOCKED_MAYBE_WAITERS,
        Ordering::SeqCst,
        Ordering::SeqCst,
    );
    loop {
        wait_while(word, LOCKED_MAYBE_WAITERS);
        if word
            .compare_exchange(UNLOCKED, LOCKED_MAYBE_WAITERS, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return;
        }
    }
}

pub(crate) fn unlock(word: &AtomicU32) {
    if word.swap(UNLOCKED, Ordering::SeqCst) == LOCKED_MAYBE_WAITERS {
        futex::wake(word, 1);
    }
}

/// Release `word` and move one of its sleepers to block on `target`
/// instead of waking it.
pub(crate) fn unlock_requeue(word: &AtomicU32, target: &AtomicU32) {
    word.store(UNLOCKED, Ordering::SeqCst);
    futex::requeue(word, 0, UNLOCKED, target, 1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn uncontended_lock_unlock_round_trip() {
        let word = AtomicU32::new(UNLOCKED);
        lock(&word);
        assert_eq!(word.load(Ordering::SeqCst), LOCKED_NO_WAITERS);
        unlock(&word);
        assert_eq!(word.load(Ordering::SeqCst), UNLOCKED);
    }

    #[test]
    fn contended_increments_are_mutually_exclusive() {
        let word = Arc::new(AtomicU32::new(UNLOCKED));
        let counter = Arc::new(std::cell::UnsafeCell::new(0u64));

        struct SendPtr(Arc<std::cell::UnsafeCell<u64>>);
        // SAFETY: all access to the cell happens under `word`.
        unsafe impl Send for SendPtr {}

        let threads: u64 = 4;
        let per_thread: u64 = 10_000;
        let mut handles = Vec::new();
        for _ in 0..threads {
            let word = Arc::clone(&word);
            let counter = SendPtr(Arc::clone(&counter));
            handles.push(thread::spawn(move || {
                let counter = counter;
                for _ in 0..per_thread {
                    lock(&word);
                    // SAFETY: the lock is held.
                    unsafe { *counter.0.get() += 1 };
                    unlock(&word);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        lock(&word);
        // SAFETY: the lock is held.
        let total = unsafe { *counter.get() };
        unlock(&word);
        assert_eq!(total, threads * per_thread);
    }

    #[test]
    fn wait_while_returns_once_word_changes() {
        let word = Arc::new(AtomicU32::new(LOCKED_MAYBE_WAITERS));
        let theirs = Arc::clone(&word);
        let waiter = thread::spawn(move || wait_while(&theirs, LOCKED_MAYBE_WAITERS));
        thread::sleep(std::time::Duration::from_millis(20));
        word.store(UNLOCKED, Ordering::SeqCst);
        futex::wake(&word, 1);
        waiter.join().unwrap();
    }
}
