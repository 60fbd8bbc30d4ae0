//! Condition variable over the kernel futex.
//!
//! Waiters queue on an intrusive doubly-linked list of stack-allocated
//! nodes guarded by an internal three-state spinlock. Signalling claims
//! the oldest waiters, detaches them from the queue as a chain, and wakes
//! only the first; each claimed waiter then hands the wake forward by
//! requeueing its successor's barrier sleeper onto the caller mutex's
//! futex, so the rest of the chain wakes through mutex unlock instead of
//! stampeding the condvar.
//!
//! A waiter that times out claims its own node by moving it WAITING to
//! LEAVING and unlinks itself; a signaller that loses that race parks on a
//! stack counter until every such node has finished unlinking, which keeps
//! the detached chain's links stable before any claimed waiter runs.

use core::fmt;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use super::mutex::MutexOps;
use super::spinlock::{self, LOCKED_MAYBE_WAITERS};
use crate::futex::{self, TimedOut};

const WAITING: u32 = 0;
const SIGNALED: u32 = 1;
const LEAVING: u32 = 2;

/// Failure modes of [`Condvar::timed_wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// The deadline expired before any signal claimed the waiter. The
    /// caller mutex has been re-acquired.
    TimedOut,
    /// Re-acquiring the caller mutex failed; its state is unspecified.
    BadState {
        /// Implementation-defined code reported by the mutex.
        mutex_err: i32,
    },
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimedOut => f.write_str("wait deadline expired"),
            Self::BadState { mutex_err } => {
                write!(f, "mutex re-acquisition failed (mutex error {mutex_err})")
            }
        }
    }
}

impl std::error::Error for WaitError {}

/// One queued waiter, allocated in the waiting thread's frame.
///
/// The queue holds raw node addresses; they stay valid because the owning
/// thread cannot leave `timed_wait` while its node is reachable. The
/// `state` word is the handoff token: only the side that wins the CAS out
/// of WAITING may touch the node's links outside the queue lock.
struct Waiter {
    prev: AtomicPtr<Waiter>,
    next: AtomicPtr<Waiter>,
    state: AtomicU32,
    barrier: AtomicU32,
    notify: AtomicPtr<AtomicU32>,
}

impl Waiter {
    fn new() -> Self {
        Self {
            prev: AtomicPtr::new(ptr::null_mut()),
            next: AtomicPtr::new(ptr::null_mut()),
            state: AtomicU32::new(WAITING),
            barrier: AtomicU32::new(LOCKED_MAYBE_WAITERS),
            notify: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

/// A futex-backed condition variable.
///
/// `head` is the newest waiter and `tail` the oldest (next to be
/// signalled); either both are null or both are set. `next` links run from
/// head toward tail, `prev` links from tail toward head.
pub struct Condvar {
    lock: AtomicU32,
    head: AtomicPtr<Waiter>,
    tail: AtomicPtr<Waiter>,
}

impl Condvar {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            lock: AtomicU32::new(0),
            head: AtomicPtr::new(ptr::null_mut()),
            tail: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Block until signalled or until `deadline` (absolute CLOCK_MONOTONIC
    /// nanoseconds, [`futex::DEADLINE_INFINITE`] for no timeout).
    ///
    /// The caller must hold `mutex`. On `Ok` and on `Err(TimedOut)` the
    /// mutex is held again when this returns; on `Err(BadState)` its state
    /// is unspecified.
    pub fn timed_wait<M: MutexOps>(&self, mutex: &M, deadline: i64) -> Result<(), WaitError> {
        let node = Waiter::new();
        let node_ptr = ptr::from_ref(&node).cast_mut();

        spinlock::lock(&self.lock);

        // Insert at head; logically the end of the queue.
        let old_head = self.head.load(Ordering::SeqCst);
        node.next.store(old_head, Ordering::SeqCst);
        self.head.store(node_ptr, Ordering::SeqCst);
        if old_head.is_null() {
            self.tail.store(node_ptr, Ordering::SeqCst);
        } else {
            // SAFETY: old_head is on the queue, so its owner is parked
            // inside timed_wait and the node is live.
            unsafe { (*old_head).prev.store(node_ptr, Ordering::SeqCst) };
        }

        spinlock::unlock(&self.lock);

        mutex.unlock();

        // Sleep until the barrier opens. This loop exits after:
        //  1) signal() opened the barrier directly,
        //  2) a mutex unlock woke us following a requeue handoff,
        //  3) deadline expiry.
        loop {
            match futex::wait(&node.barrier, LOCKED_MAYBE_WAITERS, deadline) {
                Err(TimedOut) => break,
                Ok(()) => {
                    if node.barrier.load(Ordering::SeqCst) != LOCKED_MAYBE_WAITERS {
                        break;
                    }
                }
            }
        }

        // Whichever side moves the node out of WAITING owns the exit path.
        // Losing here means a signal claimed us between the kernel timeout
        // and this CAS; that wake counts, so take the signalled path.
        if node
            .state
            .compare_exchange(WAITING, LEAVING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return self.leave_on_timeout(&node, node_ptr, mutex);
        }

        // Relock our own barrier first to control wake order.
        spinlock::lock(&node.barrier);

        // By now our part of the queue cannot change further: signal()
        // detached it, and every timed-out node finished unlinking before
        // signal() opened the first barrier. The links are safe to read
        // without the queue lock.
        let prev = node.prev.load(Ordering::SeqCst);
        let next = node.next.load(Ordering::SeqCst);

        // Waiter accounting is adjusted only at the two ends of the chain.
        let mut waiters_delta = 0;
        if prev.is_null() {
            waiters_delta += 1;
        }
        if next.is_null() {
            waiters_delta -= 1;
        }

        // The mutex must come out of this marked as contended (or with its
        // waiter count adjusted): a successor we requeue below must be
        // woken by a future mutex unlock, and if we were requeued
        // ourselves there may be another thread queued on the mutex
        // behind us that needs the same.
        let mut result = Ok(());
        if let Err(mutex_err) = mutex.lock_with_waiters(waiters_delta) {
            result = Err(WaitError::BadState { mutex_err });
        }

        if !prev.is_null() {
            // Open the next claimed waiter's barrier and move its sleeper
            // onto the mutex futex so that unlocking the mutex wakes it.
            // SAFETY: prev is in our detached chain, parked on its barrier
            // until this requeue; its frame is live.
            unsafe { spinlock::unlock_requeue(&(*prev).barrier, mutex.futex_word()) };
        }

        result
    }

    /// Timed out before any signal claimed the node: unlink it, settle the
    /// rendezvous with any signaller that saw the node LEAVING, and
    /// re-acquire the caller mutex.
    fn leave_on_timeout<M: MutexOps>(
        &self,
        node: &Waiter,
        node_ptr: *mut Waiter,
        mutex: &M,
    ) -> Result<(), WaitError> {
        spinlock::lock(&self.lock);

        let prev = node.prev.load(Ordering::SeqCst);
        let next = node.next.load(Ordering::SeqCst);
        if self.head.load(Ordering::SeqCst) == node_ptr {
            self.head.store(next, Ordering::SeqCst);
        } else if !prev.is_null() {
            // SAFETY: a listed node's neighbours are parked waiters (or
            // detached chain members a signaller is still holding back),
            // so they are live while we hold the queue lock.
            unsafe { (*prev).next.store(next, Ordering::SeqCst) };
        }
        if self.tail.load(Ordering::SeqCst) == node_ptr {
            self.tail.store(prev, Ordering::SeqCst);
        } else if !next.is_null() {
            // SAFETY: as above.
            unsafe { (*next).prev.store(prev, Ordering::SeqCst) };
        }

        spinlock::unlock(&self.lock);

        // A signaller that observed this node after the LEAVING claim but
        // before the unlink above stored a counter address here and is
        // parked on it; drop our share and wake it on the last one.
        let notify = node.notify.load(Ordering::SeqCst);
        if !notify.is_null() {
            // SAFETY: the signaller keeps the counter alive until it reads
            // zero, which cannot happen before this decrement lands.
            unsafe {
                if (*notify).fetch_sub(1, Ordering::SeqCst) == 1 {
                    futex::wake_raw(notify, 1);
                }
            }
        }

        // A plain lock suffices: the LEAVING claim means no signal ever
        // selected this node, so no requeue handoff can involve it.
        match mutex.lock() {
            Ok(()) => Err(WaitError::TimedOut),
            Err(mutex_err) => Err(WaitError::BadState { mutex_err }),
        }
    }

    /// Wake up to `n` waiters, oldest first; `n = -1` wakes all.
    pub fn signal(&self, n: i32) {
        let mut n = n;
        let mut first: *mut Waiter = ptr::null_mut();
        // Rendezvous counter for nodes caught LEAVING: each one unlinks
        // itself and drops the counter; the claimed chain may not run
        // until it reaches zero.
        let pending = AtomicU32::new(0);

        spinlock::lock(&self.lock);

        let mut p = self.tail.load(Ordering::SeqCst);
        while n != 0 && !p.is_null() {
            // SAFETY: p is on the queue, so its owning thread is parked in
            // timed_wait or blocked on this queue lock to unlink; either
            // way the node is live while we hold the lock.
            let waiter = unsafe { &*p };
            if waiter
                .state
                .compare_exchange(WAITING, SIGNALED, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                n -= 1;
                if first.is_null() {
                    first = p;
                }
            } else {
                // Lost to a timeout: the waiter went LEAVING but has not
                // unlinked yet. Have it notify us once it has.
                pending.fetch_add(1, Ordering::SeqCst);
                waiter
                    .notify
                    .store(ptr::from_ref(&pending).cast_mut(), Ordering::SeqCst);
            }
            p = waiter.prev.load(Ordering::SeqCst);
        }

        // Split the queue: everything from the old tail through p's next
        // neighbour goes with the claimed chain; p and newer stay queued.
        if p.is_null() {
            self.head.store(ptr::null_mut(), Ordering::SeqCst);
        } else {
            // SAFETY: p is a live queued node, as above.
            let keep = unsafe { &*p };
            let split = keep.next.load(Ordering::SeqCst);
            if !split.is_null() {
                // SAFETY: split is the newest node of the detached chain.
                unsafe { (*split).prev.store(ptr::null_mut(), Ordering::SeqCst) };
            }
            keep.next.store(ptr::null_mut(), Ordering::SeqCst);
        }
        self.tail.store(p, Ordering::SeqCst);

        spinlock::unlock(&self.lock);

        // Wait for every LEAVING node to finish unlinking before letting
        // the claimed chain read its links.
        loop {
            let current = pending.load(Ordering::SeqCst);
            if current == 0 {
                break;
            }
            spinlock::wait_while(&pending, current);
        }

        if !first.is_null() {
            // SAFETY: first is claimed and its owner is parked on the
            // barrier this opens.
            unsafe { spinlock::unlock(&(*first).barrier) };
        }
    }

    /// Wake every waiter.
    pub fn broadcast(&self) {
        self.signal(-1);
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}
