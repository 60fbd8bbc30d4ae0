//! Futex-backed waiter coordination primitives.
//!
//! Two independent cores share this crate because they share a discipline:
//! intrusive queues plus carefully ordered atomics against an OS primitive.
//!
//! - [`condvar`]: a condition variable built directly on the kernel futex,
//!   parameterized over a mutex capability ([`condvar::MutexOps`]). Waiters
//!   queue FIFO on stack-allocated nodes; signalling claims the oldest
//!   waiters and hands the wake down the chain by requeueing each barrier
//!   onto the caller mutex's futex.
//! - [`fence`]: a reference-counted one-shot event coordination object.
//!   Armed references fire strictly in arming order, one per event signal,
//!   each optionally releasing up to two chained references.
//!
//! The condvar core issues raw futex syscalls and is therefore Linux
//! (x86_64 / aarch64) only; the fence core is OS-independent.

#![deny(unsafe_code)]

#[allow(unsafe_code)]
#[cfg(target_os = "linux")]
pub mod condvar;
pub mod fence;
#[allow(unsafe_code)]
#[cfg(target_os = "linux")]
pub mod futex;
#[allow(unsafe_code)]
#[cfg(target_os = "linux")]
mod syscall;

#[cfg(target_os = "linux")]
pub use condvar::{Condvar, FutexMutex, MutexOps, WaitError};
pub use fence::{
    DispatchError, EVENT_SIGNALED, Event, Fence, FenceCallback, FenceReference, LocalDispatcher,
    LocalEvent, Signals, WaitDispatcher,
};
