//! Futex-backed condition variable, parameterized over a mutex capability.
//!
//! Layered as three pieces: a three-state spinlock protocol over bare
//! futex words, the [`MutexOps`] capability with a reference
//! [`FutexMutex`] implementation, and the [`Condvar`] itself.

pub mod cond;
pub mod mutex;
pub(crate) mod spinlock;

pub use cond::{Condvar, WaitError};
pub use mutex::{FutexMutex, MutexOps};
