//! Synchronization primitives the engine core rests on.
//!
//! The scheduler and the file cache do not use `std::sync` directly;
//! they go through these wrappers, which add optional recursive-lock
//! detection, error-returning lock acquisition, and a waitable counter.
//! A mutex constructed with `required = false` is a shell for
//! single-threaded execution that keeps the same error reporting.

mod condvar;
mod counter;
mod mutex;

pub use condvar::Condvar;
pub use counter::WaitableCounter;
pub use mutex::{Mutex, MutexGuard};
