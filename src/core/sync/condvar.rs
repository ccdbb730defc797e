//! Condition variable wrapper operating on the engine's mutex guards.
use crate::Result;
use crate::error::TaskTreeError;

use super::mutex::MutexGuard;

/// Thin wrapper around the platform condition variable.
///
/// `wait` atomically releases the mutex behind the given guard, blocks,
/// and re-acquires the mutex on wake-up. Wake-ups may be spurious; every
/// wait site must re-check its predicate in a loop.
pub struct Condvar {
    inner: std::sync::Condvar,
}

impl Condvar {
    /// Create a new condition variable.
    pub fn new() -> Self {
        Self {
            inner: std::sync::Condvar::new(),
        }
    }

    /// Wake one waiting thread, if any.
    pub fn signal(&self) {
        self.inner.notify_one();
    }

    /// Wake all waiting threads.
    pub fn broadcast(&self) {
        self.inner.notify_all();
    }

    /// Release the mutex, block until signalled, and re-acquire it.
    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> Result<MutexGuard<'a, T>> {
        let (inner, mutex) = guard.into_parts();
        let inner = self
            .inner
            .wait(inner)
            .map_err(|_| TaskTreeError::InvalidUnlock)?;
        Ok(MutexGuard::from_parts(inner, mutex))
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}
