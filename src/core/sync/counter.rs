//! A concurrent waitable counter.
use crate::Result;

use super::condvar::Condvar;
use super::mutex::Mutex;

/// Non-negative integer that threads can increment, reset, or block on
/// until it reaches a specific value.
///
/// The mutex and condition variable are always used in tandem; every
/// mutation broadcasts so that all waiters re-check their target value.
pub struct WaitableCounter {
    value: Mutex<usize>,
    cond: Condvar,
}

impl WaitableCounter {
    /// Create a counter initialized to 0.
    pub fn new() -> Self {
        Self {
            value: Mutex::new(true, false, 0),
            cond: Condvar::new(),
        }
    }

    /// Increment the counter by one and wake all waiters.
    pub fn increment(&self) -> Result<()> {
        let mut guard = self.value.lock()?;
        *guard += 1;
        self.cond.broadcast();
        Mutex::unlock(guard, Ok(()))
    }

    /// Reset the counter to 0 and wake all waiters.
    pub fn reset(&self) -> Result<()> {
        let mut guard = self.value.lock()?;
        *guard = 0;
        self.cond.broadcast();
        Mutex::unlock(guard, Ok(()))
    }

    /// Block until the counter takes exactly `value`.
    ///
    /// Returns immediately if the counter already has that value. The
    /// loop implicitly handles spurious wake-ups.
    pub fn wait_for(&self, value: usize) -> Result<()> {
        let mut guard = self.value.lock()?;
        while *guard != value {
            guard = self.cond.wait(guard)?;
        }
        Ok(())
    }

    /// Current value of the counter.
    pub fn get(&self) -> Result<usize> {
        let guard = self.value.lock()?;
        let value = *guard;
        Mutex::unlock(guard, Ok(value))
    }
}

impl Default for WaitableCounter {
    fn default() -> Self {
        Self::new()
    }
}
