//! Mutex wrapper with optional recursive-lock detection.
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::Result;
use crate::error::TaskTreeError;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    // Ids start at 1, so a vacant owner field (0) can never match a
    // live thread and produce a false positive.
    static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

fn current_thread_id() -> u64 {
    THREAD_ID.with(|id| *id)
}

/// A mutex protecting a value of type `T`.
///
/// Construction takes two parameters: `required` selects between a full
/// mutex and a light-weight shell for single-threaded execution, and
/// `checked` enables recursive-lock detection. A checked mutex fails
/// with [`TaskTreeError::RecursiveLock`] instead of deadlocking when the
/// owning thread locks it a second time.
///
/// Locking returns a guard; dropping the guard releases the lock. The
/// explicit [`Mutex::unlock`] helper releases a guard while passing a
/// carried result through unchanged, which keeps error flow linear at
/// call sites that compute a result under the lock.
///
/// # Examples
///
/// ```rust
/// use tasktree::core::sync::Mutex;
///
/// let mutex = Mutex::new(true, true, 0u32);
/// let mut guard = mutex.lock().unwrap();
/// *guard += 1;
/// assert!(mutex.lock().is_err()); // recursion is detected, not deadlocked
/// drop(guard);
/// assert_eq!(*mutex.lock().unwrap(), 1);
/// ```
pub struct Mutex<T> {
    // The shell variant wraps the value in the same std mutex; an
    // uncontended lock is cheap enough that avoiding it is not worth
    // giving up memory safety.
    inner: std::sync::Mutex<T>,
    required: bool,
    checked: bool,

    // Owner thread id while locked, 0 otherwise. Only written by the
    // thread holding the lock, so relaxed ordering suffices; other
    // threads read it merely to compare against their own id.
    owner: AtomicU64,
}

/// RAII guard for [`Mutex`]. The lock is released on drop.
pub struct MutexGuard<'a, T> {
    inner: Option<std::sync::MutexGuard<'a, T>>,
    mutex: &'a Mutex<T>,
}

impl<T: std::fmt::Debug> std::fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutexGuard").field("inner", &self.inner).finish()
    }
}

impl<T> Mutex<T> {
    /// Create a new mutex around `value`.
    ///
    /// # Arguments
    ///
    /// * `required` - produce a full mutex; `false` selects the
    ///   single-threaded shell
    /// * `checked` - detect recursive locking attempts
    pub fn new(required: bool, checked: bool, value: T) -> Self {
        Self {
            inner: std::sync::Mutex::new(value),
            required,
            checked,
            owner: AtomicU64::new(0),
        }
    }

    /// Whether this is a full mutex rather than a single-threaded shell.
    pub fn is_required(&self) -> bool {
        self.required
    }

    /// Acquire the lock.
    ///
    /// A checked mutex reports [`TaskTreeError::RecursiveLock`] when the
    /// calling thread already holds it. A mutex whose holder panicked
    /// reports [`TaskTreeError::InvalidUnlock`]: the lock was never
    /// released in an orderly way.
    pub fn lock(&self) -> Result<MutexGuard<'_, T>> {
        if self.checked {
            // In the shell, the owner field degenerates to a plain
            // reentrancy marker; the check is the same either way.
            let me = current_thread_id();
            if self.owner.load(Ordering::Relaxed) == me {
                return Err(TaskTreeError::RecursiveLock);
            }
            let guard = self
                .inner
                .lock()
                .map_err(|_| TaskTreeError::InvalidUnlock)?;
            self.owner.store(me, Ordering::Relaxed);
            Ok(MutexGuard {
                inner: Some(guard),
                mutex: self,
            })
        } else {
            let guard = self
                .inner
                .lock()
                .map_err(|_| TaskTreeError::InvalidUnlock)?;
            Ok(MutexGuard {
                inner: Some(guard),
                mutex: self,
            })
        }
    }

    /// Release `guard` and pass `carried` through unchanged.
    ///
    /// This is a caller convenience mirroring the common shape
    /// "compute under the lock, then unlock and return": the carried
    /// result flows through the unlock unchanged.
    pub fn unlock<R>(guard: MutexGuard<'_, T>, carried: Result<R>) -> Result<R> {
        drop(guard);
        carried
    }

    fn note_released(&self) {
        if self.checked {
            self.owner.store(0, Ordering::Relaxed);
        }
    }

    fn note_acquired(&self) {
        if self.checked {
            self.owner.store(current_thread_id(), Ordering::Relaxed);
        }
    }
}

impl<'a, T> MutexGuard<'a, T> {
    /// Split the guard into its raw parts for a condition-variable wait.
    /// The owner bookkeeping is released; the caller re-establishes it
    /// through `from_parts` once the wait returns.
    pub(super) fn into_parts(mut self) -> (std::sync::MutexGuard<'a, T>, &'a Mutex<T>) {
        let inner = self.inner.take().expect("guard already consumed");
        let mutex = self.mutex;
        mutex.note_released();
        (inner, mutex)
    }

    pub(super) fn from_parts(inner: std::sync::MutexGuard<'a, T>, mutex: &'a Mutex<T>) -> Self {
        mutex.note_acquired();
        Self {
            inner: Some(inner),
            mutex,
        }
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.inner.as_ref().expect("guard already consumed")
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.inner.as_mut().expect("guard already consumed")
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        // Reset the owner before the inner guard releases the lock, so
        // no other thread can observe a stale owner under the lock.
        if self.inner.is_some() {
            self.mutex.note_released();
            self.inner = None;
        }
    }
}
