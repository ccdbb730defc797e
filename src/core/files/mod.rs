//! Shared-handle file cache.
//!
//! An unbounded number of logical [`CachedFile`] objects share a bounded
//! pool of OS-level file handles. Each logical file owns a small set of
//! aligned data buffers, defers seeks until the next data access, and
//! supports read-after-write without an intermediate flush. The handle
//! pool is safe to share across threads; an individual `CachedFile` is
//! not.

mod cached_file;
mod handle_pool;

use std::sync::Arc;

use bitflags::bitflags;
use once_cell::sync::Lazy;

pub use cached_file::{CachedFile, FileStats};
pub use handle_pool::{HandlePool, PoolStats};

use crate::config::DEFAULT_MAX_SHARED_HANDLES;

bitflags! {
    /// Open flags supported by [`CachedFile::open`].
    ///
    /// The set is deliberately small: binary mode, buffering, and
    /// cross-thread use are properties of the cache itself, not options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Open for reading.
        const READ = 1 << 0;
        /// Open for writing.
        const WRITE = 1 << 1;
        /// Create the file if it does not exist.
        const CREATE = 1 << 2;
        /// Every write lands at the current end of the file, wherever
        /// the pointer was moved in between. Implies write access.
        const APPEND = 1 << 3;
        /// Truncate the file to zero length on open.
        const TRUNCATE = 1 << 4;
        /// Fail if the file already exists (with `CREATE`).
        const EXCL = 1 << 5;
    }
}

static GLOBAL_POOL: Lazy<Arc<HandlePool>> =
    Lazy::new(|| Arc::new(HandlePool::new(DEFAULT_MAX_SHARED_HANDLES)));

/// The process-wide shared handle pool.
///
/// Most callers go through [`CachedFile::open`], which uses this pool
/// implicitly. Subsystems that want isolation construct their own
/// [`HandlePool`] and use [`CachedFile::open_with_pool`].
pub fn global_pool() -> Arc<HandlePool> {
    Arc::clone(&GLOBAL_POOL)
}

/// Maximum number of OS-level file handles the process-wide pool keeps
/// open at the same time.
///
/// The limit may be exceeded transiently when more files than the limit
/// are actively read or written at the same instant.
pub fn get_max_shared_handles() -> usize {
    GLOBAL_POOL.capacity()
}

/// Allow up to `new_max` OS-level file handles in the process-wide pool.
///
/// The limit may be changed at any time; shrinking evicts surplus
/// handles in LRU order. `0` is a valid limit.
pub fn set_max_shared_handles(new_max: usize) {
    GLOBAL_POOL.set_capacity(new_max);
}
