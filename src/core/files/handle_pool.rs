//! Bounded pool of OS-level file handles shared by all cached files.
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};

use log::debug;

use crate::Result;
use crate::core::sync::Mutex;
use crate::error::TaskTreeError;

use super::OpenFlags;

const FNV1_PRIME_32: u32 = 0x0100_0193;
const FNV1_BASE_32: u32 = 2_166_136_261;

/// FNV-1a 32 bit checksum over `input`, used to cheaply pre-filter file
/// name comparisons in the pool.
pub(super) fn fnv1a_32(input: &[u8]) -> u32 {
    let mut hash = FNV1_BASE_32;
    for byte in input {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(FNV1_PRIME_32);
    }
    hash
}

/// Identity of a logical file as seen by the pool: enough to match an
/// existing handle or to open a fresh one.
pub(super) struct FileIdent {
    pub(super) name: PathBuf,
    pub(super) name_hash: u32,
    pub(super) reopen_flags: OpenFlags,
    pub(super) handle_hint: Option<usize>,
}

impl FileIdent {
    pub(super) fn new(name: PathBuf, flags: OpenFlags) -> Self {
        let name_hash = fnv1a_32(name.as_os_str().as_encoded_bytes());
        Self {
            name,
            name_hash,
            reopen_flags: flags,
            handle_hint: None,
        }
    }
}

/// An OS handle loaned out of the pool.
///
/// The holder has exclusive use of the underlying file until the handle
/// is released back. `position` caches the OS file position so that
/// redundant seeks can be skipped.
pub(super) struct SharedHandle {
    pub(super) idx: usize,
    pub(super) file: std::fs::File,
    name: PathBuf,
    name_hash: u32,
    reopen_flags: OpenFlags,
    pub(super) position: u64,
}

impl SharedHandle {
    /// The path the handle was opened for, for error attribution.
    pub(super) fn path(&self) -> &Path {
        &self.name
    }

    /// Align the OS file position with `offset`, seeking only when the
    /// cached position differs.
    pub(super) fn seek_to(&mut self, offset: u64) -> Result<()> {
        if self.position != offset {
            let actual = self
                .file
                .seek(SeekFrom::Start(offset))
                .map_err(|e| TaskTreeError::io(&self.name, e))?;
            self.position = actual;
        }
        Ok(())
    }

    /// Seek to the end of the OS file and return its length.
    pub(super) fn seek_end(&mut self) -> Result<u64> {
        let end = self
            .file
            .seek(SeekFrom::End(0))
            .map_err(|e| TaskTreeError::io(&self.name, e))?;
        self.position = end;
        Ok(end)
    }
}

// A slot in the pool's handle array. Loaned slots keep their index
// reserved while the handle is out with a caller.
enum Slot {
    Open(OpenEntry),
    Loaned,
    Unused { next: Option<usize> },
}

// A parked handle with an open OS file, linked into the open-LRU.
struct OpenEntry {
    file: std::fs::File,
    name: PathBuf,
    name_hash: u32,
    reopen_flags: OpenFlags,
    position: u64,
    prev: Option<usize>,
    next: Option<usize>,
}

struct PoolState {
    slots: Vec<Slot>,

    first_open: Option<usize>,
    last_open: Option<usize>,
    first_unused: Option<usize>,

    capacity: usize,
    // Slots whose OS file is open: loaned ones plus the open-LRU.
    open_count: usize,
    // Slots currently handed out to callers.
    used_count: usize,
    // Slots without an OS file, parked in the unused list.
    unused_count: usize,
}

/// Counters describing the current state of a [`HandlePool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Configured handle cap.
    pub capacity: usize,
    /// Handles with an open OS file (loaned or parked).
    pub open_count: usize,
    /// Handles currently loaned out to callers.
    pub used_count: usize,
    /// Slots without an OS file, ready for recycling.
    pub unused_count: usize,
}

/// A bounded pool of OS-level file handles.
///
/// Handles are loaned to whichever logical file currently needs one and
/// parked in an LRU list on release. When the pool is at capacity, a
/// request for a new handle reclaims the least recently used parked
/// handle, closing its OS file and opening one for the requester.
pub struct HandlePool {
    state: Mutex<PoolState>,
}

impl HandlePool {
    /// Create a pool that keeps up to `capacity` OS files open.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(
                true,
                false,
                PoolState {
                    slots: Vec::new(),
                    first_open: None,
                    last_open: None,
                    first_unused: None,
                    capacity,
                    open_count: 0,
                    used_count: 0,
                    unused_count: 0,
                },
            ),
        }
    }

    /// Configured handle cap.
    pub fn capacity(&self) -> usize {
        self.state.lock().map(|state| state.capacity).unwrap_or(0)
    }

    /// Change the handle cap. Shrinking evicts surplus parked handles
    /// in LRU order; loaned handles are never touched.
    pub fn set_capacity(&self, new_max: usize) {
        if let Ok(mut state) = self.state.lock() {
            state.capacity = new_max;
            while state.open_count > state.capacity && state.used_count < state.open_count {
                let idx = state
                    .last_open
                    .expect("open handles beyond used_count imply a non-empty LRU");
                debug!("HandlePool: capacity shrink evicts handle {}", idx);
                state.close_parked(idx);
            }
        }
    }

    /// Snapshot of the pool counters.
    pub fn stats(&self) -> PoolStats {
        self.state
            .lock()
            .map(|state| PoolStats {
                capacity: state.capacity,
                open_count: state.open_count,
                used_count: state.used_count,
                unused_count: state.unused_count,
            })
            .unwrap_or(PoolStats {
                capacity: 0,
                open_count: 0,
                used_count: 0,
                unused_count: 0,
            })
    }

    /// Loan out a handle for `file`, reusing a parked one when its
    /// name and re-open flags match, opening a fresh one otherwise.
    pub(super) fn acquire(&self, file: &mut FileIdent) -> Result<SharedHandle> {
        let mut state = self.state.lock()?;

        // Quick match through the file's last known slot.
        let mut found = match file.handle_hint {
            Some(idx) if state.parked_matches(idx, file) => Some(idx),
            _ => None,
        };

        // Crawl the parked handles.
        if found.is_none() {
            let mut cursor = state.first_open;
            while let Some(idx) = cursor {
                if state.parked_matches(idx, file) {
                    found = Some(idx);
                    break;
                }
                cursor = state.open_entry(idx).next;
            }
        }

        let handle = match found {
            Some(idx) => {
                let entry = state.take_open(idx);
                state.used_count += 1;
                SharedHandle {
                    idx,
                    file: entry.file,
                    name: entry.name,
                    name_hash: entry.name_hash,
                    reopen_flags: entry.reopen_flags,
                    position: entry.position,
                }
            }
            None => state.allocate(file)?,
        };

        file.handle_hint = Some(handle.idx);
        Ok(handle)
    }

    /// Open a fresh OS handle for `file`, honoring its full open flags.
    ///
    /// Unlike [`HandlePool::acquire`] this never reuses a parked handle,
    /// so creation flags (`CREATE`, `TRUNCATE`, `EXCL`) take effect.
    pub(super) fn allocate(&self, file: &mut FileIdent) -> Result<SharedHandle> {
        let mut state = self.state.lock()?;
        let handle = state.allocate(file)?;
        file.handle_hint = Some(handle.idx);
        Ok(handle)
    }

    /// Return a loaned handle. With `keep_open` the handle is parked at
    /// the head of the open-LRU for quick reuse; otherwise (or when the
    /// pool is over capacity) its OS file is closed.
    pub(super) fn release(&self, handle: SharedHandle, keep_open: bool) -> Result<()> {
        let mut state = self.state.lock()?;
        state.used_count -= 1;

        if !keep_open || state.open_count > state.capacity {
            state.open_count -= 1;
            state.unused_count += 1;
            let next = state.first_unused;
            state.first_unused = Some(handle.idx);
            // Dropping the entry closes the OS file.
            state.slots[handle.idx] = Slot::Unused { next };
        } else {
            let idx = handle.idx;
            state.slots[idx] = Slot::Open(OpenEntry {
                file: handle.file,
                name: handle.name,
                name_hash: handle.name_hash,
                reopen_flags: handle.reopen_flags,
                position: handle.position,
                prev: None,
                next: None,
            });
            state.push_open_front(idx);
        }

        Ok(())
    }

    /// Close the parked handle matching `file`, if any. Handles loaned
    /// to other callers are left alone.
    pub(super) fn forget(&self, file: &FileIdent) -> Result<()> {
        let mut state = self.state.lock()?;

        let mut found = match file.handle_hint {
            Some(idx) if state.parked_matches(idx, file) => Some(idx),
            _ => None,
        };
        if found.is_none() {
            let mut cursor = state.first_open;
            while let Some(idx) = cursor {
                if state.parked_matches(idx, file) {
                    found = Some(idx);
                    break;
                }
                cursor = state.open_entry(idx).next;
            }
        }

        if let Some(idx) = found {
            state.close_parked(idx);
        }
        Ok(())
    }
}

impl PoolState {
    fn open_entry(&self, idx: usize) -> &OpenEntry {
        match &self.slots[idx] {
            Slot::Open(entry) => entry,
            _ => unreachable!("slot {} is not parked in the open list", idx),
        }
    }

    fn open_entry_mut(&mut self, idx: usize) -> &mut OpenEntry {
        match &mut self.slots[idx] {
            Slot::Open(entry) => entry,
            _ => unreachable!("slot {} is not parked in the open list", idx),
        }
    }

    fn parked_matches(&self, idx: usize, file: &FileIdent) -> bool {
        match self.slots.get(idx) {
            Some(Slot::Open(entry)) => {
                entry.name_hash == file.name_hash
                    && entry.reopen_flags == file.reopen_flags
                    && entry.name == file.name
            }
            _ => false,
        }
    }

    fn unlink_open(&mut self, idx: usize) {
        let (prev, next) = {
            let entry = self.open_entry(idx);
            (entry.prev, entry.next)
        };
        match prev {
            Some(p) => self.open_entry_mut(p).next = next,
            None => self.first_open = next,
        }
        match next {
            Some(n) => self.open_entry_mut(n).prev = prev,
            None => self.last_open = prev,
        }
        let entry = self.open_entry_mut(idx);
        entry.prev = None;
        entry.next = None;
    }

    fn push_open_front(&mut self, idx: usize) {
        let old_first = self.first_open;
        {
            let entry = self.open_entry_mut(idx);
            entry.prev = None;
            entry.next = old_first;
        }
        match old_first {
            Some(f) => self.open_entry_mut(f).prev = Some(idx),
            None => self.last_open = Some(idx),
        }
        self.first_open = Some(idx);
    }

    // Unlink a parked handle and hand its entry out, leaving the slot
    // reserved for the loan.
    fn take_open(&mut self, idx: usize) -> OpenEntry {
        self.unlink_open(idx);
        match std::mem::replace(&mut self.slots[idx], Slot::Loaned) {
            Slot::Open(entry) => entry,
            _ => unreachable!("slot {} was just unlinked from the open list", idx),
        }
    }

    // Close a parked handle's OS file and park the slot in the unused
    // list.
    fn close_parked(&mut self, idx: usize) {
        self.unlink_open(idx);
        let next = self.first_unused;
        self.first_unused = Some(idx);
        self.slots[idx] = Slot::Unused { next };
        self.open_count -= 1;
        self.unused_count += 1;
    }

    // Pick a slot for a fresh OS handle according to the pool pressure,
    // open the file, and loan it out.
    fn allocate(&mut self, file: &mut FileIdent) -> Result<SharedHandle> {
        let idx = if self.capacity > self.open_count {
            if self.unused_count == 0 {
                // Room left: grow the slot array.
                self.slots.push(Slot::Loaned);
                self.open_count += 1;
                self.slots.len() - 1
            } else {
                // Room left: recycle a slot that lost its OS file.
                let idx = self
                    .first_unused
                    .expect("unused_count > 0 implies a non-empty unused list");
                let next = match self.slots[idx] {
                    Slot::Unused { next } => next,
                    _ => unreachable!("unused list points at a non-unused slot"),
                };
                self.first_unused = next;
                self.unused_count -= 1;
                self.open_count += 1;
                self.slots[idx] = Slot::Loaned;
                idx
            }
        } else if self.used_count == self.open_count {
            // At capacity with nothing to evict: exceed the cap rather
            // than fail the caller.
            self.slots.push(Slot::Loaned);
            self.open_count += 1;
            self.slots.len() - 1
        } else {
            // At capacity: reclaim the least recently used parked
            // handle and reuse its slot.
            let idx = self
                .last_open
                .expect("evictable handles imply a non-empty open list");
            debug!("HandlePool: reclaiming handle {} for {:?}", idx, file.name);
            self.unlink_open(idx);
            // Dropping the entry closes the old OS file.
            self.slots[idx] = Slot::Loaned;
            idx
        };

        let os_file = open_os_file(&file.name, file.reopen_flags)
            .map_err(|e| TaskTreeError::io(&file.name, e))?;

        // Creation flags are single-shot; future re-opens of this file
        // keep the access mode, append included.
        file.reopen_flags &= OpenFlags::READ | OpenFlags::WRITE | OpenFlags::APPEND;

        self.used_count += 1;

        Ok(SharedHandle {
            idx,
            file: os_file,
            name: file.name.clone(),
            name_hash: file.name_hash,
            reopen_flags: file.reopen_flags,
            position: 0,
        })
    }
}

fn open_os_file(name: &Path, flags: OpenFlags) -> std::io::Result<std::fs::File> {
    let mut options = OpenOptions::new();
    options.read(flags.contains(OpenFlags::READ));
    // Append mode is emulated by the cached file, which positions every
    // write at the logical end itself. OS-level append would ignore the
    // seeks that buffer flushes rely on and relocate them to EOF.
    options.write(flags.intersects(OpenFlags::WRITE | OpenFlags::APPEND));
    if flags.contains(OpenFlags::TRUNCATE) {
        options.truncate(true);
    }
    if flags.contains(OpenFlags::EXCL) {
        options.create_new(true);
    } else if flags.contains(OpenFlags::CREATE) {
        options.create(true);
    }
    options.open(name)
}
