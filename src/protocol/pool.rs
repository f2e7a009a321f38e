//! The receive buffer pool.
//!
//! Each socket owns a pool: one contiguous region, registered by the user and
//! carved into fixed-size bpages ([`BPAGE_SIZE`]). Inbound message data is
//! copied into bpages exactly once, and the user consumes it from the region
//! directly; there is no second copy on the receive path.
//!
//! Ownership of a bpage moves in a strict cycle: free list -> the one
//! incomplete `Msgin` assembling into it -> the user (after delivery) ->
//! free list again (explicit release). At no point do two owners hold the
//! same bpage, which is what makes the unsynchronized region access below
//! sound.

use std::cell::UnsafeCell;
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::error::HomaError;
use crate::protocol::BPAGE_SIZE;

struct RegionBytes(UnsafeCell<Box<[u8]>>);

// SAFETY: all access to the region goes through `PoolRegion::write` and
// `PoolRegion::bpage`, whose callers hold exclusive ownership of the bpage
// index involved (see the module comment). Disjoint bpages never alias.
unsafe impl Sync for RegionBytes {}
unsafe impl Send for RegionBytes {}

/// A registered receive region: the backing bytes plus the bpage free list.
pub struct PoolRegion {
    bytes: RegionBytes,
    free: Mutex<Vec<u32>>,
    num_bpages: u32,
}

impl PoolRegion {
    fn new(len: usize) -> Self {
        let num_bpages = (len / BPAGE_SIZE) as u32;
        // Hand out low indices first so tests and users see stable layouts.
        let free: Vec<u32> = (0..num_bpages).rev().collect();
        Self {
            bytes: RegionBytes(UnsafeCell::new(vec![0u8; len].into_boxed_slice())),
            free: Mutex::new(free),
            num_bpages,
        }
    }

    /// Total bpages in the region.
    pub fn num_bpages(&self) -> u32 {
        self.num_bpages
    }

    /// Bpages currently on the free list.
    pub fn free_count(&self) -> usize {
        self.free.lock().expect("poisoned pool free list").len()
    }

    /// Bpages currently owned by a message or the user.
    pub fn in_use(&self) -> usize {
        self.num_bpages as usize - self.free_count()
    }

    /// Allocates `count` bpages, all or nothing. Returns `None` when the
    /// free list is too short; the caller drops the packet and relies on
    /// retransmission once pages are released.
    pub fn alloc(&self, count: usize) -> Option<Vec<u32>> {
        let mut free = self.free.lock().expect("poisoned pool free list");
        if free.len() < count {
            return None;
        }
        let at = free.len() - count;
        Some(free.split_off(at))
    }

    /// Returns bpages to the free list.
    pub fn release(&self, bpages: &[u32]) {
        let mut free = self.free.lock().expect("poisoned pool free list");
        for &idx in bpages {
            debug_assert!(idx < self.num_bpages, "bpage index out of range");
            debug_assert!(!free.contains(&idx), "double release of bpage {idx}");
            free.push(idx);
        }
    }

    /// Copies `data` into bpage `idx` at `offset`.
    ///
    /// The caller must own `idx` (it is on no free list and in no other
    /// message's bpage list) and the write must fit inside the bpage.
    pub(crate) fn write(&self, idx: u32, offset: usize, data: &[u8]) {
        assert!(idx < self.num_bpages, "bpage index out of range");
        assert!(offset + data.len() <= BPAGE_SIZE, "write past end of bpage");
        let start = idx as usize * BPAGE_SIZE + offset;
        // SAFETY: the caller owns bpage `idx` exclusively, the range is
        // bounds-checked above, and no reader exists until ownership of the
        // bpage is handed on.
        unsafe {
            let base = (*self.bytes.0.get()).as_mut_ptr();
            std::ptr::copy_nonoverlapping(data.as_ptr(), base.add(start), data.len());
        }
    }

    /// Returns the contents of bpage `idx`.
    ///
    /// Callers must own the bpage (normally: the user, after a message
    /// carrying it was delivered and before releasing it).
    pub fn bpage(&self, idx: u32) -> &[u8] {
        assert!(idx < self.num_bpages, "bpage index out of range");
        let start = idx as usize * BPAGE_SIZE;
        // SAFETY: bounds checked above; the owner of the bpage is the only
        // party reading or writing it, so the slice cannot be written to
        // while borrowed.
        unsafe {
            let base = (*self.bytes.0.get()).as_ptr();
            std::slice::from_raw_parts(base.add(start), BPAGE_SIZE)
        }
    }
}

/// A socket's buffer pool: an optional registered [`PoolRegion`].
///
/// Until the user registers a region, inbound DATA packets are dropped (the
/// sender retransmits after registration).
pub struct BufferPool {
    region: Mutex<Option<Arc<PoolRegion>>>,
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferPool {
    pub fn new() -> Self {
        Self { region: Mutex::new(None) }
    }

    /// Registers the receive region. `len` must be a positive multiple of
    /// [`BPAGE_SIZE`]; anything else is rejected before any state changes.
    /// Replacing a region while any of its bpages are still out is refused.
    pub fn set_region(&self, len: usize) -> Result<(), HomaError> {
        if len == 0 || len % BPAGE_SIZE != 0 {
            return Err(HomaError::BadRegion);
        }
        let mut region = self.region.lock().expect("poisoned pool region");
        if let Some(old) = region.as_ref() {
            if old.in_use() > 0 {
                warn!("refusing to replace buffer region with {} bpages in use", old.in_use());
                return Err(HomaError::BadRegion);
            }
        }
        *region = Some(Arc::new(PoolRegion::new(len)));
        Ok(())
    }

    /// The current region, if one is registered.
    pub fn region(&self) -> Option<Arc<PoolRegion>> {
        self.region.lock().expect("poisoned pool region").clone()
    }
}
