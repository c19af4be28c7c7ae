//! Page-table frame pool.
//!
//! Hands out 4 KiB frames from a fixed physical window reserved for
//! translation tables. The pool is an explicit object created at driver
//! init and shared by every domain; nothing here is global.
//!
//! Frames are identified by their physical address. Domains keep the table
//! contents themselves and use the address as an opaque handle, which is
//! also the value the hardware walker is programmed with.

use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;

use crate::{IommuError, IommuResult};

/// Frame granularity of the pool.
pub const FRAME_SIZE: u64 = 4096;

/// Frames backing one L1 table (65536 x 4 bytes).
pub const L1_FRAMES: usize = 64;

/// Cache maintenance on table memory.
///
/// The walker is not coherent with the CPU caches, so every table write is
/// followed by a clean of the touched bytes before the call returns.
pub trait CacheMaintenance: Send + Sync {
    /// Clean `len` bytes starting at physical address `phys` to the point
    /// of coherency.
    fn clean_range(&self, phys: u64, len: usize);
}

/// Cache maintenance for platforms whose walker snoops CPU caches.
pub struct CoherentWalker;

impl CacheMaintenance for CoherentWalker {
    fn clean_range(&self, _phys: u64, _len: usize) {
        core::sync::atomic::fence(Ordering::SeqCst);
    }
}

/// Bitmap allocator over a physical window of table frames.
pub struct TablePool {
    /// Physical address of frame 0.
    phys_base: u64,

    /// Number of frames in the window.
    capacity: usize,

    /// One bit per frame: 1 = allocated.
    bitmap: Mutex<Vec<u64>>,

    /// Frames currently handed out.
    allocated: AtomicUsize,
}

impl TablePool {
    /// Create a pool over `capacity` frames starting at `phys_base`.
    ///
    /// `phys_base` must be frame aligned and the window must stay below the
    /// 36-bit physical limit an entry can encode.
    pub fn new(phys_base: u64, capacity: usize) -> IommuResult<Self> {
        if phys_base % FRAME_SIZE != 0 || capacity == 0 {
            return Err(IommuError::InvalidConfig);
        }
        let end = phys_base
            .checked_add(capacity as u64 * FRAME_SIZE)
            .ok_or(IommuError::InvalidConfig)?;
        if end > crate::entry::PHYS_LIMIT {
            return Err(IommuError::InvalidConfig);
        }

        Ok(Self {
            phys_base,
            capacity,
            bitmap: Mutex::new(vec![0u64; capacity.div_ceil(64)]),
            allocated: AtomicUsize::new(0),
        })
    }

    /// Total frames in the window.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames currently allocated.
    #[inline]
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Allocate `count` physically contiguous frames, first fit.
    ///
    /// Returns the physical address of the first frame.
    pub fn alloc_frames(&self, count: usize) -> IommuResult<u64> {
        if count == 0 || count > self.capacity {
            return Err(IommuError::OutOfMemory);
        }

        let mut bitmap = self.bitmap.lock();
        let mut run_start = 0usize;
        let mut run_len = 0usize;

        for index in 0..self.capacity {
            if Self::test(&bitmap, index) {
                run_len = 0;
                run_start = index + 1;
                continue;
            }
            run_len += 1;
            if run_len == count {
                for frame in run_start..run_start + count {
                    Self::set(&mut bitmap, frame, true);
                }
                self.allocated.fetch_add(count, Ordering::Relaxed);
                return Ok(self.phys_base + run_start as u64 * FRAME_SIZE);
            }
        }

        Err(IommuError::OutOfMemory)
    }

    /// Return `count` frames starting at `phys` to the pool.
    ///
    /// Frames outside the window or not currently allocated are ignored.
    pub fn free_frames(&self, phys: u64, count: usize) {
        let Some(first) = self.frame_index(phys) else {
            return;
        };

        let mut bitmap = self.bitmap.lock();
        let mut released = 0;
        for frame in first..(first + count).min(self.capacity) {
            if Self::test(&bitmap, frame) {
                Self::set(&mut bitmap, frame, false);
                released += 1;
            }
        }
        self.allocated.fetch_sub(released, Ordering::Relaxed);
    }

    /// Check whether `phys` lies inside an allocated frame.
    pub fn is_allocated(&self, phys: u64) -> bool {
        match self.frame_index(phys) {
            Some(index) => Self::test(&self.bitmap.lock(), index),
            None => false,
        }
    }

    fn frame_index(&self, phys: u64) -> Option<usize> {
        let offset = phys.checked_sub(self.phys_base)?;
        let index = (offset / FRAME_SIZE) as usize;
        (index < self.capacity).then_some(index)
    }

    #[inline]
    fn test(bitmap: &[u64], index: usize) -> bool {
        bitmap[index / 64] & (1u64 << (index % 64)) != 0
    }

    #[inline]
    fn set(bitmap: &mut [u64], index: usize, value: bool) {
        let mask = 1u64 << (index % 64);
        if value {
            bitmap[index / 64] |= mask;
        } else {
            bitmap[index / 64] &= !mask;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_contiguous_first_fit() {
        let pool = TablePool::new(0x4000_0000, 8).unwrap();
        let a = pool.alloc_frames(1).unwrap();
        let b = pool.alloc_frames(3).unwrap();
        assert_eq!(a, 0x4000_0000);
        assert_eq!(b, 0x4000_1000);
        assert_eq!(pool.allocated(), 4);

        pool.free_frames(a, 1);
        // Hole of one frame is too small for two; next fit is after b.
        assert_eq!(pool.alloc_frames(2).unwrap(), 0x4000_4000);
        assert_eq!(pool.alloc_frames(1).unwrap(), 0x4000_0000);
    }

    #[test]
    fn test_exhaustion() {
        let pool = TablePool::new(0x1000, 2).unwrap();
        assert_eq!(pool.alloc_frames(3), Err(IommuError::OutOfMemory));
        pool.alloc_frames(2).unwrap();
        assert_eq!(pool.alloc_frames(1), Err(IommuError::OutOfMemory));
    }

    #[test]
    fn test_double_free_ignored() {
        let pool = TablePool::new(0, 4).unwrap();
        let f = pool.alloc_frames(1).unwrap();
        assert!(pool.is_allocated(f));
        pool.free_frames(f, 1);
        pool.free_frames(f, 1);
        assert_eq!(pool.allocated(), 0);
        assert!(!pool.is_allocated(f));
    }

    #[test]
    fn test_rejects_bad_window() {
        assert!(TablePool::new(0x800, 4).is_err());
        assert!(TablePool::new(0, 0).is_err());
        assert!(TablePool::new(crate::entry::PHYS_LIMIT - FRAME_SIZE, 2).is_err());
    }
}
