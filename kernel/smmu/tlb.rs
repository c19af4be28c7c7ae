//! IOTLB invalidation.
//!
//! Table updates are never pushed to hardware from inside the domain lock.
//! Unmaps record what they touched in an [`IotlbGather`]; once the caller
//! has dropped the domain lock it hands the gather to
//! [`crate::Smmu::iotlb_sync`], which issues one range invalidation for the
//! whole batch and only then returns reclaimed L2 frames to the pool.
//!
//! Register-level sequences live here as an `impl SmmuInstance` block so
//! that they share the instance lock with attach and power transitions.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::entry::{SMALL_PAGE_SHIFT, SMALL_PAGE_SIZE};
use crate::instance::{InstanceState, SmmuInstance};
use crate::regs::{self, RegisterAccess};

/// Accumulates the IOVA span touched by a batch of unmaps.
#[derive(Debug)]
pub struct IotlbGather {
    start: u64,
    /// Inclusive.
    end: u64,
    /// L2 frames detached from a table, released after the next sync.
    freed: Vec<u64>,
}

impl IotlbGather {
    pub const fn new() -> Self {
        Self {
            start: u64::MAX,
            end: 0,
            freed: Vec::new(),
        }
    }

    /// Extend the pending span to cover `[iova, iova + size)`.
    pub fn add_range(&mut self, iova: u64, size: u64) {
        if size == 0 {
            return;
        }
        let last = iova.saturating_add(size - 1);
        self.start = self.start.min(iova);
        self.end = self.end.max(last);
    }

    /// Queue an L2 frame for release once the span is invalidated.
    pub fn add_freed_table(&mut self, phys: u64) {
        self.freed.push(phys);
    }

    /// True if no range has been added.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    /// Pending span as `(start, inclusive end)`.
    pub fn range(&self) -> Option<(u64, u64)> {
        (!self.is_empty()).then_some((self.start, self.end))
    }

    /// Frames waiting for release.
    pub fn freed_tables(&self) -> &[u64] {
        &self.freed
    }

    /// Reset to empty, handing back the frames that were queued.
    pub(crate) fn take(&mut self) -> (Option<(u64, u64)>, Vec<u64>) {
        let range = self.range();
        self.start = u64::MAX;
        self.end = 0;
        (range, core::mem::take(&mut self.freed))
    }
}

impl Default for IotlbGather {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode a byte range as the inclusive virtual-page pair the range
/// registers expect.
///
/// `start` is aligned down; `end` (inclusive last byte) is aligned up to the
/// next page boundary and then stepped back one page.
pub fn encode_range(start: u64, end: u64) -> (u32, u32) {
    let start_vpn = start >> SMALL_PAGE_SHIFT;
    let end_excl = (end.saturating_add(1)).next_multiple_of(SMALL_PAGE_SIZE);
    let end_vpn = (end_excl - SMALL_PAGE_SIZE) >> SMALL_PAGE_SHIFT;
    (start_vpn as u32, end_vpn.max(start_vpn) as u32)
}

impl SmmuInstance {
    /// Invalidate every translation cached for every active VM context.
    ///
    /// No-op while detached or powered off: the next enable reprograms
    /// and flushes the unit anyway.
    pub fn tlb_invalidate_all(&self) {
        self.with_state(|state| {
            if state.is_live() {
                self.flush_all_locked(state);
            }
        });
    }

    /// Invalidate `[start, end]` (inclusive) on every active VM context.
    pub fn tlb_invalidate_range(&self, start: u64, end: u64) {
        let (start_vpn, end_vpn) = encode_range(start, end);
        self.with_state(|state| {
            if !state.is_live() {
                return;
            }
            let regs = self.regs();
            for vm in self.config().active_vms() {
                regs.write(regs::vm_reg(vm, regs::VM_INV_START), start_vpn);
                regs.write(regs::vm_reg(vm, regs::VM_INV_END), end_vpn);
                regs.write(regs::vm_reg(vm, regs::VM_INV_TRIGGER), regs::INV_TRIGGER_RANGE);
            }
            self.stats().range_flushes.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
        });
    }

    /// Full flush with the state lock already held.
    pub(crate) fn flush_all_locked(&self, _state: &InstanceState) {
        let regs = self.regs();
        for vm in self.config().active_vms() {
            regs.write(regs::vm_reg(vm, regs::VM_INV_TRIGGER), regs::INV_TRIGGER_ALL);
        }
        self.stats().full_flushes.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
    }
}

/// Full invalidation across a set of instances.
pub fn invalidate_all(instances: &[Arc<SmmuInstance>]) {
    for instance in instances {
        instance.tlb_invalidate_all();
    }
}

/// Range invalidation across a set of instances.
pub fn invalidate_range(instances: &[Arc<SmmuInstance>], start: u64, end: u64) {
    for instance in instances {
        instance.tlb_invalidate_range(start, end);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_union() {
        let mut gather = IotlbGather::new();
        assert!(gather.is_empty());
        gather.add_range(0x1000, 0x5000);
        gather.add_range(0x9000, 0x1000);
        assert_eq!(gather.range(), Some((0x1000, 0x9fff)));
        gather.add_range(0x4000, 0);
        assert_eq!(gather.range(), Some((0x1000, 0x9fff)));
    }

    #[test]
    fn test_gather_take_resets() {
        let mut gather = IotlbGather::new();
        gather.add_range(0x10_0000, 0x10_0000);
        gather.add_freed_table(0x4000_0000);
        let (range, freed) = gather.take();
        assert_eq!(range, Some((0x10_0000, 0x1f_ffff)));
        assert_eq!(freed, [0x4000_0000]);
        assert!(gather.is_empty());
        assert!(gather.freed_tables().is_empty());
    }

    #[test]
    fn test_encode_range_inclusive_end() {
        assert_eq!(encode_range(0x1000, 0x9fff), (0x1, 0x9));
        // Unaligned end rounds up to cover the partial page.
        assert_eq!(encode_range(0x1800, 0x2001), (0x1, 0x2));
        assert_eq!(encode_range(0x5000, 0x5000), (0x5, 0x5));
    }
}
