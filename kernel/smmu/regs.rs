//! Register map and register access capabilities.
//!
//! # Layout
//!
//! ```text
//! 0x000  CTRL                global enable / fault irq enable
//! 0x010  FAULT_STATUS        [4:0] fault type bits, [11:8] VM id
//! 0x014  FAULT_ADDR          faulting IOVA [31:0]
//! 0x018  FAULT_INFO          direction, 36-bit flag, IOVA [35:32], port, stream
//! 0x01C  FAULT_CLEAR         write 1 to clear
//! 0x020  DEFAULT_STREAM_CFG
//! 0x040  PORT_SEL            per-port selector window (perf counters)
//! 0x044  PERF_CTRL
//! 0x048  PERF_HIT
//! 0x04C  PERF_MISS
//! 0x050  DUMP_SEL            TLB dump selector (write), latches TAG/DATA
//! 0x054  DUMP_TAG
//! 0x058  DUMP_DATA
//! 0x100  VM[n] block, 0x40 apart
//! 0x400  stream route table, 0x10 per entry
//! ```
//!
//! Hardware is only ever touched through [`RegisterAccess`], so the same
//! sequences run against MMIO, the secure call gate, or a test mock.

use alloc::sync::Arc;
use core::ptr::{read_volatile, write_volatile};

// ============================================================================
// Global Registers
// ============================================================================

/// Global control (32-bit, R/W).
pub const CTRL: usize = 0x000;
pub const CTRL_ENABLE: u32 = 1 << 0;
pub const CTRL_FAULT_IRQ: u32 = 1 << 1;

/// Fault status (32-bit, RO).
pub const FAULT_STATUS: usize = 0x010;
pub const FAULT_TYPE_MASK: u32 = 0x1f;
pub const FAULT_VM_SHIFT: u32 = 8;
pub const FAULT_VM_MASK: u32 = 0xf;

/// Faulting IOVA, low 32 bits (32-bit, RO).
pub const FAULT_ADDR: usize = 0x014;

/// Fault transaction info (32-bit, RO).
pub const FAULT_INFO: usize = 0x018;
pub const FAULT_INFO_WRITE: u32 = 1 << 0;
pub const FAULT_INFO_ADDR36: u32 = 1 << 1;
pub const FAULT_INFO_ADDR_HI_SHIFT: u32 = 4;
pub const FAULT_INFO_ADDR_HI_MASK: u32 = 0xf;
pub const FAULT_INFO_PORT_SHIFT: u32 = 8;
pub const FAULT_INFO_PORT_MASK: u32 = 0xff;
pub const FAULT_INFO_STREAM_SHIFT: u32 = 16;

/// Fault clear (32-bit, W1C).
pub const FAULT_CLEAR: usize = 0x01C;
pub const FAULT_CLEAR_ALL: u32 = 1;

/// Stream config applied to unmatched requesters.
pub const DEFAULT_STREAM_CFG: usize = 0x020;

// ============================================================================
// Selector Windows
// ============================================================================

/// Port selector shared by the perf counters.
pub const PORT_SEL: usize = 0x040;
pub const PERF_CTRL: usize = 0x044;
pub const PERF_START: u32 = 1 << 0;
pub const PERF_RESET: u32 = 1 << 1;
pub const PERF_HIT: usize = 0x048;
pub const PERF_MISS: usize = 0x04C;

/// TLB dump selector: `structure << 24 | way << 16 | set << 4 | subline`.
pub const DUMP_SEL: usize = 0x050;
pub const DUMP_TAG: usize = 0x054;
pub const DUMP_DATA: usize = 0x058;

pub const DUMP_TAG_VALID: u32 = 1 << 31;
pub const DUMP_VPN_MASK: u32 = 0x00ff_ffff;
pub const DUMP_DATA_SIZE_SHIFT: u32 = 24;
pub const DUMP_DATA_SIZE_MASK: u32 = 0x3;

/// Compose a dump selector word.
#[inline]
pub const fn dump_select(structure: u8, way: u32, set: u32, subline: u32) -> u32 {
    ((structure as u32) << 24) | ((way & 0xff) << 16) | ((set & 0xfff) << 4) | (subline & 0xf)
}

// ============================================================================
// Per-VM Context Registers
// ============================================================================

const VM_BLOCK_BASE: usize = 0x100;
const VM_BLOCK_STRIDE: usize = 0x40;

/// Context control.
pub const VM_CTRL: usize = 0x00;
pub const VM_CTRL_ENABLE: u32 = 1 << 0;
pub const VM_CTRL_CACHEABLE: u32 = 1 << 1;
pub const VM_CTRL_QOS_EN: u32 = 1 << 2;
pub const VM_CTRL_QOS_SHIFT: u32 = 4;

/// Translation table base [31:0] and [35:32].
pub const VM_PT_BASE: usize = 0x04;
pub const VM_PT_BASE_HI: usize = 0x08;

/// Context attributes (fault irq routing, async mode).
pub const VM_ATTR: usize = 0x0C;
pub const VM_ATTR_FAULT_IRQ: u32 = 1 << 0;
pub const VM_ATTR_ASYNC_FAULT: u32 = 1 << 1;

/// Range invalidation: inclusive start/end VPN then trigger.
pub const VM_INV_START: usize = 0x10;
pub const VM_INV_END: usize = 0x14;
pub const VM_INV_TRIGGER: usize = 0x18;
pub const INV_TRIGGER_ALL: u32 = 1 << 0;
pub const INV_TRIGGER_RANGE: u32 = 1 << 1;

/// Offset of register `offset` inside VM context `vm`.
#[inline]
pub const fn vm_reg(vm: u32, offset: usize) -> usize {
    VM_BLOCK_BASE + vm as usize * VM_BLOCK_STRIDE + offset
}

// ============================================================================
// Stream Route Table
// ============================================================================

const STREAM_BASE: usize = 0x400;
const STREAM_STRIDE: usize = 0x10;

pub const STREAM_CFG: usize = 0x0;
pub const STREAM_MATCH_CFG: usize = 0x4;
pub const STREAM_MATCH_VALUE: usize = 0x8;
pub const STREAM_MATCH_MASK: usize = 0xC;

/// Offset of register `offset` inside stream route entry `index`.
#[inline]
pub const fn stream_reg(index: u8, offset: usize) -> usize {
    STREAM_BASE + index as usize * STREAM_STRIDE + offset
}

// ============================================================================
// Access Capabilities
// ============================================================================

/// Word access to one register block.
pub trait RegisterAccess: Send + Sync {
    fn read(&self, offset: usize) -> u32;
    fn write(&self, offset: usize, value: u32);

    /// Read-modify-write.
    fn modify(&self, offset: usize, clear: u32, set: u32) {
        let value = self.read(offset);
        self.write(offset, (value & !clear) | set);
    }
}

/// Memory-mapped register block.
pub struct MmioRegisters {
    base: usize,
}

impl MmioRegisters {
    /// # Safety
    ///
    /// `base` must be the virtual address of a mapped, device-memory
    /// register block large enough for every offset in this module, and it
    /// must stay mapped for the lifetime of the returned value.
    pub const unsafe fn new(base: usize) -> Self {
        Self { base }
    }
}

impl RegisterAccess for MmioRegisters {
    #[inline]
    fn read(&self, offset: usize) -> u32 {
        // SAFETY: `new` guarantees the block is mapped and covers `offset`.
        unsafe { read_volatile((self.base + offset) as *const u32) }
    }

    #[inline]
    fn write(&self, offset: usize, value: u32) {
        // SAFETY: as for `read`.
        unsafe { write_volatile((self.base + offset) as *mut u32, value) }
    }
}

/// Privileged call gate into the secure world.
pub trait SecureGate: Send + Sync {
    /// Read a word of the secure register bank.
    fn call_read(&self, offset: usize) -> u32;
    /// Write a word of the secure register bank.
    fn call_write(&self, offset: usize, value: u32);
}

/// Secure register bank reached through a [`SecureGate`].
///
/// Exposes the same offsets as the normal bank so that decode logic can be
/// shared between the two.
pub struct SecureRegisters {
    gate: Arc<dyn SecureGate>,
}

impl SecureRegisters {
    pub fn new(gate: Arc<dyn SecureGate>) -> Self {
        Self { gate }
    }
}

impl RegisterAccess for SecureRegisters {
    fn read(&self, offset: usize) -> u32 {
        self.gate.call_read(offset)
    }

    fn write(&self, offset: usize, value: u32) {
        self.gate.call_write(offset, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockRegisters;
    use spin::Mutex;
    use std::vec::Vec;

    #[test]
    fn test_register_blocks_do_not_overlap() {
        assert_eq!(vm_reg(0, VM_CTRL), 0x100);
        assert_eq!(vm_reg(7, VM_INV_TRIGGER), 0x100 + 7 * 0x40 + 0x18);
        assert!(vm_reg(7, VM_INV_TRIGGER) < stream_reg(0, STREAM_CFG));
        assert_eq!(stream_reg(63, STREAM_MATCH_MASK), 0x400 + 63 * 0x10 + 0xC);
    }

    #[test]
    fn test_dump_select_fields() {
        assert_eq!(dump_select(0x12, 3, 0x45, 7), 0x1203_0457);
    }

    #[test]
    fn test_modify_preserves_other_bits() {
        let regs = MockRegisters::new();
        regs.write(CTRL, 0xf0);
        regs.modify(CTRL, 0x30, CTRL_ENABLE);
        assert_eq!(regs.read(CTRL), 0xc1);
    }

    struct RecordingGate {
        calls: Mutex<Vec<(usize, Option<u32>)>>,
    }

    impl SecureGate for RecordingGate {
        fn call_read(&self, offset: usize) -> u32 {
            self.calls.lock().push((offset, None));
            0x5a
        }

        fn call_write(&self, offset: usize, value: u32) {
            self.calls.lock().push((offset, Some(value)));
        }
    }

    #[test]
    fn test_secure_registers_go_through_gate() {
        let gate = Arc::new(RecordingGate {
            calls: Mutex::new(Vec::new()),
        });
        let secure = SecureRegisters::new(gate.clone());
        assert_eq!(secure.read(FAULT_STATUS), 0x5a);
        secure.write(FAULT_CLEAR, FAULT_CLEAR_ALL);
        assert_eq!(
            gate.calls.lock().as_slice(),
            &[(FAULT_STATUS, None), (FAULT_CLEAR, Some(FAULT_CLEAR_ALL))]
        );
    }
}
