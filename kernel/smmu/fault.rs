//! Fault decode and diagnostics.
//!
//! # Flow
//!
//! ```text
//! fault irq
//!     |
//!     v
//! decode(normal bank) --(address in secure window)--> decode(secure bank)
//!     |
//!     v
//! report_device_fault() -> Retry | Handled
//!     |
//!     +-- async mode --> clear, queue --> worker: diagnose [-> abort]
//!     |
//!     +-- sync mode ---> Handled: clear
//!                        Retry:   diagnose [-> abort] then clear
//! ```
//!
//! Diagnostics walk the software table at the faulting address and sweep
//! every hardware translation cache, reporting any line whose translation
//! disagrees with the table. The normal and secure paths are the same code
//! over a different [`RegisterAccess`].
//!
//! An unrecoverable fault that no listener claims is fatal: the full
//! register and TLB dump goes out through `klog_force!` and the handler
//! panics.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use crate::instance::SmmuInstance;
use crate::pgtable::Walk;
use crate::regs::{self, RegisterAccess};
use crate::tlb_dump::TlbSnapshot;
use crate::{DeviceId, IommuError, IommuResult};

// ============================================================================
// Types
// ============================================================================

/// Hardware fault type, in priority order (lowest status bit wins).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FaultKind {
    /// Table walk hit a bus error.
    PtwAccessFault = 0,
    /// No valid translation.
    PageFault = 1,
    /// Translation exists but forbids the access.
    AccessFault = 2,
    /// VM context misconfigured or disabled.
    ContextFault = 3,
    UnknownFault = 4,
}

impl FaultKind {
    /// Decode the type bits of `FAULT_STATUS`; `None` if no bit is set.
    pub fn from_status(status: u32) -> Option<Self> {
        let bits = status & regs::FAULT_TYPE_MASK;
        if bits == 0 {
            return None;
        }
        Some(match bits.trailing_zeros() {
            0 => Self::PtwAccessFault,
            1 => Self::PageFault,
            2 => Self::AccessFault,
            3 => Self::ContextFault,
            _ => Self::UnknownFault,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PtwAccessFault => "page table walk access fault",
            Self::PageFault => "page fault",
            Self::AccessFault => "access fault",
            Self::ContextFault => "context fault",
            Self::UnknownFault => "unknown fault",
        }
    }

    /// Whether translation can continue after the fault is cleared.
    pub fn is_recoverable(self) -> bool {
        matches!(self, Self::PageFault | Self::AccessFault)
    }

    /// Whether the software table is worth walking. A context fault means
    /// the context itself cannot be trusted.
    pub fn walks_table(self) -> bool {
        !matches!(self, Self::ContextFault | Self::UnknownFault)
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultRecord {
    pub address: u64,
    pub is_write: bool,
    pub kind: FaultKind,
    pub vm: u32,
    pub port: u32,
    pub stream: u32,
    /// Decoded from the secure bank.
    pub secure: bool,
}

/// Listener verdict on a reported fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultResponse {
    /// Not claimed; the driver carries on with diagnostics and policy.
    Retry,
    /// The listener recovered the device.
    Handled,
}

/// Upstream consumer of device faults (the IOMMU core or a device driver).
pub trait FaultListener: Send + Sync {
    /// `device` is the device behind the faulting port, if known.
    fn report_device_fault(&self, device: Option<DeviceId>, fault: &FaultRecord) -> FaultResponse;
}

/// Per-port fault callback.
pub type PortFaultCallback = Arc<dyn Fn(&FaultRecord) + Send + Sync>;

/// Resolves a recorded table base back to the software table.
pub trait SoftwareWalker {
    /// Walk the table rooted at `pgt_base`.
    ///
    /// Fails with [`IommuError::UnreachableFaultAddress`] if no live domain
    /// owns that base.
    fn walk(&self, pgt_base: u64, iova: u64) -> IommuResult<Walk>;
}

/// A fault waiting for the deferred worker.
#[derive(Debug, Clone, Copy)]
pub struct PendingFault {
    pub record: FaultRecord,
    pub response: FaultResponse,
}

/// Outcome of diagnostics.
#[derive(Debug, Clone, Default)]
pub struct Diagnosis {
    /// Table base the instance had recorded.
    pub pgt_base: Option<u64>,
    /// Software walk; `None` when skipped for this fault kind.
    pub walk: Option<IommuResult<Walk>>,
    /// Hardware cache lines that translate the faulting address.
    pub tlb_hits: Vec<TlbSnapshot>,
    /// Lines disagreeing with the software table.
    pub mismatches: usize,
    /// Whether the caches could be read (instance powered).
    pub tlb_swept: bool,
}

/// Everything the handler learned about one fault.
#[derive(Debug, Clone)]
pub struct FaultReport {
    pub instance: crate::InstanceId,
    pub record: FaultRecord,
    pub response: FaultResponse,
    /// Diagnostics still to run on the worker.
    pub deferred: bool,
    /// `None` when skipped (claimed in sync mode, or deferred).
    pub diagnosis: Option<Diagnosis>,
}

// ============================================================================
// Decode
// ============================================================================

/// Decode the pending fault from `source`, if any.
pub fn decode(source: &dyn RegisterAccess) -> Option<FaultRecord> {
    let status = source.read(regs::FAULT_STATUS);
    let kind = FaultKind::from_status(status)?;
    let vm = (status >> regs::FAULT_VM_SHIFT) & regs::FAULT_VM_MASK;

    let addr_lo = source.read(regs::FAULT_ADDR);
    let info = source.read(regs::FAULT_INFO);

    let mut address = u64::from(addr_lo);
    if info & regs::FAULT_INFO_ADDR36 != 0 {
        let hi = (info >> regs::FAULT_INFO_ADDR_HI_SHIFT) & regs::FAULT_INFO_ADDR_HI_MASK;
        address |= u64::from(hi) << 32;
    }

    Some(FaultRecord {
        address,
        is_write: info & regs::FAULT_INFO_WRITE != 0,
        kind,
        vm,
        port: (info >> regs::FAULT_INFO_PORT_SHIFT) & regs::FAULT_INFO_PORT_MASK,
        stream: info >> regs::FAULT_INFO_STREAM_SHIFT,
        secure: false,
    })
}

impl SmmuInstance {
    /// Decode the pending fault under the instance lock.
    ///
    /// A fault landing in the secure window is re-read from the secure bank
    /// when one is installed.
    pub fn decode_fault(&self) -> Option<FaultRecord> {
        self.with_state(|_| -> Option<FaultRecord> {
            let record = decode(self.regs())?;
            if !self.config().is_secure_iova(record.address) {
                return Some(record);
            }
            match self.secure_regs().and_then(decode) {
                Some(secure) => Some(FaultRecord { secure: true, ..secure }),
                None => Some(record),
            }
        })
    }

    /// Acknowledge `record` on the bank it was decoded from.
    pub fn clear_fault(&self, record: &FaultRecord) {
        self.with_state(|_| {
            self.fault_source(record)
                .write(regs::FAULT_CLEAR, regs::FAULT_CLEAR_ALL)
        });
    }

    fn fault_source(&self, record: &FaultRecord) -> &dyn RegisterAccess {
        match (record.secure, self.secure_regs()) {
            (true, Some(secure)) => secure,
            _ => self.regs(),
        }
    }
}

// ============================================================================
// Diagnostics
// ============================================================================

/// Walk the software table and cross-check every hardware cache line that
/// translates the faulting address. With `dump_all` every valid line is
/// printed, not just the hits.
pub fn diagnose(
    instance: &SmmuInstance,
    record: &FaultRecord,
    walker: &dyn SoftwareWalker,
    dump_all: bool,
) -> Diagnosis {
    let name = instance.name();
    let pgt_base = instance.pgt_base();

    let walk = record.kind.walks_table().then(|| match pgt_base {
        Some(base) => walker.walk(base, record.address),
        None => Err(IommuError::UnreachableFaultAddress),
    });

    match &walk {
        Some(Ok(w)) => klog_force!(
            "[SMMU:{}] sw walk {:#x}: l1={:?} l2={:?} leaf={:?}",
            name,
            record.address,
            w.l1,
            w.l2,
            w.leaf()
        ),
        Some(Err(e)) => klog_force!("[SMMU:{}] sw walk {:#x} skipped: {}", name, record.address, e),
        None => klog_force!("[SMMU:{}] sw walk skipped for {}", name, record.kind),
    }

    let expected = match &walk {
        Some(Ok(w)) => Some(w.leaf()),
        _ => None,
    };

    let mut tlb_hits = Vec::new();
    let mut mismatches = 0;
    let source = instance.fault_source(record);
    let tlb_swept = instance.dump_tlb(source, |line| {
        if dump_all {
            klog_force!("[SMMU:{}] tlb {}", name, line);
        }
        if !line.covers(record.address) {
            return;
        }
        let hw = line.translate(record.address);
        let consistent = match expected {
            // Walk skipped or unusable: nothing to compare against.
            None => true,
            Some(None) => false,
            Some(Some((base, size))) => base | (record.address & size.offset_mask()) == hw,
        };
        if !consistent {
            mismatches += 1;
            klog_force!(
                "[SMMU:{}] hw/sw mismatch at {:#x}: {} vs sw {:?}",
                name,
                record.address,
                line,
                expected.flatten()
            );
        }
        tlb_hits.push(line);
    });

    if !tlb_swept {
        klog!(Warn, "[SMMU:{}] powered off, tlb not dumped", name);
    }

    Diagnosis {
        pgt_base,
        walk,
        tlb_hits,
        mismatches,
        tlb_swept,
    }
}

/// Log the decoded fault.
pub fn log_fault(instance: &SmmuInstance, record: &FaultRecord) {
    klog!(
        Error,
        "[SMMU:{}] {} at {:#x} {} vm={} port={} stream={:#x}{}",
        instance.name(),
        record.kind,
        record.address,
        if record.is_write { "[W]" } else { "[R]" },
        record.vm,
        record.port,
        record.stream,
        if record.secure { " [SECURE]" } else { "" }
    );
}

/// Dump the raw fault registers and abort. Never returns.
pub fn abort_unrecoverable(instance: &SmmuInstance, record: &FaultRecord) -> ! {
    let source = instance.fault_source(record);
    klog_force!(
        "[SMMU:{}] status={:#010x} addr={:#010x} info={:#010x} ctrl={:#010x}",
        instance.name(),
        source.read(regs::FAULT_STATUS),
        source.read(regs::FAULT_ADDR),
        source.read(regs::FAULT_INFO),
        source.read(regs::CTRL)
    );
    panic!(
        "[SMMU:{}] unrecoverable {} at {:#x} (port {})",
        instance.name(),
        record.kind,
        record.address,
        record.port
    );
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheGeometry, SmmuConfig, TlbGeometry};
    use crate::entry::{EntryAttrs, TranslationEntry};
    use crate::testing::MockRegisters;

    fn status(kind_bits: u32, vm: u32) -> u32 {
        kind_bits | (vm << regs::FAULT_VM_SHIFT)
    }

    #[test]
    fn test_lowest_bit_wins() {
        assert_eq!(FaultKind::from_status(0b00110), Some(FaultKind::PageFault));
        assert_eq!(FaultKind::from_status(0b11000), Some(FaultKind::ContextFault));
        assert_eq!(FaultKind::from_status(0b00001), Some(FaultKind::PtwAccessFault));
        assert_eq!(FaultKind::from_status(0x100), None);
        assert_eq!(FaultKind::UnknownFault.as_str(), "unknown fault");
    }

    #[test]
    fn test_decode_extended_address() {
        let regs = MockRegisters::new();
        regs.raise_fault(
            status(0b10, 3),
            0x1234_5000,
            regs::FAULT_INFO_WRITE
                | regs::FAULT_INFO_ADDR36
                | (0xa << regs::FAULT_INFO_ADDR_HI_SHIFT)
                | (5 << regs::FAULT_INFO_PORT_SHIFT)
                | (0x42 << regs::FAULT_INFO_STREAM_SHIFT),
        );
        let record = decode(&regs).unwrap();
        assert_eq!(record.address, 0xa_1234_5000);
        assert!(record.is_write);
        assert_eq!(record.kind, FaultKind::PageFault);
        assert_eq!((record.vm, record.port, record.stream), (3, 5, 0x42));
    }

    #[test]
    fn test_high_bits_ignored_without_flag() {
        let regs = MockRegisters::new();
        regs.raise_fault(status(0b100, 0), 0x2000, 0xf << regs::FAULT_INFO_ADDR_HI_SHIFT);
        let record = decode(&regs).unwrap();
        assert_eq!(record.address, 0x2000);
        assert!(!record.is_write);
        assert_eq!(record.kind, FaultKind::AccessFault);
    }

    #[test]
    fn test_no_fault_pending() {
        assert_eq!(decode(&MockRegisters::new()), None);
    }

    #[test]
    fn test_secure_window_uses_secure_bank() {
        let normal = Arc::new(MockRegisters::new());
        let secure = Arc::new(MockRegisters::new());
        normal.raise_fault(status(0b10, 0), 0x9000_0000, 0);
        secure.raise_fault(status(0b100, 1), 0x9000_4000, regs::FAULT_INFO_WRITE);

        let config = SmmuConfig {
            vm_count: 2,
            vmid_mask: 0b11,
            secure_iova: Some(0x9000_0000..0xa000_0000),
            ..Default::default()
        };
        let inst = SmmuInstance::new(0, config, normal.clone(), Some(secure.clone())).unwrap();
        let record = inst.decode_fault().unwrap();
        assert!(record.secure);
        assert_eq!(record.address, 0x9000_4000);
        assert_eq!(record.kind, FaultKind::AccessFault);

        inst.clear_fault(&record);
        assert_eq!(secure.writes_to(regs::FAULT_CLEAR), [regs::FAULT_CLEAR_ALL]);
        assert!(normal.writes_to(regs::FAULT_CLEAR).is_empty());
    }

    #[test]
    fn test_outside_secure_window_stays_normal() {
        let normal = Arc::new(MockRegisters::new());
        let secure = Arc::new(MockRegisters::new());
        normal.raise_fault(status(0b10, 0), 0x1000, 0);
        let config = SmmuConfig {
            secure_iova: Some(0x9000_0000..0xa000_0000),
            ..Default::default()
        };
        let inst = SmmuInstance::new(0, config, normal, Some(secure)).unwrap();
        let record = inst.decode_fault().unwrap();
        assert!(!record.secure);
        assert_eq!(record.address, 0x1000);
    }

    struct FixedWalker(Walk);

    impl SoftwareWalker for FixedWalker {
        fn walk(&self, _pgt_base: u64, _iova: u64) -> IommuResult<Walk> {
            Ok(self.0)
        }
    }

    fn small_tlb() -> TlbGeometry {
        let g = CacheGeometry { ways: 1, sets: 2, sublines: 1 };
        TlbGeometry { port: g, shared: g, top: g }
    }

    #[test]
    fn test_diagnose_flags_stale_line() {
        let regs = Arc::new(MockRegisters::new());
        let config = SmmuConfig {
            tlb: small_tlb(),
            ..Default::default()
        };
        let inst = SmmuInstance::new(0, config, regs.clone(), None).unwrap();
        inst.attach(0x4000_0000).unwrap();

        // Hardware holds 0x10000000 -> 0x80000000; software says 0x90000000.
        regs.load_tlb(
            regs::dump_select(0x00, 0, 1, 0),
            regs::DUMP_TAG_VALID | 0x1_0000,
            0x8_0000,
        );
        let walk = Walk {
            l1: TranslationEntry::table(0x4010_0000),
            l2: Some(TranslationEntry::small(0x9000_0000, EntryAttrs::empty())),
        };
        let record = FaultRecord {
            address: 0x1000_0010,
            is_write: false,
            kind: FaultKind::PageFault,
            vm: 0,
            port: 0,
            stream: 0,
            secure: false,
        };
        let diag = diagnose(&inst, &record, &FixedWalker(walk), false);
        assert_eq!(diag.pgt_base, Some(0x4000_0000));
        assert_eq!(diag.walk, Some(Ok(walk)));
        assert_eq!(diag.tlb_hits.len(), 1);
        assert_eq!(diag.mismatches, 1);
    }

    #[test]
    fn test_diagnose_skips_walk_for_context_fault() {
        let regs = Arc::new(MockRegisters::new());
        let inst = SmmuInstance::new(0, SmmuConfig::default(), regs, None).unwrap();
        let record = FaultRecord {
            address: 0x1000,
            is_write: false,
            kind: FaultKind::ContextFault,
            vm: 0,
            port: 0,
            stream: 0,
            secure: false,
        };
        let diag = diagnose(&inst, &record, &FixedWalker(Walk { l1: TranslationEntry::EMPTY, l2: None }), true);
        assert_eq!(diag.walk, None);
        assert_eq!(diag.mismatches, 0);
        assert!(diag.tlb_swept);
    }

    #[test]
    fn test_diagnose_without_recorded_base() {
        let regs = Arc::new(MockRegisters::new());
        let inst = SmmuInstance::new(0, SmmuConfig::default(), regs, None).unwrap();
        let record = FaultRecord {
            address: 0x1000,
            is_write: true,
            kind: FaultKind::PageFault,
            vm: 0,
            port: 0,
            stream: 0,
            secure: false,
        };
        let diag = diagnose(&inst, &record, &FixedWalker(Walk { l1: TranslationEntry::EMPTY, l2: None }), false);
        assert_eq!(diag.walk, Some(Err(IommuError::UnreachableFaultAddress)));
    }

    #[test]
    #[should_panic(expected = "unrecoverable")]
    fn test_abort_panics() {
        let regs = Arc::new(MockRegisters::new());
        let inst = SmmuInstance::new(0, SmmuConfig::default(), regs, None).unwrap();
        let record = FaultRecord {
            address: 0x1000,
            is_write: false,
            kind: FaultKind::PtwAccessFault,
            vm: 0,
            port: 0,
            stream: 0,
            secure: false,
        };
        abort_unrecoverable(&inst, &record);
    }
}
