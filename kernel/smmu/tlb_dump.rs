//! Hardware TLB snapshot.
//!
//! Every translation cache is readable one line at a time: write a
//! structure/way/set/sub-line selector to `DUMP_SEL`, then read the latched
//! tag and data words back. [`sweep`] walks every line of every structure
//! over an abstract [`RegisterAccess`], so it runs the same against MMIO,
//! the secure bank and the test mock.

use core::fmt;

use crate::config::{CacheGeometry, TlbGeometry};
use crate::entry::{PageSize, SMALL_PAGE_SHIFT};
use crate::instance::SmmuInstance;
use crate::regs::{self, RegisterAccess};

/// Selector id of the shared cache.
const STRUCT_SHARED: u8 = 0x00;
/// Selector id of the top-level cache.
const STRUCT_TOP: u8 = 0x01;
/// Selector id of port 0's cache; port `n` is `STRUCT_PORT_BASE + n`.
const STRUCT_PORT_BASE: u8 = 0x10;

/// Which translation cache a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlbStructure {
    Port(u32),
    Shared,
    Top,
}

impl TlbStructure {
    /// Selector id written into `DUMP_SEL[31:24]`.
    pub fn selector_id(self) -> u8 {
        match self {
            Self::Shared => STRUCT_SHARED,
            Self::Top => STRUCT_TOP,
            Self::Port(port) => STRUCT_PORT_BASE.wrapping_add(port as u8),
        }
    }
}

impl fmt::Display for TlbStructure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Port(port) => write!(f, "port{}", port),
            Self::Shared => f.write_str("shared"),
            Self::Top => f.write_str("top"),
        }
    }
}

/// One valid cache line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbSnapshot {
    pub structure: TlbStructure,
    pub way: u32,
    pub set: u32,
    pub subline: u32,
    /// IOVA of the cached translation, aligned to its size.
    pub iova: u64,
    /// Physical base the hardware holds.
    pub phys: u64,
    pub size: PageSize,
}

impl TlbSnapshot {
    /// Whether this line translates `iova`.
    pub fn covers(&self, iova: u64) -> bool {
        let mask = !self.size.offset_mask();
        iova & mask == self.iova & mask
    }

    /// Physical address this line yields for `iova`.
    pub fn translate(&self, iova: u64) -> u64 {
        (self.phys & !self.size.offset_mask()) | (iova & self.size.offset_mask())
    }
}

impl fmt::Display for TlbSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} w{} s{} l{}: iova={:#011x} pa={:#011x} {:?}",
            self.structure, self.way, self.set, self.subline, self.iova, self.phys, self.size
        )
    }
}

fn decode_size(data: u32) -> PageSize {
    match (data >> regs::DUMP_DATA_SIZE_SHIFT) & regs::DUMP_DATA_SIZE_MASK {
        1 => PageSize::Large,
        2 => PageSize::Section,
        _ => PageSize::Small,
    }
}

fn sweep_structure(
    source: &dyn RegisterAccess,
    structure: TlbStructure,
    geometry: CacheGeometry,
    visit: &mut dyn FnMut(TlbSnapshot),
) {
    let id = structure.selector_id();
    for way in 0..geometry.ways {
        for set in 0..geometry.sets {
            for subline in 0..geometry.sublines {
                source.write(regs::DUMP_SEL, regs::dump_select(id, way, set, subline));
                let tag = source.read(regs::DUMP_TAG);
                if tag & regs::DUMP_TAG_VALID == 0 {
                    continue;
                }
                let data = source.read(regs::DUMP_DATA);
                visit(TlbSnapshot {
                    structure,
                    way,
                    set,
                    subline,
                    iova: u64::from(tag & regs::DUMP_VPN_MASK) << SMALL_PAGE_SHIFT,
                    phys: u64::from(data & regs::DUMP_VPN_MASK) << SMALL_PAGE_SHIFT,
                    size: decode_size(data),
                });
            }
        }
    }
}

/// Read every line of every translation cache, calling `visit` for each
/// valid one. Per-port caches come first, then the shared and top caches.
pub fn sweep(
    source: &dyn RegisterAccess,
    geometry: &TlbGeometry,
    ports: u32,
    mut visit: impl FnMut(TlbSnapshot),
) {
    for port in 0..ports {
        sweep_structure(source, TlbStructure::Port(port), geometry.port, &mut visit);
    }
    sweep_structure(source, TlbStructure::Shared, geometry.shared, &mut visit);
    sweep_structure(source, TlbStructure::Top, geometry.top, &mut visit);
}

impl SmmuInstance {
    /// Sweep this unit's caches under the instance lock.
    ///
    /// Returns `false` without touching hardware while powered off.
    pub fn dump_tlb(&self, source: &dyn RegisterAccess, visit: impl FnMut(TlbSnapshot)) -> bool {
        self.with_state(|state| {
            if !state.powered {
                return false;
            }
            sweep(source, &self.config().tlb, self.config().port_count, visit);
            true
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockRegisters;
    use std::vec::Vec;

    fn tiny() -> TlbGeometry {
        let one = CacheGeometry { ways: 2, sets: 2, sublines: 2 };
        TlbGeometry { port: one, shared: one, top: CacheGeometry { ways: 1, sets: 1, sublines: 1 } }
    }

    #[test]
    fn test_sweep_visits_every_line() {
        let regs = MockRegisters::new();
        let mut lines = 0;
        sweep(&regs, &tiny(), 2, |_| lines += 1);
        assert_eq!(lines, 0);
        // 2 ports x 8 + shared 8 + top 1 selector writes.
        assert_eq!(regs.writes_to(regs::DUMP_SEL).len(), 25);
    }

    #[test]
    fn test_sweep_decodes_valid_lines() {
        let regs = MockRegisters::new();
        regs.load_tlb(
            regs::dump_select(STRUCT_PORT_BASE + 1, 1, 0, 1),
            regs::DUMP_TAG_VALID | 0x1_0000,
            0x8_0000 | (1 << regs::DUMP_DATA_SIZE_SHIFT),
        );
        regs.load_tlb(
            regs::dump_select(STRUCT_TOP, 0, 0, 0),
            regs::DUMP_TAG_VALID | 0x2_0000,
            0xa_0000 | (2 << regs::DUMP_DATA_SIZE_SHIFT),
        );
        // Invalid tag, ignored.
        regs.load_tlb(regs::dump_select(STRUCT_SHARED, 0, 1, 0), 0x3_0000, 0xb_0000);

        let mut found = Vec::new();
        sweep(&regs, &tiny(), 2, |line| found.push(line));

        assert_eq!(found.len(), 2);
        assert_eq!(found[0].structure, TlbStructure::Port(1));
        assert_eq!((found[0].way, found[0].set, found[0].subline), (1, 0, 1));
        assert_eq!(found[0].iova, 0x1000_0000);
        assert_eq!(found[0].size, PageSize::Large);
        assert_eq!(found[0].translate(0x1000_1234), 0x8000_1234);
        assert_eq!(found[1].structure, TlbStructure::Top);
        assert!(found[1].covers(0x200f_ffff));
        assert!(!found[1].covers(0x2010_0000));
    }
}
