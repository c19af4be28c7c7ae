//! Two-level translation table for one domain.
//!
//! # Layout
//!
//! ```text
//!   IOVA [35:20]            IOVA [19:12]            IOVA [11:0]
//!        |                       |                       |
//!        v                       v                       |
//! +--------------+        +--------------+               |
//! | L1 (65536)   |------->| L2 (256)     |--> 4K / 64K   +--> offset
//! | 1 MiB / slot |  ptr   | 4 KiB / slot |    page base
//! +--------------+        +--------------+
//!        |
//!        +--> 1 MiB section base
//! ```
//!
//! L2 tables are allocated on the first page-granularity map under an L1
//! slot and stay in place when their last page is unmapped; they are
//! reclaimed when a section map takes over the slot or when the store is
//! dropped. Each L1 slot carries a count of populated L2 leaves and a slot
//! may only change shape while that count is zero.
//!
//! Tables are kept in memory owned by the store and addressed by the
//! physical frame the pool assigned to them. That address is what the L1
//! pointer entry and the hardware base register carry; [`PageTableStore::table_mut`]
//! is the only way from a handle to a writable view.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use crate::entry::{
    l1_index, l2_index, EntryAttrs, L1Kind, L2Kind, PageSize, Prot, TranslationEntry,
    IOVA_LIMIT, L1_ENTRIES, L2_ENTRIES, LARGE_PAGE_SIZE, LARGE_PAGE_SLOTS, PHYS_LIMIT,
    SECTION_SIZE, SMALL_PAGE_SIZE,
};
use crate::pool::{CacheMaintenance, TablePool, L1_FRAMES};
use crate::tlb::IotlbGather;
use crate::{IommuError, IommuResult};

const ENTRY_BYTES: u64 = core::mem::size_of::<TranslationEntry>() as u64;

/// One L2 table (256 slots, 1 KiB of a 4 KiB frame).
#[repr(C, align(1024))]
pub struct L2Table {
    entries: [TranslationEntry; L2_ENTRIES],
}

impl L2Table {
    const fn new() -> Self {
        Self {
            entries: [TranslationEntry::EMPTY; L2_ENTRIES],
        }
    }

    #[inline]
    pub fn entry(&self, index: usize) -> TranslationEntry {
        self.entries[index]
    }
}

/// Result of walking the table at one IOVA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Walk {
    /// Raw L1 slot.
    pub l1: TranslationEntry,
    /// Raw L2 slot, when the L1 slot is a table pointer.
    pub l2: Option<TranslationEntry>,
}

impl Walk {
    /// Physical base and granularity of the leaf, if mapped.
    pub fn leaf(&self) -> Option<(u64, PageSize)> {
        match (self.l1.l1_kind(), self.l2) {
            (L1Kind::Section, _) => Some((self.l1.base(), PageSize::Section)),
            (L1Kind::Table(_), Some(l2)) => match l2.l2_kind() {
                L2Kind::Small => Some((l2.base(), PageSize::Small)),
                L2Kind::Large => Some((l2.base(), PageSize::Large)),
                L2Kind::Unmapped => None,
            },
            _ => None,
        }
    }
}

/// Translation table store for a single domain.
///
/// Not internally synchronized: the owning domain serializes access.
pub struct PageTableStore {
    /// Physical base of the L1 table (what the hardware is programmed with).
    l1_phys: u64,

    /// L1 slots.
    l1: Vec<TranslationEntry>,

    /// Populated L2 leaves per L1 slot.
    refcount: Vec<u16>,

    /// L2 tables keyed by the physical frame backing them.
    tables: BTreeMap<u64, Box<L2Table>>,

    pool: Arc<TablePool>,
    cache: Arc<dyn CacheMaintenance>,

    /// Force cacheable + shareable on every mapping.
    cacheable_override: bool,
}

impl PageTableStore {
    /// Allocate an empty table.
    pub fn new(
        pool: Arc<TablePool>,
        cache: Arc<dyn CacheMaintenance>,
        cacheable_override: bool,
    ) -> IommuResult<Self> {
        let l1_phys = pool.alloc_frames(L1_FRAMES)?;
        cache.clean_range(l1_phys, L1_ENTRIES * ENTRY_BYTES as usize);

        Ok(Self {
            l1_phys,
            l1: vec![TranslationEntry::EMPTY; L1_ENTRIES],
            refcount: vec![0; L1_ENTRIES],
            tables: BTreeMap::new(),
            pool,
            cache,
            cacheable_override,
        })
    }

    /// Physical base of the L1 table.
    #[inline]
    pub fn base(&self) -> u64 {
        self.l1_phys
    }

    /// Populated leaf count under one L1 slot.
    #[inline]
    pub fn refcount(&self, iova: u64) -> u16 {
        self.refcount[l1_index(iova)]
    }

    /// Number of L2 tables currently held.
    #[inline]
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// Map `size` bytes at `iova` to `phys`.
    ///
    /// `size` must be 4 KiB, 64 KiB or 1 MiB and both addresses aligned to
    /// it. A section replacing an unused L2 table queues that table and its
    /// 1 MiB span on `gather`; the frame must not be reused until the span
    /// has been invalidated.
    pub fn map(
        &mut self,
        iova: u64,
        phys: u64,
        size: u64,
        prot: Prot,
        gather: &mut IotlbGather,
    ) -> IommuResult<()> {
        let pgsize = PageSize::from_bytes(size).ok_or(IommuError::InvalidRange)?;
        if iova & pgsize.offset_mask() != 0 || phys & pgsize.offset_mask() != 0 {
            return Err(IommuError::InvalidRange);
        }
        let beyond = |addr: u64, limit: u64| addr.checked_add(size).map_or(true, |end| end > limit);
        if beyond(iova, IOVA_LIMIT) || beyond(phys, PHYS_LIMIT) {
            return Err(IommuError::InvalidRange);
        }

        let attrs = EntryAttrs::from_prot(prot, self.cacheable_override);
        match pgsize {
            PageSize::Section => self.map_section(iova, phys, attrs, gather),
            PageSize::Large => self.map_pages(iova, TranslationEntry::large(phys, attrs), LARGE_PAGE_SLOTS),
            PageSize::Small => self.map_pages(iova, TranslationEntry::small(phys, attrs), 1),
        }
    }

    fn map_section(
        &mut self,
        iova: u64,
        phys: u64,
        attrs: EntryAttrs,
        gather: &mut IotlbGather,
    ) -> IommuResult<()> {
        let idx = l1_index(iova);
        match self.l1[idx].l1_kind() {
            L1Kind::Section => return Err(IommuError::AddrInUse),
            L1Kind::Table(table_phys) => {
                if self.refcount[idx] != 0 {
                    return Err(IommuError::AddrInUse);
                }
                // Detach now, release after the walker has forgotten it.
                self.tables.remove(&table_phys);
                gather.add_range(iova, SECTION_SIZE);
                gather.add_freed_table(table_phys);
            }
            L1Kind::Unmapped => {}
        }

        self.set_l1(idx, TranslationEntry::section(phys, attrs));
        Ok(())
    }

    fn map_pages(&mut self, iova: u64, entry: TranslationEntry, count: usize) -> IommuResult<()> {
        let idx = l1_index(iova);
        let table_phys = self.ensure_table(idx)?;
        let first = l2_index(iova);

        for written in 0..count {
            let slot = first + written;
            let table = self.table_mut(table_phys)?;
            if !table.entries[slot].is_empty() {
                for undo in first..slot {
                    table.entries[undo] = TranslationEntry::EMPTY;
                }
                if written > 0 {
                    self.cache.clean_range(
                        table_phys + first as u64 * ENTRY_BYTES,
                        written * ENTRY_BYTES as usize,
                    );
                }
                return Err(IommuError::AddrInUse);
            }
            table.entries[slot] = entry;
            self.cache.clean_range(table_phys + slot as u64 * ENTRY_BYTES, ENTRY_BYTES as usize);
        }

        self.refcount[idx] += count as u16;
        Ok(())
    }

    /// L2 table behind L1 slot `idx`, allocating it on first use.
    fn ensure_table(&mut self, idx: usize) -> IommuResult<u64> {
        match self.l1[idx].l1_kind() {
            L1Kind::Table(table_phys) => Ok(table_phys),
            L1Kind::Section => Err(IommuError::AddrInUse),
            L1Kind::Unmapped => {
                let table_phys = self.pool.alloc_frames(1)?;
                self.tables.insert(table_phys, Box::new(L2Table::new()));
                self.cache.clean_range(table_phys, L2_ENTRIES * ENTRY_BYTES as usize);
                self.set_l1(idx, TranslationEntry::table(table_phys));
                self.refcount[idx] = 0;
                Ok(table_phys)
            }
        }
    }

    /// Remove the mapping that covers `iova`.
    ///
    /// Returns the bytes the removed entry covered. An L1 slot with nothing
    /// behind it reports `min(size, 1 MiB)` without touching anything; an
    /// empty L2 slot reports 0. Asking for less than the entry's own
    /// granularity fails with [`IommuError::AddrInUse`].
    pub fn unmap(&mut self, iova: u64, size: u64, gather: &mut IotlbGather) -> IommuResult<u64> {
        if size == 0 || iova >= IOVA_LIMIT {
            return Err(IommuError::InvalidRange);
        }

        let idx = l1_index(iova);
        let table_phys = match self.l1[idx].l1_kind() {
            L1Kind::Unmapped => return Ok(size.min(SECTION_SIZE)),
            L1Kind::Section => {
                if size < SECTION_SIZE {
                    return Err(IommuError::AddrInUse);
                }
                self.set_l1(idx, TranslationEntry::EMPTY);
                gather.add_range(iova & !(SECTION_SIZE - 1), SECTION_SIZE);
                return Ok(SECTION_SIZE);
            }
            L1Kind::Table(table_phys) => table_phys,
        };

        let slot = l2_index(iova);
        let kind = self.table_mut(table_phys)?.entries[slot].l2_kind();
        let (first, count, bytes) = match kind {
            L2Kind::Unmapped => return Ok(0),
            L2Kind::Small => (slot, 1, SMALL_PAGE_SIZE),
            L2Kind::Large => {
                if size < LARGE_PAGE_SIZE {
                    return Err(IommuError::AddrInUse);
                }
                (slot & !(LARGE_PAGE_SLOTS - 1), LARGE_PAGE_SLOTS, LARGE_PAGE_SIZE)
            }
        };

        let table = self.table_mut(table_phys)?;
        for entry in &mut table.entries[first..first + count] {
            *entry = TranslationEntry::EMPTY;
        }
        self.cache.clean_range(
            table_phys + first as u64 * ENTRY_BYTES,
            count * ENTRY_BYTES as usize,
        );

        self.refcount[idx] = self.refcount[idx].saturating_sub(count as u16);
        gather.add_range(iova & !(bytes - 1), bytes);
        Ok(bytes)
    }

    /// Walk the table at `iova` without interpreting the leaf.
    pub fn walk(&self, iova: u64) -> Walk {
        let l1 = self.l1[l1_index(iova)];
        let l2 = match l1.l1_kind() {
            L1Kind::Table(table_phys) => self
                .tables
                .get(&table_phys)
                .map(|table| table.entry(l2_index(iova))),
            _ => None,
        };
        Walk { l1, l2 }
    }

    /// Translate `iova`, returning 0 when nothing is mapped.
    pub fn lookup(&self, iova: u64) -> u64 {
        if iova >= IOVA_LIMIT {
            return 0;
        }
        match self.walk(iova).leaf() {
            Some((base, pgsize)) => base | (iova & pgsize.offset_mask()),
            None => 0,
        }
    }

    fn set_l1(&mut self, idx: usize, entry: TranslationEntry) {
        self.l1[idx] = entry;
        self.cache
            .clean_range(self.l1_phys + idx as u64 * ENTRY_BYTES, ENTRY_BYTES as usize);
    }

    /// Writable view of the L2 table behind `table_phys`.
    fn table_mut(&mut self, table_phys: u64) -> IommuResult<&mut L2Table> {
        self.tables
            .get_mut(&table_phys)
            .map(|table| &mut **table)
            .ok_or(IommuError::InvalidConsistency)
    }
}

impl Drop for PageTableStore {
    fn drop(&mut self) {
        for &table_phys in self.tables.keys() {
            self.pool.free_frames(table_phys, 1);
        }
        self.pool.free_frames(self.l1_phys, L1_FRAMES);
    }
}
