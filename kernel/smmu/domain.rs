//! Translation domains.
//!
//! A domain is one isolated IOVA space: a [`PageTableStore`] behind its own
//! lock plus the bookkeeping needed to refuse a free while devices still use
//! it. Devices reach a domain only through the attachment registry.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use spin::Mutex;

use crate::entry::Prot;
use crate::irq;
use crate::pgtable::{PageTableStore, Walk};
use crate::pool::{CacheMaintenance, TablePool};
use crate::tlb::IotlbGather;
use crate::IommuResult;

/// Domain identifier type.
pub type DomainId = u16;

/// Domain type requested at allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainType {
    /// Managed by the DMA API on behalf of a device driver.
    Dma,
    /// Mapped explicitly by its owner (e.g. a VM or a firmware loader).
    Unmanaged,
}

/// An isolated IOVA space.
pub struct Domain {
    id: DomainId,
    domain_type: DomainType,

    /// Guards every slot-shape transition of the table.
    pgtable: Mutex<PageTableStore>,

    /// L1 base, fixed for the domain's lifetime.
    pgt_base: u64,

    /// Devices currently attached.
    attached: AtomicU32,

    /// Bytes currently mapped (statistics).
    mapped_bytes: AtomicU64,
}

impl Domain {
    pub fn new(
        id: DomainId,
        domain_type: DomainType,
        pool: Arc<TablePool>,
        cache: Arc<dyn CacheMaintenance>,
        cacheable_override: bool,
    ) -> IommuResult<Self> {
        let pgtable = PageTableStore::new(pool, cache, cacheable_override)?;
        let pgt_base = pgtable.base();
        Ok(Self {
            id,
            domain_type,
            pgtable: Mutex::new(pgtable),
            pgt_base,
            attached: AtomicU32::new(0),
            mapped_bytes: AtomicU64::new(0),
        })
    }

    #[inline]
    pub fn id(&self) -> DomainId {
        self.id
    }

    #[inline]
    pub fn domain_type(&self) -> DomainType {
        self.domain_type
    }

    /// Physical base of the L1 table.
    #[inline]
    pub fn pgt_base(&self) -> u64 {
        self.pgt_base
    }

    /// Number of devices attached.
    #[inline]
    pub fn attached_devices(&self) -> u32 {
        self.attached.load(Ordering::Acquire)
    }

    #[inline]
    pub fn mapped_bytes(&self) -> u64 {
        self.mapped_bytes.load(Ordering::Relaxed)
    }

    pub(crate) fn inc_attached(&self) {
        self.attached.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn dec_attached(&self) {
        self.attached.fetch_sub(1, Ordering::AcqRel);
    }

    /// Run `f` on the table with the domain lock held.
    ///
    /// The fault path reads the table too, so the lock is taken with local
    /// interrupts masked.
    fn with_table<R>(&self, f: impl FnOnce(&mut PageTableStore) -> R) -> R {
        irq::without_interrupts(|| f(&mut *self.pgtable.lock()))
    }

    /// Map a single entry of `size` bytes.
    pub fn map(
        &self,
        iova: u64,
        phys: u64,
        size: u64,
        prot: Prot,
        gather: &mut IotlbGather,
    ) -> IommuResult<()> {
        self.with_table(|table| table.map(iova, phys, size, prot, gather))?;
        self.mapped_bytes.fetch_add(size, Ordering::Relaxed);
        Ok(())
    }

    /// Unmap the single entry covering `iova`. See [`PageTableStore::unmap`].
    pub fn unmap_one(&self, iova: u64, size: u64, gather: &mut IotlbGather) -> IommuResult<u64> {
        let (walk, unmapped) = self.with_table(|table| {
            let walk = table.walk(iova);
            table.unmap(iova, size, gather).map(|bytes| (walk, bytes))
        })?;
        if walk.leaf().is_some() {
            // Only real removals count against the mapped total.
            let _ = self.mapped_bytes.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(unmapped))
            });
        }
        Ok(unmapped)
    }

    /// Translate `iova`; 0 if unmapped.
    pub fn iova_to_phys(&self, iova: u64) -> u64 {
        self.with_table(|table| table.lookup(iova))
    }

    /// Raw walk for diagnostics.
    pub fn walk(&self, iova: u64) -> Walk {
        self.with_table(|table| table.walk(iova))
    }
}

impl core::fmt::Debug for Domain {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Domain")
            .field("id", &self.id)
            .field("type", &self.domain_type)
            .field("pgt_base", &format_args!("{:#x}", self.pgt_base))
            .field("attached", &self.attached_devices())
            .finish()
    }
}
