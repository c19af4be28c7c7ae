//! System MMU translation engine.
//!
//! Drives a family of IOMMU units that translate device DMA through a
//! two-level table (1 MiB sections in L1, 64 KiB large and 4 KiB small
//! pages in L2).
//!
//! # Architecture
//!
//! ```text
//!  device A   device B        device C
//!      \         /               |
//!   +---------------+     +---------------+
//!   | DeviceGroup 1 |     | DeviceGroup 2 |
//!   +-------+-------+     +-------+-------+
//!           |   \                 |
//!           v    \                v
//!   +-----------+ \       +-----------+
//!   | instance0 |  +----->| instance1 |   register blocks, one lock each
//!   +-----+-----+         +-----+-----+
//!          \                    /
//!           v                  v
//!        +------------------------+
//!        | Domain (L1 + L2 tables)|        one lock per domain
//!        +------------------------+
//! ```
//!
//! # Usage
//!
//! 1. Build a [`TablePool`] over the memory window reserved for tables and
//!    create the driver with [`Smmu::new`].
//! 2. Register each unit ([`Smmu::register_instance`]), then the groups and
//!    devices behind them.
//! 3. [`Smmu::alloc_domain`], [`Smmu::attach`], then [`Smmu::map`] /
//!    [`Smmu::unmap`] + [`Smmu::iotlb_sync`].
//! 4. Route the unit's fault interrupt to [`Smmu::handle_fault_irq`] and, in
//!    asynchronous fault mode, call [`Smmu::run_deferred_faults`] from a
//!    worker.
//!
//! # Locking
//!
//! Domain locks and instance locks are never held together. Table updates
//! finish under the domain lock and hand an [`IotlbGather`] back; the
//! invalidation then runs under each instance lock.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
extern crate klog;

pub mod attach;
pub mod config;
pub mod domain;
pub mod entry;
pub mod fault;
pub mod instance;
pub mod irq;
pub mod pgtable;
pub mod pool;
pub mod power;
pub mod regs;
pub mod tlb;
pub mod tlb_dump;
pub mod trace;

#[cfg(test)]
mod testing;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU16, Ordering};
use spin::RwLock;

pub use attach::{AttachmentRegistry, DeviceId, GroupId};
pub use config::{SmmuConfig, StreamRoute, TlbGeometry};
pub use domain::{Domain, DomainId, DomainType};
pub use entry::Prot;
pub use fault::{FaultKind, FaultListener, FaultRecord, FaultReport, FaultResponse, PortFaultCallback};
pub use instance::{InstanceId, PerfCounts, SmmuInstance};
pub use pool::{CacheMaintenance, TablePool};
pub use power::PowerState;
pub use tlb::IotlbGather;
pub use trace::{EventTrace, TraceEvent};

use entry::SECTION_SIZE;
use fault::{PendingFault, SoftwareWalker};
use pgtable::Walk;

// ============================================================================
// Error Types
// ============================================================================

const EADDRINUSE: i32 = 98;
const ENOMEM: i32 = 12;
const EINVAL: i32 = 22;
const ENODEV: i32 = 19;
const EBUSY: i32 = 16;
const EFAULT: i32 = 14;
const ENOENT: i32 = 2;

/// Errors returned by the translation engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IommuError {
    /// Target slot already mapped, or unmap smaller than the entry.
    AddrInUse,
    /// Table pool exhausted.
    OutOfMemory,
    /// Instances of a group disagree on the attached table.
    InvalidConsistency,
    /// Fault's table base does not resolve to a live domain.
    UnreachableFaultAddress,
    /// Misaligned address or unsupported size.
    InvalidRange,
    DomainNotFound,
    /// Domain still has attached devices.
    DomainBusy,
    DeviceNotFound,
    GroupNotFound,
    InstanceNotFound,
    DeviceAlreadyAttached,
    NotAttached,
    InvalidPort,
    InvalidConfig,
}

impl IommuError {
    /// Negative errno for callers that speak the platform convention.
    pub fn to_errno(self) -> i32 {
        -match self {
            Self::AddrInUse => EADDRINUSE,
            Self::OutOfMemory => ENOMEM,
            Self::UnreachableFaultAddress => EFAULT,
            Self::DomainNotFound => ENOENT,
            Self::DomainBusy | Self::DeviceAlreadyAttached => EBUSY,
            Self::DeviceNotFound | Self::GroupNotFound | Self::InstanceNotFound => ENODEV,
            Self::InvalidConsistency
            | Self::InvalidRange
            | Self::NotAttached
            | Self::InvalidPort
            | Self::InvalidConfig => EINVAL,
        }
    }
}

impl fmt::Display for IommuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::AddrInUse => "address in use",
            Self::OutOfMemory => "out of table memory",
            Self::InvalidConsistency => "inconsistent table across group",
            Self::UnreachableFaultAddress => "fault table base unreachable",
            Self::InvalidRange => "invalid range",
            Self::DomainNotFound => "domain not found",
            Self::DomainBusy => "domain busy",
            Self::DeviceNotFound => "device not found",
            Self::GroupNotFound => "group not found",
            Self::InstanceNotFound => "instance not found",
            Self::DeviceAlreadyAttached => "device already attached",
            Self::NotAttached => "not attached",
            Self::InvalidPort => "invalid port",
            Self::InvalidConfig => "invalid configuration",
        })
    }
}

/// Result type for translation engine operations.
pub type IommuResult<T> = Result<T, IommuError>;

// ============================================================================
// Driver
// ============================================================================

/// The translation engine: domains, instances and their attachments.
pub struct Smmu {
    pool: Arc<TablePool>,
    cache: Arc<dyn CacheMaintenance>,
    domains: RwLock<BTreeMap<DomainId, Arc<Domain>>>,
    next_domain_id: AtomicU16,
    instances: RwLock<BTreeMap<InstanceId, Arc<SmmuInstance>>>,
    registry: AttachmentRegistry,
    listener: RwLock<Option<Arc<dyn FaultListener>>>,
    trace: EventTrace,
}

impl Smmu {
    pub fn new(pool: Arc<TablePool>, cache: Arc<dyn CacheMaintenance>) -> Self {
        Self {
            pool,
            cache,
            domains: RwLock::new(BTreeMap::new()),
            next_domain_id: AtomicU16::new(1),
            instances: RwLock::new(BTreeMap::new()),
            registry: AttachmentRegistry::new(),
            listener: RwLock::new(None),
            trace: EventTrace::new(),
        }
    }

    #[inline]
    pub fn trace(&self) -> &EventTrace {
        &self.trace
    }

    #[inline]
    pub fn registry(&self) -> &AttachmentRegistry {
        &self.registry
    }

    #[inline]
    pub fn pool(&self) -> &Arc<TablePool> {
        &self.pool
    }

    // ========================================================================
    // Topology
    // ========================================================================

    /// Take ownership of a probed unit.
    pub fn register_instance(&self, instance: SmmuInstance) -> IommuResult<Arc<SmmuInstance>> {
        let instance = Arc::new(instance);
        irq::without_interrupts(|| -> IommuResult<()> {
            let mut instances = self.instances.write();
            if instances.contains_key(&instance.id()) {
                return Err(IommuError::InvalidConfig);
            }
            instances.insert(instance.id(), instance.clone());
            Ok(())
        })?;
        klog_always!(
            "[SMMU:{}] registered: {} vm ({:#x} active), {} ports{}",
            instance.name(),
            instance.config().vm_count,
            instance.config().vmid_mask,
            instance.config().port_count,
            if instance.secure_regs().is_some() { ", secure bank" } else { "" }
        );
        Ok(instance)
    }

    pub fn instance(&self, id: InstanceId) -> IommuResult<Arc<SmmuInstance>> {
        self.instances.read().get(&id).cloned().ok_or(IommuError::InstanceNotFound)
    }

    /// Declare a group served by `instance_ids`.
    pub fn add_group(&self, id: GroupId, instance_ids: &[InstanceId]) -> IommuResult<()> {
        let instances = instance_ids
            .iter()
            .map(|&i| self.instance(i))
            .collect::<IommuResult<Vec<_>>>()?;
        self.registry.add_group(id, instances)
    }

    pub fn add_device(&self, device: DeviceId, group: GroupId, port: u32) -> IommuResult<()> {
        self.registry.add_device(device, group, port)
    }

    // ========================================================================
    // Domains
    // ========================================================================

    /// Allocate an empty domain.
    pub fn alloc_domain(&self, domain_type: DomainType) -> IommuResult<DomainId> {
        let cacheable_override = self
            .instances
            .read()
            .values()
            .any(|inst| inst.config().cacheable_override);

        let (id, base) = irq::without_interrupts(|| -> IommuResult<(DomainId, u64)> {
            let mut domains = self.domains.write();
            let id = loop {
                let id = self.next_domain_id.fetch_add(1, Ordering::Relaxed);
                if id != 0 && !domains.contains_key(&id) {
                    break id;
                }
            };
            let domain = Domain::new(id, domain_type, self.pool.clone(), self.cache.clone(), cacheable_override)?;
            let base = domain.pgt_base();
            domains.insert(id, Arc::new(domain));
            Ok((id, base))
        })?;

        self.trace.record(TraceEvent::Alloc, u64::from(id), base, 0);
        klog!(Debug, "[SMMU] domain {} allocated, table {:#x}", id, base);
        Ok(id)
    }

    /// Free a domain and every table frame it holds.
    ///
    /// Fails with [`IommuError::DomainBusy`] while any device is attached.
    /// Attach and detach hold the domain map shared for their whole run, so
    /// the busy check cannot interleave with them.
    pub fn free_domain(&self, id: DomainId) -> IommuResult<()> {
        let domain = irq::without_interrupts(|| -> IommuResult<Arc<Domain>> {
            let mut domains = self.domains.write();
            let domain = domains.get(&id).ok_or(IommuError::DomainNotFound)?;
            if domain.attached_devices() > 0 {
                klog!(Warn, "[SMMU] domain {} freed with {} devices attached", id, domain.attached_devices());
                return Err(IommuError::DomainBusy);
            }
            domains.remove(&id).ok_or(IommuError::DomainNotFound)
        })?;
        let base = domain.pgt_base();
        // Frames go back to the pool when the last reference drops.
        drop(domain);

        self.trace.record(TraceEvent::Free, u64::from(id), base, 0);
        Ok(())
    }

    pub fn domain(&self, id: DomainId) -> IommuResult<Arc<Domain>> {
        self.domains.read().get(&id).cloned().ok_or(IommuError::DomainNotFound)
    }

    // ========================================================================
    // Attachment
    // ========================================================================

    /// Attach `device` to `domain`. The domain map stays read-locked until
    /// the device is counted, keeping [`free_domain`](Self::free_domain) out.
    pub fn attach(&self, domain: DomainId, device: DeviceId) -> IommuResult<()> {
        let domains = self.domains.read();
        let domain = domains.get(&domain).ok_or(IommuError::DomainNotFound)?;
        self.registry.attach(domain, device)
    }

    pub fn detach(&self, domain: DomainId, device: DeviceId) -> IommuResult<()> {
        let domains = self.domains.read();
        let domain = domains.get(&domain).ok_or(IommuError::DomainNotFound)?;
        self.registry.detach(domain, device)
    }

    // ========================================================================
    // Mapping
    // ========================================================================

    /// Map one entry of `size` (4 KiB, 64 KiB or 1 MiB).
    ///
    /// A section that replaces an unused L2 table invalidates that MiB
    /// before the table frame is reused.
    pub fn map(&self, domain: DomainId, iova: u64, phys: u64, size: u64, prot: Prot) -> IommuResult<()> {
        let domain = self.domain(domain)?;
        let mut gather = IotlbGather::new();
        let result = domain.map(iova, phys, size, prot, &mut gather);
        if !gather.is_empty() {
            self.sync_domain(&domain, &mut gather);
        }
        result?;
        self.trace.record(TraceEvent::Map, iova, phys, size);
        Ok(())
    }

    /// Unmap `size` bytes starting at `iova`, one entry at a time.
    ///
    /// Each step stays inside the current 1 MiB slot, so an empty slot never
    /// counts bytes that belong to the next one. Returns the bytes covered.
    /// The span is added to `gather`; nothing is invalidated until
    /// [`iotlb_sync`](Self::iotlb_sync).
    pub fn unmap(&self, domain: DomainId, iova: u64, size: u64, gather: &mut IotlbGather) -> IommuResult<u64> {
        let domain = self.domain(domain)?;
        let mut unmapped = 0u64;
        while unmapped < size {
            let cur = iova + unmapped;
            let step = (size - unmapped).min(SECTION_SIZE - (cur & (SECTION_SIZE - 1)));
            let bytes = domain.unmap_one(cur, step, gather)?;
            if bytes == 0 {
                break;
            }
            unmapped += bytes;
        }
        self.trace.record(TraceEvent::Unmap, iova, size, unmapped);
        Ok(unmapped)
    }

    /// Translate `iova`; 0 if unmapped.
    pub fn iova_to_phys(&self, domain: DomainId, iova: u64) -> IommuResult<u64> {
        Ok(self.domain(domain)?.iova_to_phys(iova))
    }

    // ========================================================================
    // Invalidation
    // ========================================================================

    /// Full invalidation on every instance the domain is attached through.
    pub fn flush_iotlb_all(&self, domain: DomainId) -> IommuResult<()> {
        let domain = self.domain(domain)?;
        tlb::invalidate_all(&self.registry.instances_for_domain(domain.id()));
        self.trace.record(TraceEvent::Sync, u64::from(domain.id()), 0, u64::MAX);
        Ok(())
    }

    /// Invalidate the span collected in `gather` with one range operation
    /// per instance, then release any table frames it carried.
    pub fn iotlb_sync(&self, domain: DomainId, gather: &mut IotlbGather) -> IommuResult<()> {
        let domain = self.domain(domain)?;
        self.sync_domain(&domain, gather);
        Ok(())
    }

    fn sync_domain(&self, domain: &Domain, gather: &mut IotlbGather) {
        let (range, freed) = gather.take();
        if let Some((start, end)) = range {
            tlb::invalidate_range(&self.registry.instances_for_domain(domain.id()), start, end);
            self.trace.record(TraceEvent::Sync, u64::from(domain.id()), start, end);
        }
        for frame in freed {
            self.pool.free_frames(frame, 1);
        }
    }

    // ========================================================================
    // Power
    // ========================================================================

    /// System suspend of one unit.
    pub fn suspend(&self, instance: InstanceId) -> IommuResult<()> {
        self.instance(instance)?.suspend();
        self.trace.record(TraceEvent::Suspend, u64::from(instance), 0, 0);
        Ok(())
    }

    /// System resume of one unit.
    pub fn resume(&self, instance: InstanceId) -> IommuResult<()> {
        self.instance(instance)?.resume();
        self.trace.record(TraceEvent::Resume, u64::from(instance), 0, 0);
        Ok(())
    }

    /// Power domain is about to go down (runtime PM).
    pub fn power_off(&self, instance: InstanceId) -> IommuResult<()> {
        self.instance(instance)?.suspend();
        self.trace.record(TraceEvent::PowerOff, u64::from(instance), 0, 0);
        Ok(())
    }

    /// Power domain came back up (runtime PM).
    pub fn power_on(&self, instance: InstanceId) -> IommuResult<()> {
        self.instance(instance)?.resume();
        self.trace.record(TraceEvent::PowerOn, u64::from(instance), 0, 0);
        Ok(())
    }

    pub fn power_state(&self, instance: InstanceId) -> IommuResult<PowerState> {
        Ok(self.instance(instance)?.power_state())
    }

    // ========================================================================
    // Faults
    // ========================================================================

    pub fn set_fault_listener(&self, listener: Arc<dyn FaultListener>) {
        irq::without_interrupts(|| *self.listener.write() = Some(listener));
    }

    pub fn clear_fault_listener(&self) {
        irq::without_interrupts(|| *self.listener.write() = None);
    }

    pub fn register_fault_callback(
        &self,
        instance: InstanceId,
        port: u32,
        callback: PortFaultCallback,
    ) -> IommuResult<()> {
        self.instance(instance)?.register_fault_callback(port, callback)
    }

    pub fn unregister_fault_callback(&self, instance: InstanceId, port: u32) -> IommuResult<()> {
        self.instance(instance)?.unregister_fault_callback(port)
    }

    /// Fault interrupt entry point for one unit.
    ///
    /// Returns `Ok(None)` for a spurious interrupt. Panics after dumping
    /// diagnostics if the fault is unrecoverable and no listener claims it.
    pub fn handle_fault_irq(&self, id: InstanceId) -> IommuResult<Option<FaultReport>> {
        let instance = self.instance(id)?;
        let Some(record) = instance.decode_fault() else {
            klog!(Warn, "[SMMU:{}] spurious fault irq", instance.name());
            return Ok(None);
        };

        instance.stats().faults.fetch_add(1, Ordering::Relaxed);
        self.trace.record(TraceEvent::Fault, record.address, record.kind as u64, u64::from(id));
        fault::log_fault(&instance, &record);

        let device = self.registry.device_for_port(id, record.port);
        let listener = self.listener.read().clone();
        let response = match listener {
            Some(listener) => listener.report_device_fault(device, &record),
            None => FaultResponse::Retry,
        };
        instance.notify_port(&record);

        if instance.config().async_fault {
            instance.clear_fault(&record);
            instance.queue_deferred(PendingFault { record, response });
            return Ok(Some(FaultReport {
                instance: id,
                record,
                response,
                deferred: true,
                diagnosis: None,
            }));
        }

        let report = match response {
            FaultResponse::Handled => FaultReport {
                instance: id,
                record,
                response,
                deferred: false,
                diagnosis: None,
            },
            FaultResponse::Retry => self.resolve_fault(&instance, record, response),
        };
        instance.clear_fault(&record);
        Ok(Some(report))
    }

    /// Run diagnostics for faults queued in asynchronous mode.
    pub fn run_deferred_faults(&self) -> Vec<FaultReport> {
        let instances: Vec<_> = self.instances.read().values().cloned().collect();
        let mut reports = Vec::new();
        for instance in instances {
            for pending in instance.take_deferred() {
                let mut report = self.resolve_fault(&instance, pending.record, pending.response);
                report.deferred = true;
                reports.push(report);
            }
        }
        reports
    }

    fn resolve_fault(&self, instance: &SmmuInstance, record: FaultRecord, response: FaultResponse) -> FaultReport {
        let fatal = response == FaultResponse::Retry && !record.kind.is_recoverable();
        let diagnosis = fault::diagnose(instance, &record, self, fatal);
        if fatal {
            fault::abort_unrecoverable(instance, &record);
        }
        FaultReport {
            instance: instance.id(),
            record,
            response,
            deferred: false,
            diagnosis: Some(diagnosis),
        }
    }
}

impl SoftwareWalker for Smmu {
    fn walk(&self, pgt_base: u64, iova: u64) -> IommuResult<Walk> {
        let domain = self
            .domains
            .read()
            .values()
            .find(|d| d.pgt_base() == pgt_base)
            .cloned()
            .ok_or(IommuError::UnreachableFaultAddress)?;
        Ok(domain.walk(iova))
    }
}

// ============================================================================
// Tests
// ============================================================================
