//! Physical translation unit.
//!
//! One [`SmmuInstance`] per hardware register block. Everything that touches
//! the block (attach bookkeeping, power transitions, invalidation, TLB dump,
//! perf counters, fault decode) runs under the instance lock, taken with
//! local interrupts masked because the fault handler contends for it.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::{Mutex, RwLock};

use crate::config::SmmuConfig;
use crate::fault::{FaultRecord, PendingFault, PortFaultCallback};
use crate::irq;
use crate::regs::{self, RegisterAccess};
use crate::{IommuError, IommuResult};

/// Instance identifier type.
pub type InstanceId = u32;

/// Pending asynchronous faults kept per instance before the oldest is dropped.
const MAX_DEFERRED_FAULTS: usize = 32;

/// State guarded by the instance lock.
#[derive(Debug, Default)]
pub struct InstanceState {
    /// Groups currently attached through this instance.
    pub(crate) attach_count: u32,
    /// Power domain is up and registers are reachable.
    pub(crate) powered: bool,
    /// Table base recorded by the first attach.
    pub(crate) pgt_base: Option<u64>,
    /// Translation enabled in hardware.
    pub(crate) enabled: bool,
}

impl InstanceState {
    #[inline]
    pub fn is_attached(&self) -> bool {
        self.attach_count > 0
    }

    /// Attached and powered: registers may be programmed.
    #[inline]
    pub fn is_live(&self) -> bool {
        self.is_attached() && self.powered
    }
}

/// Per-instance counters.
#[derive(Debug, Default)]
pub struct InstanceStats {
    pub full_flushes: AtomicU64,
    pub range_flushes: AtomicU64,
    pub enables: AtomicU64,
    pub disables: AtomicU64,
    pub faults: AtomicU64,
    pub dropped_faults: AtomicU64,
}

/// Hit/miss counts of one port's translation cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PerfCounts {
    pub hits: u32,
    pub misses: u32,
}

/// One physical translation unit.
pub struct SmmuInstance {
    id: InstanceId,
    config: SmmuConfig,
    regs: Arc<dyn RegisterAccess>,
    /// Secure bank, reached through a privileged gate.
    secure: Option<Arc<dyn RegisterAccess>>,
    state: Mutex<InstanceState>,
    stats: InstanceStats,
    deferred: Mutex<VecDeque<PendingFault>>,
    port_callbacks: RwLock<BTreeMap<u32, PortFaultCallback>>,
}

impl SmmuInstance {
    /// Create an instance over a register block.
    ///
    /// The block is assumed powered at probe; translation stays disabled
    /// until the first attach.
    pub fn new(
        id: InstanceId,
        config: SmmuConfig,
        regs: Arc<dyn RegisterAccess>,
        secure: Option<Arc<dyn RegisterAccess>>,
    ) -> IommuResult<Self> {
        config.validate()?;
        Ok(Self {
            id,
            config,
            regs,
            secure,
            state: Mutex::new(InstanceState {
                powered: true,
                ..InstanceState::default()
            }),
            stats: InstanceStats::default(),
            deferred: Mutex::new(VecDeque::new()),
            port_callbacks: RwLock::new(BTreeMap::new()),
        })
    }

    #[inline]
    pub fn id(&self) -> InstanceId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    #[inline]
    pub fn config(&self) -> &SmmuConfig {
        &self.config
    }

    #[inline]
    pub fn regs(&self) -> &dyn RegisterAccess {
        &*self.regs
    }

    #[inline]
    pub fn secure_regs(&self) -> Option<&dyn RegisterAccess> {
        self.secure.as_deref()
    }

    #[inline]
    pub fn stats(&self) -> &InstanceStats {
        &self.stats
    }

    /// Run `f` under the instance lock with local interrupts masked.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut InstanceState) -> R) -> R {
        irq::without_interrupts(|| f(&mut *self.state.lock()))
    }

    pub fn attach_count(&self) -> u32 {
        self.with_state(|state| state.attach_count)
    }

    /// Table base recorded by the current attachment.
    pub fn pgt_base(&self) -> Option<u64> {
        self.with_state(|state| state.pgt_base)
    }

    pub fn is_enabled(&self) -> bool {
        self.with_state(|state| state.enabled)
    }

    // ========================================================================
    // Attach / Detach
    // ========================================================================

    /// Take one attach reference for a group using table `pgt_base`.
    ///
    /// The first reference records the base and, when powered, programs and
    /// enables the unit. A second table while the first is still attached
    /// fails with [`IommuError::InvalidConsistency`].
    pub fn attach(&self, pgt_base: u64) -> IommuResult<()> {
        self.with_state(|state| {
            if let Some(current) = state.pgt_base {
                if state.attach_count > 0 && current != pgt_base {
                    klog!(
                        Error,
                        "[SMMU:{}] attach of table {:#x} while {:#x} is live",
                        self.name(),
                        pgt_base,
                        current
                    );
                    return Err(IommuError::InvalidConsistency);
                }
            }

            state.attach_count += 1;
            if state.attach_count == 1 {
                state.pgt_base = Some(pgt_base);
                if state.powered {
                    self.program_and_enable_locked(state);
                }
            }
            Ok(())
        })
    }

    /// Drop one attach reference; the last one disables the unit.
    pub fn detach(&self) -> IommuResult<()> {
        self.with_state(|state| {
            if state.attach_count == 0 {
                return Err(IommuError::NotAttached);
            }
            state.attach_count -= 1;
            if state.attach_count == 0 {
                if state.powered {
                    self.disable_locked(state);
                }
                state.pgt_base = None;
            }
            Ok(())
        })
    }

    // ========================================================================
    // Programming
    // ========================================================================

    /// Full enable sequence. Registers do not survive power-off, so this is
    /// also the resume path.
    pub(crate) fn program_and_enable_locked(&self, state: &mut InstanceState) {
        let Some(base) = state.pgt_base else {
            return;
        };
        let regs = self.regs();
        let config = &self.config;

        let mut vm_ctrl = regs::VM_CTRL_ENABLE;
        if config.cacheable_override {
            vm_ctrl |= regs::VM_CTRL_CACHEABLE;
        }
        if let Some(qos) = config.qos_override {
            vm_ctrl |= regs::VM_CTRL_QOS_EN | (u32::from(qos) << regs::VM_CTRL_QOS_SHIFT);
        }
        let mut vm_attr = regs::VM_ATTR_FAULT_IRQ;
        if config.async_fault {
            vm_attr |= regs::VM_ATTR_ASYNC_FAULT;
        }

        for vm in config.active_vms() {
            regs.write(regs::vm_reg(vm, regs::VM_PT_BASE), base as u32);
            regs.write(regs::vm_reg(vm, regs::VM_PT_BASE_HI), (base >> 32) as u32);
            regs.write(regs::vm_reg(vm, regs::VM_ATTR), vm_attr);
            regs.write(regs::vm_reg(vm, regs::VM_CTRL), vm_ctrl);
        }

        for route in &config.stream_routes {
            regs.write(regs::stream_reg(route.index, regs::STREAM_CFG), route.cfg);
            regs.write(regs::stream_reg(route.index, regs::STREAM_MATCH_CFG), route.match_cfg);
            regs.write(regs::stream_reg(route.index, regs::STREAM_MATCH_VALUE), route.match_value);
            regs.write(regs::stream_reg(route.index, regs::STREAM_MATCH_MASK), route.match_mask);
        }
        regs.write(regs::DEFAULT_STREAM_CFG, config.default_stream_cfg);

        self.flush_all_locked(state);
        regs.modify(regs::CTRL, 0, regs::CTRL_ENABLE | regs::CTRL_FAULT_IRQ);

        state.enabled = true;
        self.stats.enables.fetch_add(1, Ordering::Relaxed);
        klog!(Debug, "[SMMU:{}] enabled, table {:#x}", self.name(), base);
    }

    /// Stop translation. The caller has already flushed if required.
    pub(crate) fn disable_locked(&self, state: &mut InstanceState) {
        let regs = self.regs();
        regs.modify(regs::CTRL, regs::CTRL_ENABLE | regs::CTRL_FAULT_IRQ, 0);
        for vm in self.config.active_vms() {
            regs.write(regs::vm_reg(vm, regs::VM_CTRL), 0);
        }
        state.enabled = false;
        self.stats.disables.fetch_add(1, Ordering::Relaxed);
        klog!(Debug, "[SMMU:{}] disabled", self.name());
    }

    // ========================================================================
    // Performance Counters
    // ========================================================================

    fn check_port(&self, port: u32) -> IommuResult<()> {
        if port >= self.config.port_count {
            return Err(IommuError::InvalidPort);
        }
        Ok(())
    }

    /// Reset and start the counters of `port`. No-op while powered off.
    pub fn perf_start(&self, port: u32) -> IommuResult<()> {
        self.check_port(port)?;
        self.with_state(|state| {
            if state.powered {
                let regs = self.regs();
                regs.write(regs::PORT_SEL, port);
                regs.write(regs::PERF_CTRL, regs::PERF_RESET);
                regs.write(regs::PERF_CTRL, regs::PERF_START);
            }
        });
        Ok(())
    }

    /// Freeze the counters of `port`.
    pub fn perf_stop(&self, port: u32) -> IommuResult<()> {
        self.check_port(port)?;
        self.with_state(|state| {
            if state.powered {
                let regs = self.regs();
                regs.write(regs::PORT_SEL, port);
                regs.write(regs::PERF_CTRL, 0);
            }
        });
        Ok(())
    }

    /// Read the counters of `port`; zero while powered off.
    pub fn perf_read(&self, port: u32) -> IommuResult<PerfCounts> {
        self.check_port(port)?;
        Ok(self.with_state(|state| {
            if !state.powered {
                return PerfCounts::default();
            }
            let regs = self.regs();
            regs.write(regs::PORT_SEL, port);
            PerfCounts {
                hits: regs.read(regs::PERF_HIT),
                misses: regs.read(regs::PERF_MISS),
            }
        }))
    }

    // ========================================================================
    // Fault Plumbing
    // ========================================================================

    /// Install the callback for faults raised by `port`.
    pub fn register_fault_callback(&self, port: u32, callback: PortFaultCallback) -> IommuResult<()> {
        self.check_port(port)?;
        irq::without_interrupts(|| self.port_callbacks.write().insert(port, callback));
        Ok(())
    }

    pub fn unregister_fault_callback(&self, port: u32) -> IommuResult<()> {
        self.check_port(port)?;
        irq::without_interrupts(|| self.port_callbacks.write().remove(&port));
        Ok(())
    }

    /// Fire the callback registered for the fault's port, if any.
    pub(crate) fn notify_port(&self, record: &FaultRecord) {
        let callback = self.port_callbacks.read().get(&record.port).cloned();
        if let Some(callback) = callback {
            callback(record);
        }
    }

    pub(crate) fn queue_deferred(&self, pending: PendingFault) {
        irq::without_interrupts(|| {
            let mut queue = self.deferred.lock();
            if queue.len() == MAX_DEFERRED_FAULTS {
                queue.pop_front();
                self.stats.dropped_faults.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(pending);
        });
    }

    /// Drain the deferred queue. The irq pushes onto it, so the worker
    /// takes it masked too.
    pub(crate) fn take_deferred(&self) -> Vec<PendingFault> {
        irq::without_interrupts(|| self.deferred.lock().drain(..).collect())
    }
}

impl core::fmt::Debug for SmmuInstance {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SmmuInstance")
            .field("id", &self.id)
            .field("name", &self.config.name)
            .finish()
    }
}
