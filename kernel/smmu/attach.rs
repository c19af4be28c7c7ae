//! Device attachment registry.
//!
//! Devices are grouped: every device in a group sits behind the same set of
//! physical instances and therefore shares one domain. The first device of a
//! group to attach takes one attach reference on each instance; the last one
//! to detach drops them.
//!
//! Lock order: registry maps, then group state, then instance lock. The
//! group and device maps are read from the fault handler, so their writers
//! mask local interrupts.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::{Mutex, RwLock};

use crate::domain::{Domain, DomainId};
use crate::instance::{InstanceId, SmmuInstance};
use crate::irq;
use crate::{IommuError, IommuResult};

/// Group identifier type.
pub type GroupId = u32;

/// Device identifier type.
pub type DeviceId = u32;

#[derive(Debug, Default)]
struct GroupState {
    domain: Option<DomainId>,
    attach_count: u32,
}

/// Devices sharing a set of instances and one domain.
pub struct DeviceGroup {
    id: GroupId,
    instances: Vec<Arc<SmmuInstance>>,
    state: Mutex<GroupState>,
}

impl DeviceGroup {
    #[inline]
    pub fn id(&self) -> GroupId {
        self.id
    }

    #[inline]
    pub fn instances(&self) -> &[Arc<SmmuInstance>] {
        &self.instances
    }

    /// Domain currently attached, if any.
    pub fn domain(&self) -> Option<DomainId> {
        self.state.lock().domain
    }

    /// Attached devices.
    pub fn attach_count(&self) -> u32 {
        self.state.lock().attach_count
    }

    /// Attach every instance to `pgt_base`, undoing on the first failure.
    fn attach_instances(&self, pgt_base: u64) -> IommuResult<()> {
        for (done, instance) in self.instances.iter().enumerate() {
            if let Err(e) = instance.attach(pgt_base) {
                for attached in &self.instances[..done] {
                    if let Err(undo) = attached.detach() {
                        klog!(Warn, "[SMMU:{}] group {} attach unwind: {}", attached.name(), self.id, undo);
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn detach_instances(&self) {
        for instance in &self.instances {
            if let Err(e) = instance.detach() {
                klog!(Warn, "[SMMU:{}] group {} detach: {}", instance.name(), self.id, e);
            }
        }
    }
}

/// Where a device sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub group: GroupId,
    /// Master port on every instance of the group.
    pub port: u32,
}

/// A live device-to-domain binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentRecord {
    pub device: DeviceId,
    pub group: GroupId,
    pub domain: DomainId,
}

/// Groups, devices and their live attachments.
#[derive(Default)]
pub struct AttachmentRegistry {
    groups: RwLock<BTreeMap<GroupId, Arc<DeviceGroup>>>,
    devices: RwLock<BTreeMap<DeviceId, DeviceInfo>>,
    records: Mutex<BTreeMap<DeviceId, AttachmentRecord>>,
}

impl AttachmentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a group over `instances`. Re-registering an id replaces it
    /// only while the old group is idle.
    pub fn add_group(&self, id: GroupId, instances: Vec<Arc<SmmuInstance>>) -> IommuResult<()> {
        if instances.is_empty() {
            return Err(IommuError::InvalidConfig);
        }
        let group = Arc::new(DeviceGroup {
            id,
            instances,
            state: Mutex::new(GroupState::default()),
        });
        irq::without_interrupts(|| -> IommuResult<()> {
            let mut groups = self.groups.write();
            if groups.get(&id).is_some_and(|g| g.attach_count() > 0) {
                return Err(IommuError::DomainBusy);
            }
            groups.insert(id, group);
            Ok(())
        })
    }

    pub fn group(&self, id: GroupId) -> IommuResult<Arc<DeviceGroup>> {
        self.groups.read().get(&id).cloned().ok_or(IommuError::GroupNotFound)
    }

    /// Place `device` on `port` of `group`.
    pub fn add_device(&self, device: DeviceId, group: GroupId, port: u32) -> IommuResult<()> {
        let group_ref = self.group(group)?;
        if group_ref.instances().iter().any(|inst| port >= inst.config().port_count) {
            return Err(IommuError::InvalidPort);
        }
        if self.records.lock().contains_key(&device) {
            return Err(IommuError::DeviceAlreadyAttached);
        }
        irq::without_interrupts(|| self.devices.write().insert(device, DeviceInfo { group, port }));
        Ok(())
    }

    pub fn device(&self, device: DeviceId) -> IommuResult<DeviceInfo> {
        self.devices.read().get(&device).copied().ok_or(IommuError::DeviceNotFound)
    }

    pub fn record(&self, device: DeviceId) -> Option<AttachmentRecord> {
        self.records.lock().get(&device).copied()
    }

    /// Bind `device` to `domain`.
    ///
    /// The first device of a group attaches every instance of the group; a
    /// group already bound to another domain fails with
    /// [`IommuError::InvalidConsistency`].
    pub fn attach(&self, domain: &Domain, device: DeviceId) -> IommuResult<()> {
        let info = self.device(device)?;
        let group = self.group(info.group)?;

        let mut records = self.records.lock();
        if records.contains_key(&device) {
            return Err(IommuError::DeviceAlreadyAttached);
        }

        let mut state = group.state.lock();
        match state.domain {
            Some(current) if current != domain.id() => {
                klog!(
                    Error,
                    "[SMMU] group {} bound to domain {}, refusing domain {}",
                    group.id,
                    current,
                    domain.id()
                );
                return Err(IommuError::InvalidConsistency);
            }
            Some(_) => {}
            None => {
                group.attach_instances(domain.pgt_base())?;
                state.domain = Some(domain.id());
            }
        }
        state.attach_count += 1;
        drop(state);

        records.insert(
            device,
            AttachmentRecord {
                device,
                group: info.group,
                domain: domain.id(),
            },
        );
        domain.inc_attached();
        klog!(Info, "[SMMU] device {} attached to domain {}", device, domain.id());
        Ok(())
    }

    /// Unbind `device` from `domain`.
    pub fn detach(&self, domain: &Domain, device: DeviceId) -> IommuResult<()> {
        let mut records = self.records.lock();
        let record = records.get(&device).copied().ok_or(IommuError::NotAttached)?;
        if record.domain != domain.id() {
            return Err(IommuError::NotAttached);
        }
        let group = self.group(record.group)?;

        let mut state = group.state.lock();
        state.attach_count -= 1;
        if state.attach_count == 0 {
            group.detach_instances();
            state.domain = None;
        }
        drop(state);

        records.remove(&device);
        domain.dec_attached();
        klog!(Info, "[SMMU] device {} detached from domain {}", device, domain.id());
        Ok(())
    }

    /// Instances currently translating for `domain`, each listed once.
    pub fn instances_for_domain(&self, domain: DomainId) -> Vec<Arc<SmmuInstance>> {
        let mut out: Vec<Arc<SmmuInstance>> = Vec::new();
        for group in self.groups.read().values() {
            if group.domain() != Some(domain) {
                continue;
            }
            for instance in group.instances() {
                if !out.iter().any(|i| i.id() == instance.id()) {
                    out.push(instance.clone());
                }
            }
        }
        out
    }

    /// Device on `port` of a group that includes `instance`.
    pub fn device_for_port(&self, instance: InstanceId, port: u32) -> Option<DeviceId> {
        let groups = self.groups.read();
        self.devices
            .read()
            .iter()
            .find(|(_, info)| {
                info.port == port
                    && groups
                        .get(&info.group)
                        .is_some_and(|g| g.instances().iter().any(|i| i.id() == instance))
            })
            .map(|(&device, _)| device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SmmuConfig;
    use crate::domain::DomainType;
    use crate::pool::TablePool;
    use crate::testing::{CountingCache, MockRegisters};
    use std::vec;

    struct Fixture {
        registry: AttachmentRegistry,
        a: Arc<SmmuInstance>,
        b: Arc<SmmuInstance>,
        pool: Arc<TablePool>,
    }

    fn instance(id: InstanceId) -> Arc<SmmuInstance> {
        let config = SmmuConfig {
            port_count: 4,
            ..Default::default()
        };
        Arc::new(SmmuInstance::new(id, config, Arc::new(MockRegisters::new()), None).unwrap())
    }

    fn fixture() -> Fixture {
        let registry = AttachmentRegistry::new();
        let a = instance(0);
        let b = instance(1);
        registry.add_group(10, vec![a.clone(), b.clone()]).unwrap();
        registry.add_group(20, vec![b.clone()]).unwrap();
        registry.add_device(100, 10, 1).unwrap();
        registry.add_device(101, 10, 2).unwrap();
        registry.add_device(200, 20, 3).unwrap();
        let pool = Arc::new(TablePool::new(0x4000_0000, 512).unwrap());
        Fixture { registry, a, b, pool }
    }

    fn domain(f: &Fixture, id: DomainId) -> Domain {
        Domain::new(id, DomainType::Dma, f.pool.clone(), Arc::new(CountingCache::default()), false).unwrap()
    }

    #[test]
    fn test_group_shares_one_instance_reference() {
        let f = fixture();
        let d = domain(&f, 1);
        f.registry.attach(&d, 100).unwrap();
        f.registry.attach(&d, 101).unwrap();
        assert_eq!(f.a.attach_count(), 1);
        assert_eq!(f.b.attach_count(), 1);
        assert_eq!(d.attached_devices(), 2);

        f.registry.detach(&d, 100).unwrap();
        assert!(f.a.is_enabled());
        f.registry.detach(&d, 101).unwrap();
        assert_eq!(f.a.attach_count(), 0);
        assert!(!f.b.is_enabled());
        assert_eq!(f.registry.group(10).unwrap().domain(), None);
    }

    #[test]
    fn test_conflicting_table_unwinds() {
        let f = fixture();
        let d1 = domain(&f, 1);
        let d2 = domain(&f, 2);
        // Instance b is shared: group 20 pins it to d1.
        f.registry.attach(&d1, 200).unwrap();
        assert_eq!(f.registry.attach(&d2, 100), Err(IommuError::InvalidConsistency));
        // a was attached first and must have been rolled back.
        assert_eq!(f.a.attach_count(), 0);
        assert!(!f.a.is_enabled());
        assert_eq!(f.b.pgt_base(), Some(d1.pgt_base()));
        assert_eq!(f.registry.record(100), None);
        assert_eq!(d2.attached_devices(), 0);
    }

    #[test]
    fn test_group_bound_to_other_domain() {
        let f = fixture();
        let d1 = domain(&f, 1);
        let d2 = domain(&f, 2);
        f.registry.attach(&d1, 100).unwrap();
        assert_eq!(f.registry.attach(&d2, 101), Err(IommuError::InvalidConsistency));
        assert_eq!(f.registry.attach(&d1, 100), Err(IommuError::DeviceAlreadyAttached));
    }

    #[test]
    fn test_detach_errors() {
        let f = fixture();
        let d1 = domain(&f, 1);
        let d2 = domain(&f, 2);
        assert_eq!(f.registry.detach(&d1, 100), Err(IommuError::NotAttached));
        f.registry.attach(&d1, 100).unwrap();
        assert_eq!(f.registry.detach(&d2, 100), Err(IommuError::NotAttached));
        assert_eq!(f.registry.attach(&d1, 999), Err(IommuError::DeviceNotFound));
    }

    #[test]
    fn test_lookup_helpers() {
        let f = fixture();
        let d = domain(&f, 1);
        f.registry.attach(&d, 100).unwrap();
        f.registry.attach(&d, 200).unwrap();
        let ids: Vec<_> = f.registry.instances_for_domain(1).iter().map(|i| i.id()).collect();
        assert_eq!(ids, vec![0, 1]);
        assert_eq!(f.registry.device_for_port(1, 3), Some(200));
        assert_eq!(f.registry.device_for_port(0, 3), None);
        assert_eq!(f.registry.add_device(300, 10, 4), Err(IommuError::InvalidPort));
        assert_eq!(f.registry.add_device(300, 99, 0), Err(IommuError::GroupNotFound));
    }
}
