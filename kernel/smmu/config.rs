//! Static per-instance configuration.
//!
//! Built once at probe time from platform data and validated before the
//! instance is registered; nothing here changes afterwards.

use alloc::string::String;
use alloc::vec::Vec;
use core::ops::Range;

use crate::{IommuError, IommuResult};

/// Maximum VM contexts one instance can expose.
pub const MAX_VMS: u32 = 8;

/// Stream route table size.
pub const MAX_STREAM_ROUTES: u8 = 64;

/// Master ports one instance can serve.
pub const MAX_PORTS: u32 = 32;

/// One stream route table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamRoute {
    pub index: u8,
    pub cfg: u32,
    pub match_cfg: u32,
    pub match_value: u32,
    pub match_mask: u32,
}

/// Shape of one hardware translation cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheGeometry {
    pub ways: u32,
    pub sets: u32,
    pub sublines: u32,
}

impl CacheGeometry {
    pub const fn entries(&self) -> u32 {
        self.ways * self.sets * self.sublines
    }
}

/// Translation cache hierarchy: one cache per port, one shared cache and
/// one top-level cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbGeometry {
    pub port: CacheGeometry,
    pub shared: CacheGeometry,
    pub top: CacheGeometry,
}

impl Default for TlbGeometry {
    fn default() -> Self {
        Self {
            port: CacheGeometry { ways: 2, sets: 4, sublines: 4 },
            shared: CacheGeometry { ways: 4, sets: 32, sublines: 4 },
            top: CacheGeometry { ways: 8, sets: 1, sublines: 1 },
        }
    }
}

/// Configuration of one physical translation unit.
#[derive(Debug, Clone)]
pub struct SmmuConfig {
    /// Short name used in log prefixes.
    pub name: String,
    /// VM contexts implemented by the hardware.
    pub vm_count: u32,
    /// Contexts actually in use; every flush targets each of them.
    pub vmid_mask: u32,
    /// Master ports behind this unit.
    pub port_count: u32,
    pub stream_routes: Vec<StreamRoute>,
    pub default_stream_cfg: u32,
    /// 4-bit QoS forced onto every transaction.
    pub qos_override: Option<u8>,
    /// Force cacheable + shareable on every table walk and mapping.
    pub cacheable_override: bool,
    /// Notify listeners from the irq and defer diagnostics to a worker.
    pub async_fault: bool,
    /// IOVA window owned by the secure world.
    pub secure_iova: Option<Range<u64>>,
    pub tlb: TlbGeometry,
}

impl Default for SmmuConfig {
    fn default() -> Self {
        Self {
            name: String::from("smmu"),
            vm_count: 1,
            vmid_mask: 0x1,
            port_count: 1,
            stream_routes: Vec::new(),
            default_stream_cfg: 0,
            qos_override: None,
            cacheable_override: false,
            async_fault: false,
            secure_iova: None,
            tlb: TlbGeometry::default(),
        }
    }
}

impl SmmuConfig {
    /// Reject configurations the hardware cannot be programmed with.
    pub fn validate(&self) -> IommuResult<()> {
        if self.vm_count == 0 || self.vm_count > MAX_VMS {
            return Err(IommuError::InvalidConfig);
        }
        if self.vmid_mask == 0 || self.vmid_mask >> self.vm_count != 0 {
            return Err(IommuError::InvalidConfig);
        }
        if self.port_count == 0 || self.port_count > MAX_PORTS {
            return Err(IommuError::InvalidConfig);
        }
        if self.qos_override.is_some_and(|qos| qos > 0xf) {
            return Err(IommuError::InvalidConfig);
        }
        if self.stream_routes.iter().any(|r| r.index >= MAX_STREAM_ROUTES) {
            return Err(IommuError::InvalidConfig);
        }
        if let Some(window) = &self.secure_iova {
            if window.start >= window.end {
                return Err(IommuError::InvalidConfig);
            }
        }
        for cache in [self.tlb.port, self.tlb.shared, self.tlb.top] {
            if cache.entries() == 0 || cache.ways > 0x100 || cache.sets > 0x1000 || cache.sublines > 0x10 {
                return Err(IommuError::InvalidConfig);
            }
        }
        Ok(())
    }

    /// VM context ids selected by `vmid_mask`.
    pub fn active_vms(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.vm_count).filter(move |vm| self.vmid_mask & (1 << vm) != 0)
    }

    /// Whether `iova` belongs to the secure window.
    pub fn is_secure_iova(&self, iova: u64) -> bool {
        self.secure_iova.as_ref().is_some_and(|w| w.contains(&iova))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec;
    use std::vec::Vec;

    #[test]
    fn test_default_is_valid() {
        assert_eq!(SmmuConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_active_vms_follow_mask() {
        let config = SmmuConfig {
            vm_count: 4,
            vmid_mask: 0b1010,
            ..Default::default()
        };
        assert_eq!(config.active_vms().collect::<Vec<_>>(), vec![1, 3]);
    }

    #[test]
    fn test_rejects_invalid_fields() {
        let bad = [
            SmmuConfig { vm_count: 0, ..Default::default() },
            SmmuConfig { vm_count: 9, vmid_mask: 1, ..Default::default() },
            SmmuConfig { vmid_mask: 0, ..Default::default() },
            SmmuConfig { vm_count: 2, vmid_mask: 0b100, ..Default::default() },
            SmmuConfig { qos_override: Some(0x10), ..Default::default() },
            SmmuConfig { port_count: 0, ..Default::default() },
            SmmuConfig { port_count: 33, ..Default::default() },
            SmmuConfig {
                stream_routes: vec![StreamRoute { index: 64, ..Default::default() }],
                ..Default::default()
            },
            SmmuConfig { secure_iova: Some(0x2000..0x1000), ..Default::default() },
        ];
        for config in &bad {
            assert_eq!(config.validate(), Err(IommuError::InvalidConfig), "{:?}", config);
        }
    }

    #[test]
    fn test_secure_window() {
        let config = SmmuConfig {
            secure_iova: Some(0x8000_0000..0x9000_0000),
            ..Default::default()
        };
        assert!(config.is_secure_iova(0x8000_0000));
        assert!(!config.is_secure_iova(0x9000_0000));
        assert!(!SmmuConfig::default().is_secure_iova(0));
    }
}
