//! Power transitions.
//!
//! Logical attachment and hardware power are tracked independently. Domain
//! contents live in normal memory and survive any power cycle; registers do
//! not, so every power-up of an attached instance replays the full enable
//! sequence.

use core::fmt;

use crate::instance::SmmuInstance;

/// Combined attachment and power state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Detached,
    AttachedPoweredOff,
    AttachedPoweredOn,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Detached => "detached",
            Self::AttachedPoweredOff => "attached, power off",
            Self::AttachedPoweredOn => "attached, power on",
        })
    }
}

impl SmmuInstance {
    pub fn power_state(&self) -> PowerState {
        self.with_state(|state| match (state.is_attached(), state.powered) {
            (false, _) => PowerState::Detached,
            (true, false) => PowerState::AttachedPoweredOff,
            (true, true) => PowerState::AttachedPoweredOn,
        })
    }

    pub fn is_powered(&self) -> bool {
        self.with_state(|state| state.powered)
    }

    /// Prepare for power to be cut.
    ///
    /// An attached unit is fully invalidated and then disabled; its recorded
    /// table base is kept for the next [`resume`](Self::resume).
    pub fn suspend(&self) {
        self.with_state(|state| {
            if !state.powered {
                return;
            }
            if state.is_attached() {
                self.flush_all_locked(state);
                self.disable_locked(state);
            }
            state.powered = false;
        });
        klog!(Debug, "[SMMU:{}] suspended", self.name());
    }

    /// Power has been restored: replay the enable sequence if attached.
    pub fn resume(&self) {
        self.with_state(|state| {
            if state.powered {
                return;
            }
            state.powered = true;
            if state.is_attached() {
                self.program_and_enable_locked(state);
            }
        });
        klog!(Debug, "[SMMU:{}] resumed", self.name());
    }
}
