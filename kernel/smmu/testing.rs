//! Test doubles shared by the unit tests.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;

use crate::fault::{FaultListener, FaultRecord, FaultResponse};
use crate::pool::CacheMaintenance;
use crate::regs::{self, RegisterAccess};
use crate::DeviceId;

#[derive(Default)]
struct MockState {
    values: BTreeMap<usize, u32>,
    writes: Vec<(usize, u32)>,
    /// Dump selector -> (tag, data).
    tlb: BTreeMap<u32, (u32, u32)>,
}

/// Register file that remembers values and logs writes.
///
/// Writing `DUMP_SEL` latches `DUMP_TAG`/`DUMP_DATA` from the loaded TLB
/// lines, and writing `FAULT_CLEAR` clears `FAULT_STATUS`.
#[derive(Default)]
pub struct MockRegisters {
    state: Mutex<MockState>,
}

impl MockRegisters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value, without logging.
    pub fn get(&self, offset: usize) -> u32 {
        self.state.lock().values.get(&offset).copied().unwrap_or(0)
    }

    /// Set a value as the hardware would, without logging a write.
    pub fn set(&self, offset: usize, value: u32) {
        self.state.lock().values.insert(offset, value);
    }

    pub fn writes(&self) -> Vec<(usize, u32)> {
        self.state.lock().writes.clone()
    }

    pub fn writes_to(&self, offset: usize) -> Vec<u32> {
        self.state
            .lock()
            .writes
            .iter()
            .filter(|&&(off, _)| off == offset)
            .map(|&(_, value)| value)
            .collect()
    }

    pub fn clear_log(&self) {
        self.state.lock().writes.clear();
    }

    /// Make one cache line readable through the dump window.
    pub fn load_tlb(&self, selector: u32, tag: u32, data: u32) {
        self.state.lock().tlb.insert(selector, (tag, data));
    }

    /// Latch a pending fault.
    pub fn raise_fault(&self, status: u32, addr: u32, info: u32) {
        let mut state = self.state.lock();
        state.values.insert(regs::FAULT_STATUS, status);
        state.values.insert(regs::FAULT_ADDR, addr);
        state.values.insert(regs::FAULT_INFO, info);
    }
}

impl RegisterAccess for MockRegisters {
    fn read(&self, offset: usize) -> u32 {
        self.get(offset)
    }

    fn write(&self, offset: usize, value: u32) {
        let mut state = self.state.lock();
        state.writes.push((offset, value));
        state.values.insert(offset, value);
        match offset {
            regs::DUMP_SEL => {
                let (tag, data) = state.tlb.get(&value).copied().unwrap_or((0, 0));
                state.values.insert(regs::DUMP_TAG, tag);
                state.values.insert(regs::DUMP_DATA, data);
            }
            regs::FAULT_CLEAR => {
                state.values.insert(regs::FAULT_STATUS, 0);
            }
            _ => {}
        }
    }
}

/// Counts cache maintenance calls.
#[derive(Default)]
pub struct CountingCache {
    calls: AtomicUsize,
    bytes: AtomicUsize,
}

impl CountingCache {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }
}

impl CacheMaintenance for CountingCache {
    fn clean_range(&self, _phys: u64, len: usize) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(len, Ordering::Relaxed);
    }
}

/// Listener that records every report and answers with a fixed response.
pub struct RecordingListener {
    pub response: FaultResponse,
    pub reports: Mutex<Vec<(Option<DeviceId>, FaultRecord)>>,
}

impl RecordingListener {
    pub fn new(response: FaultResponse) -> Self {
        Self {
            response,
            reports: Mutex::new(Vec::new()),
        }
    }
}

impl FaultListener for RecordingListener {
    fn report_device_fault(&self, device: Option<DeviceId>, fault: &FaultRecord) -> FaultResponse {
        self.reports.lock().push((device, *fault));
        self.response
    }
}
