//! Event trace ring.
//!
//! Fixed-size ring of recent driver events for post-mortem inspection. Each
//! event kind can be recorded into the ring, echoed to the log, both, or
//! neither.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use spin::Mutex;

use crate::irq;

/// Records kept before the oldest is overwritten.
pub const TRACE_CAPACITY: usize = 256;

const FLAG_RECORD: u8 = 1 << 0;
const FLAG_LOG: u8 = 1 << 1;

/// Traced event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TraceEvent {
    Alloc = 0,
    Free,
    Map,
    Unmap,
    Sync,
    Suspend,
    Resume,
    PowerOn,
    PowerOff,
    Fault,
}

impl TraceEvent {
    const COUNT: usize = 10;

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Alloc => "alloc",
            Self::Free => "free",
            Self::Map => "map",
            Self::Unmap => "unmap",
            Self::Sync => "sync",
            Self::Suspend => "suspend",
            Self::Resume => "resume",
            Self::PowerOn => "power_on",
            Self::PowerOff => "power_off",
            Self::Fault => "fault",
        }
    }
}

/// One ring entry. The meaning of the data words depends on the event
/// (e.g. domain id, iova, size for `Map`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceRecord {
    pub seq: u64,
    pub event: TraceEvent,
    pub data1: u64,
    pub data2: u64,
    pub data3: u64,
}

struct Ring {
    records: Vec<TraceRecord>,
    /// Next slot to overwrite once full.
    head: usize,
}

/// Driver-wide event trace.
pub struct EventTrace {
    enabled: AtomicBool,
    flags: [AtomicU8; TraceEvent::COUNT],
    seq: AtomicU64,
    ring: Mutex<Ring>,
}

impl EventTrace {
    /// Every event recorded, none logged.
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(true),
            flags: core::array::from_fn(|_| AtomicU8::new(FLAG_RECORD)),
            seq: AtomicU64::new(0),
            ring: Mutex::new(Ring {
                records: Vec::with_capacity(TRACE_CAPACITY),
                head: 0,
            }),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Choose whether `event` goes into the ring and/or the log.
    pub fn set_event(&self, event: TraceEvent, record: bool, log: bool) {
        let mut flags = 0;
        if record {
            flags |= FLAG_RECORD;
        }
        if log {
            flags |= FLAG_LOG;
        }
        self.flags[event as usize].store(flags, Ordering::Relaxed);
    }

    pub fn record(&self, event: TraceEvent, data1: u64, data2: u64, data3: u64) {
        if !self.is_enabled() {
            return;
        }
        let flags = self.flags[event as usize].load(Ordering::Relaxed);
        if flags & FLAG_LOG != 0 {
            klog!(
                Info,
                "[SMMU] trace {}: {:#x} {:#x} {:#x}",
                event.as_str(),
                data1,
                data2,
                data3
            );
        }
        if flags & FLAG_RECORD == 0 {
            return;
        }

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let entry = TraceRecord { seq, event, data1, data2, data3 };
        self.with_ring(|ring| {
            if ring.records.len() < TRACE_CAPACITY {
                ring.records.push(entry);
            } else {
                let head = ring.head;
                ring.records[head] = entry;
                ring.head = (head + 1) % TRACE_CAPACITY;
            }
        });
    }

    /// Records oldest first.
    pub fn snapshot(&self) -> Vec<TraceRecord> {
        self.with_ring(|ring| {
            let (newer, older) = ring.records.split_at(ring.head);
            older.iter().chain(newer.iter()).copied().collect()
        })
    }

    pub fn clear(&self) {
        self.with_ring(|ring| {
            ring.records.clear();
            ring.head = 0;
        });
    }

    /// The fault handler records into the ring, so it is locked with local
    /// interrupts masked.
    fn with_ring<R>(&self, f: impl FnOnce(&mut Ring) -> R) -> R {
        irq::without_interrupts(|| f(&mut *self.ring.lock()))
    }
}

impl Default for EventTrace {
    fn default() -> Self {
        Self::new()
    }
}
