//! The single `Diagnostics` value (§9): global mutable state represented
//! as one struct owned by the top-level runtime and passed by reference
//! into the subsystems that mutate it, instead of a web of back-pointers.

use std::collections::VecDeque;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Fault taxonomy observable at the Modbus response boundary (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Timeout,
    CrcMismatch,
    Malformed,
    ModbusException(u8),
    BufferOverflow,
    CorruptResponse,
}

impl FaultKind {
    /// Max retries and base backoff for this fault, per §4.3's table.
    /// `None` means not recoverable: fail the operation immediately.
    pub fn retry_policy(self) -> Option<(u32, Duration)> {
        match self {
            FaultKind::Timeout | FaultKind::CrcMismatch | FaultKind::Malformed => {
                Some((3, Duration::from_millis(100)))
            }
            FaultKind::ModbusException(0x06) | FaultKind::ModbusException(0x05) => {
                Some((2, Duration::from_millis(100)))
            }
            FaultKind::BufferOverflow | FaultKind::ModbusException(_) | FaultKind::CorruptResponse => None,
        }
    }
}

/// One entry in the circular fault log (§4.3): `(timestamp, type, slave,
/// function, addr, retry#)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultEvent {
    pub timestamp_ms: u64,
    pub kind: FaultKind,
    pub slave: u8,
    pub function: u8,
    pub addr: u16,
    pub retry: u32,
}

/// Emitted once an operation that needed retries finally succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recovered {
    pub after_retries: u32,
}

const FAULT_LOG_CAPACITY: usize = 100;

/// Circular in-memory fault log. Overflow policy: drop the oldest.
#[derive(Debug, Default)]
pub struct FaultLog {
    events: VecDeque<FaultEvent>,
}

impl FaultLog {
    pub fn push(&mut self, event: FaultEvent) {
        if self.events.len() == FAULT_LOG_CAPACITY {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    pub fn recent(&self) -> impl Iterator<Item = &FaultEvent> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// OTA outcome counters, persisted under `diag.counters` (§6.3, §4.7).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct OtaCounters {
    pub successes: u64,
    pub failures: u64,
    pub rollbacks: u64,
}

/// The process-wide diagnostics value. Owned by the agent binary, handed
/// by `&mut` to whichever component needs to record an event.
#[derive(Debug, Default)]
pub struct Diagnostics {
    pub fault_log: FaultLog,
    pub ota_counters: OtaCounters,
    pub recoveries: u64,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_fault(&mut self, kind: FaultKind, slave: u8, function: u8, addr: u16, retry: u32) {
        self.fault_log.push(FaultEvent {
            timestamp_ms: now_ms(),
            kind,
            slave,
            function,
            addr,
            retry,
        });
    }

    pub fn record_ota_success(&mut self) {
        self.ota_counters.successes += 1;
    }

    pub fn record_ota_failure(&mut self) {
        self.ota_counters.failures += 1;
    }

    pub fn record_ota_rollback(&mut self) {
        self.ota_counters.rollbacks += 1;
    }

    /// Emitted once when an operation that required retries finally
    /// succeeds (§4.3).
    pub fn record_recovered(&mut self, _event: Recovered) {
        self.recoveries += 1;
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
