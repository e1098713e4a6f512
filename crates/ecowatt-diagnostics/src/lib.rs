//! Shared runtime state and the external-collaborator trait boundaries for
//! the EcoWatt device agent.
//!
//! Avoids two recurring anti-patterns from the original firmware: cyclic
//! helper graphs and scattered global mutable state. This crate is the fix
//! for the latter — one `Diagnostics` value, owned by the top-level runtime
//! and passed by reference into the subsystems that mutate it — plus the trait
//! boundaries (`KvStore`, `HttpTransport`, `ModbusTransport`,
//! `PartitionWriter`) that keep every external collaborator out of the
//! crates that implement the actual protocol/compression/security/OTA
//! logic.

mod diagnostics;
mod scheduler;
mod traits;

pub use diagnostics::{Diagnostics, FaultEvent, FaultKind, FaultLog, OtaCounters, Recovered};
pub use scheduler::{Clock, Scheduler, SystemClock, Task, VirtualClock};
pub use traits::{HttpTransport, KvStore, ModbusTransport, PartitionWriter, StoreError, TransportError};
