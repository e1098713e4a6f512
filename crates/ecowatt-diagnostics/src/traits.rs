//! External collaborator boundaries.
//!
//! None of these are implemented here — the NVS, the HTTP client, and the
//! dual-partition flash writer are all out of scope. Components are generic
//! over these traits so production code and tests share the same call
//! sites; only the injected implementation differs.

use thiserror::Error;

/// Failure modes for anything that crosses a suspension point (§5): a
/// Modbus round-trip, an upload POST, an OTA chunk GET.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("operation timed out")]
    Timeout,
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    #[error("server returned an error status: {0}")]
    Status(u16),
}

/// Key/value persistence boundary (§6.3). Each write is atomic at the
/// store's own granularity; callers never assume partial writes.
pub trait KvStore {
    fn get(&self, key: &str) -> Option<Vec<u8>>;
    fn put(&mut self, key: &str, value: &[u8]) -> Result<(), StoreError>;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store busy")]
    StoreBusy,
    #[error("store full")]
    StoreFull,
    #[error("store corrupt")]
    StoreCorrupt,
}

/// A Modbus-RTU transport: hands a raw frame to the gateway and returns its
/// raw response frame, or a transport-level failure. CRC/opcode validation
/// happens above this boundary, in `ecowatt-core::acquisition`.
pub trait ModbusTransport {
    fn send(&mut self, frame: &[u8]) -> Result<Vec<u8>, TransportError>;
}

/// Generic HTTP-ish transport for the backend endpoints of §6.2. Bodies are
/// opaque byte strings; JSON framing is the caller's concern.
pub trait HttpTransport {
    fn get(&mut self, path: &str) -> Result<Vec<u8>, TransportError>;
    fn post(&mut self, path: &str, body: &[u8]) -> Result<Vec<u8>, TransportError>;
}

/// The dual-partition OTA write target (§4.7). `write_chunk` is always
/// called with strictly increasing, contiguous offsets. `read_back` lets
/// the verification step hash the assembled image without keeping a
/// second copy in RAM across a resume — the partition itself is the
/// durable copy, surviving a crash the way an in-memory buffer wouldn't.
pub trait PartitionWriter {
    fn write_chunk(&mut self, offset: u32, bytes: &[u8]) -> Result<(), TransportError>;
    fn read_back(&self) -> Vec<u8>;
    fn mark_boot_target(&mut self) -> Result<(), TransportError>;
    fn mark_valid(&mut self) -> Result<(), TransportError>;
    fn rollback(&mut self) -> Result<(), TransportError>;
}
