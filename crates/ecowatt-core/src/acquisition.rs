//! Acquisition driver (C2, §4.2) — range-batched Modbus reads, single-
//! register writes with echo verification, all routed through the §4.3
//! retry policy.

use thiserror::Error;

use ecowatt_diagnostics::{Diagnostics, FaultKind, ModbusTransport, TransportError};

use crate::catalog::RegId;
use crate::fault::{Backoff, with_retry};
use crate::proto::{self, ParseError};

const SLAVE_ID: u8 = 0x11;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AcqError {
    #[error("transport timed out")]
    Timeout,
    #[error("CRC mismatch")]
    CrcMismatch,
    #[error("malformed response")]
    Malformed,
    #[error("Modbus exception {0:#04x}")]
    ModbusException(u8),
    #[error("write was not echoed correctly")]
    CorruptEcho,
    #[error("configuration value out of range")]
    ConfigInvalid,
}

impl From<FaultKind> for AcqError {
    fn from(kind: FaultKind) -> Self {
        match kind {
            FaultKind::Timeout => AcqError::Timeout,
            FaultKind::CrcMismatch => AcqError::CrcMismatch,
            FaultKind::Malformed | FaultKind::BufferOverflow => AcqError::Malformed,
            FaultKind::ModbusException(code) => AcqError::ModbusException(code),
            FaultKind::CorruptResponse => AcqError::CorruptEcho,
        }
    }
}

fn classify_parse_error(err: ParseError) -> FaultKind {
    match err {
        ParseError::TooShort | ParseError::BadOpcode(_) | ParseError::BadByteCount { .. } => {
            FaultKind::Malformed
        }
        ParseError::CrcMismatch { .. } => FaultKind::CrcMismatch,
        ParseError::ModbusException(code) => FaultKind::ModbusException(code),
    }
}

fn classify_transport_error(err: TransportError) -> FaultKind {
    match err {
        TransportError::Timeout => FaultKind::Timeout,
        TransportError::Unavailable(_) | TransportError::Status(_) => FaultKind::Malformed,
    }
}

/// Contiguous `(start, count)` address ranges folded from a sorted address
/// list (step 2 of §4.2's algorithm).
fn fold_into_ranges(mut addrs: Vec<u16>) -> Vec<(u16, u16)> {
    addrs.sort_unstable();
    addrs.dedup();
    let mut ranges = Vec::new();
    let mut iter = addrs.into_iter();
    if let Some(first) = iter.next() {
        let mut start = first;
        let mut count = 1u16;
        for addr in iter {
            if addr == start + count {
                count += 1;
            } else {
                ranges.push((start, count));
                start = addr;
                count = 1;
            }
        }
        ranges.push((start, count));
    }
    ranges
}

/// Poll a selection of registers, returning decoded values in the
/// caller's selection order (§4.2).
pub fn poll(
    transport: &mut impl ModbusTransport,
    diagnostics: &mut Diagnostics,
    backoff: &impl Backoff,
    selection: &[RegId],
) -> Result<Vec<u16>, AcqError> {
    let addrs: Vec<u16> = selection.iter().map(|id| id.addr()).collect();
    let ranges = fold_into_ranges(addrs.clone());

    let mut values_by_addr: std::collections::HashMap<u16, u16> = std::collections::HashMap::new();
    for (start, count) in ranges {
        let words = with_retry(diagnostics, backoff, SLAVE_ID, proto::FUNC_READ, start, || {
            let frame = proto::build_read(SLAVE_ID, start, count);
            let response = transport.send(&frame).map_err(classify_transport_error)?;
            proto::parse_read_response(&response, count).map_err(classify_parse_error)
        })?;
        for (offset, value) in words.into_iter().enumerate() {
            values_by_addr.insert(start + offset as u16, value);
        }
    }

    Ok(addrs.iter().map(|addr| values_by_addr[addr]).collect())
}

/// Set the inverter's export power percentage. `pct` out of `[0, 100]` is
/// a configuration error, not a Modbus exception, and emits no frame
/// (§4.2, §8).
pub fn set_power_percent(
    transport: &mut impl ModbusTransport,
    diagnostics: &mut Diagnostics,
    backoff: &impl Backoff,
    pct: u8,
) -> Result<(), AcqError> {
    if pct > 100 {
        return Err(AcqError::ConfigInvalid);
    }

    let addr = RegId::ExportPct.addr();
    with_retry(diagnostics, backoff, SLAVE_ID, proto::FUNC_WRITE_SINGLE, addr, || {
        let request = proto::build_write_single(SLAVE_ID, addr, u16::from(pct));
        let echo = transport.send(&request).map_err(classify_transport_error)?;
        if echo == request {
            Ok(())
        } else {
            Err(FaultKind::CorruptResponse)
        }
    })
    .map_err(AcqError::from)
}
