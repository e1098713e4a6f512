//! Stand-ins for the gateway/backend HTTP transports (§4.11, §6.1, §6.2),
//! which are out of scope. These simulate a solar inverter and a backend
//! that never has a command, config change, or update waiting, so the
//! cooperative loop has something real to drive every tick without a
//! network.

use std::collections::HashMap;

use ecowatt_core::proto::{self, FUNC_READ, FUNC_WRITE_SINGLE};
use ecowatt_diagnostics::{HttpTransport, ModbusTransport, TransportError};

/// A Modbus-RTU gateway fronting a synthetic inverter. Reads return
/// slowly drifting plausible values; writes to `EXPORT_PCT` are accepted
/// and echoed.
pub struct SimulatedGateway {
    registers: HashMap<u16, u16>,
    tick: u16,
}

impl Default for SimulatedGateway {
    fn default() -> Self {
        let registers = HashMap::from([
            (0, 2300), // Vac1
            (1, 150),  // Iac1
            (2, 500),  // Fac1
            (3, 4100), // Vpv1
            (4, 4050), // Vpv2
            (5, 80),   // Ipv1
            (6, 78),   // Ipv2
            (7, 350),  // Temp
            (8, 100),  // Export%
            (9, 3450), // Pac
        ]);
        Self { registers, tick: 0 }
    }
}

impl ModbusTransport for SimulatedGateway {
    fn send(&mut self, frame: &[u8]) -> Result<Vec<u8>, TransportError> {
        if frame.len() != 8 {
            return Err(TransportError::Unavailable("malformed request frame".into()));
        }
        let func = frame[1];
        let addr = u16::from_be_bytes([frame[2], frame[3]]);

        match func {
            FUNC_READ => {
                let count = u16::from_be_bytes([frame[4], frame[5]]);
                self.tick = self.tick.wrapping_add(1);
                let mut body = vec![frame[0], FUNC_READ, (count * 2) as u8];
                for offset in 0..count {
                    let base = *self.registers.get(&(addr + offset)).unwrap_or(&0);
                    let drift = self.tick % 5;
                    body.extend_from_slice(&base.wrapping_add(drift).to_be_bytes());
                }
                let crc = proto::crc16_modbus(&body);
                body.push((crc & 0xFF) as u8);
                body.push((crc >> 8) as u8);
                Ok(body)
            }
            FUNC_WRITE_SINGLE => {
                let value = u16::from_be_bytes([frame[4], frame[5]]);
                self.registers.insert(addr, value);
                Ok(frame.to_vec())
            }
            _ => Err(TransportError::Status(1)),
        }
    }
}

/// A backend that never has a pending command, config change, or update.
/// Uploads are unconditionally accepted.
#[derive(Debug, Default)]
pub struct SimulatedBackend;

impl HttpTransport for SimulatedBackend {
    fn get(&mut self, path: &str) -> Result<Vec<u8>, TransportError> {
        if path.contains("/commands/") {
            Ok(b"{}".to_vec())
        } else if path.contains("/config/") {
            Ok(br#"{"config_changed":false,"new_config":null}"#.to_vec())
        } else if path.contains("/ota/check/") {
            Ok(br#"{"update_available":false,"update_info":null}"#.to_vec())
        } else {
            Err(TransportError::Status(404))
        }
    }

    fn post(&mut self, _path: &str, _body: &[u8]) -> Result<Vec<u8>, TransportError> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_then_write_round_trips() {
        let mut gateway = SimulatedGateway::default();
        let request = proto::build_read(0x11, 0, 2);
        let response = gateway.send(&request).unwrap();
        let values = proto::parse_read_response(&response, 2).unwrap();
        assert_eq!(values.len(), 2);

        let write = proto::build_write_single(0x11, 8, 42);
        let echo = gateway.send(&write).unwrap();
        assert_eq!(echo, write);
    }

    #[test]
    fn backend_reports_nothing_pending() {
        let mut backend = SimulatedBackend;
        let body = backend.get("/config/ecowatt-0001/check").unwrap();
        assert!(String::from_utf8(body).unwrap().contains("\"config_changed\":false"));
    }
}
