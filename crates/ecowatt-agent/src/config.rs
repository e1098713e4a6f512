//! Device configuration (§6.2's `new_config` shape, §6.3's `config.active`
//! persisted layout).

use std::path::Path;
use std::time::Duration;

use ecowatt_core::catalog::RegId;

/// Periods and register selection the scheduler/acquisition driver run
/// with. Any field can be overridden at runtime by a backend config push
/// (§4.8's "independent period updatable at runtime").
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AgentConfig {
    pub device_id: String,
    pub poll_period_us: u64,
    pub upload_period_us: u64,
    pub config_period_us: u64,
    pub ota_period_us: u64,
    pub active_registers: Vec<RegId>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            device_id: "ecowatt-0001".to_string(),
            poll_period_us: 5_000_000,
            upload_period_us: 60_000_000,
            config_period_us: 300_000_000,
            ota_period_us: 3_600_000_000,
            active_registers: vec![
                RegId::Vac1,
                RegId::Iac1,
                RegId::Fac1,
                RegId::Vpv1,
                RegId::Vpv2,
                RegId::Ipv1,
                RegId::Ipv2,
                RegId::Temp,
                RegId::Pac,
            ],
        }
    }
}

impl AgentConfig {
    pub fn load_or_default(path: &Path) -> Result<Self, std::io::Error> {
        match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(std::io::Error::other),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err),
        }
    }

    pub fn poll_period(&self) -> Duration {
        Duration::from_micros(self.poll_period_us)
    }

    pub fn upload_period(&self) -> Duration {
        Duration::from_micros(self.upload_period_us)
    }

    pub fn config_period(&self) -> Duration {
        Duration::from_micros(self.config_period_us)
    }

    pub fn ota_period(&self) -> Duration {
        Duration::from_micros(self.ota_period_us)
    }
}

/// The shape of `GET /config/<device_id>/check`'s `new_config` field.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct NewConfig {
    pub poll_period_us: u64,
    pub upload_period_us: u64,
    pub active_registers: Vec<RegId>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConfigCheckResponse {
    pub config_changed: bool,
    pub new_config: Option<NewConfig>,
}
