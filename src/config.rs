use crate::address::DeviceAddress;
use crate::command::MAX_SCRATCHPAD_LEN;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

const DEFAULT_BUS_NAME: &str = "sim0";
const DEFAULT_FAULT_SEED: u64 = 0x1234_5678_9ABC_DEF0;

/// Configuration of a simulated bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimBusConfig {
    pub name: String,
    /// Added to every bus operation.
    pub latency_ms: u64,
    pub devices: Vec<SimDeviceConfig>,
    pub faults: SimFaultConfig,
}

impl Default for SimBusConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_BUS_NAME.to_string(),
            latency_ms: 0,
            devices: Vec::new(),
            faults: SimFaultConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimDeviceConfig {
    pub address: DeviceAddress,
    #[serde(default)]
    pub alarm: bool,
    #[serde(default = "default_externally_powered")]
    pub externally_powered: bool,
    #[serde(default)]
    pub scratchpad: Vec<u8>,
    #[serde(default)]
    pub faulty: bool,
}

fn default_externally_powered() -> bool {
    true
}

/// Random communication errors, reproducible from `seed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimFaultConfig {
    pub enabled: bool,
    pub communication_error_rate_percent: f32,
    pub seed: u64,
}

impl Default for SimFaultConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            communication_error_rate_percent: 0.0,
            seed: DEFAULT_FAULT_SEED,
        }
    }
}

impl SimBusConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Invalid("bus name is empty".to_string()));
        }

        let rate = self.faults.communication_error_rate_percent;
        if !(0.0..=100.0).contains(&rate) {
            return Err(ConfigError::Invalid(format!(
                "communication error rate {rate} outside 0..=100"
            )));
        }

        let mut seen = HashSet::new();
        for device in &self.devices {
            if !device.address.is_crc_valid() {
                return Err(ConfigError::Invalid(format!(
                    "device {} has a bad CRC",
                    device.address
                )));
            }
            if !seen.insert(device.address) {
                return Err(ConfigError::Invalid(format!(
                    "device {} listed twice",
                    device.address
                )));
            }
            if device.scratchpad.len() > MAX_SCRATCHPAD_LEN {
                return Err(ConfigError::Invalid(format!(
                    "device {} scratchpad longer than {MAX_SCRATCHPAD_LEN} bytes",
                    device.address
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_json_uses_defaults() {
        let config = SimBusConfig::from_json_str("{}").unwrap();
        assert_eq!(config, SimBusConfig::default());
        assert_eq!(config.name, "sim0");
        assert!(!config.faults.enabled);
    }

    #[test]
    fn test_devices_parse_with_defaults() {
        let address = DeviceAddress::new(0x28, 1);
        let json = format!(
            r#"{{ "name": "lab", "devices": [ {{ "address": "{address}", "alarm": true }} ] }}"#
        );
        let config = SimBusConfig::from_json_str(&json).unwrap();

        assert_eq!(config.name, "lab");
        assert_eq!(config.devices.len(), 1);
        assert!(config.devices[0].alarm);
        assert!(config.devices[0].externally_powered);
        assert!(config.devices[0].scratchpad.is_empty());
    }

    #[test]
    fn test_duplicate_device_rejected() {
        let address = DeviceAddress::new(0x28, 1);
        let json = format!(
            r#"{{ "devices": [ {{ "address": "{address}" }}, {{ "address": "{address}" }} ] }}"#
        );
        assert!(matches!(
            SimBusConfig::from_json_str(&json),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_bad_crc_rejected() {
        let json = r#"{ "devices": [ { "address": "0000000000000028" } ] }"#;
        assert!(matches!(
            SimBusConfig::from_json_str(json),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_bad_rate_rejected() {
        let json = r#"{ "faults": { "enabled": true, "communication_error_rate_percent": 150.0 } }"#;
        assert!(matches!(
            SimBusConfig::from_json_str(json),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_malformed_json_reported() {
        assert!(matches!(
            SimBusConfig::from_json_str("{ not json"),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "name": "file-bus", "latency_ms": 5 }}"#).unwrap();

        let config = SimBusConfig::from_file(file.path()).unwrap();
        assert_eq!(config.name, "file-bus");
        assert_eq!(config.latency_ms, 5);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        assert!(matches!(
            SimBusConfig::from_file("/nonexistent/owbus.json"),
            Err(ConfigError::Io(_))
        ));
    }
}
