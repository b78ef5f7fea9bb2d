//! Connection configuration from the environment

use crate::error::DeviceError;
use dps_protocol::transport::{DEFAULT_BAUD_RATE, DEFAULT_TIMEOUT};
use dps_protocol::Endpoint;
use std::str::FromStr;
use std::time::Duration;

/// Read timeout for upgrade-start; the device reboots into its bootloader first
pub const DEFAULT_UPGRADE_TIMEOUT: Duration = Duration::from_secs(5);

/// How to reach a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Interface selector: serial path, IPv4 address or `tcp:<host>[:port]`
    pub interface: Option<String>,
    pub baud_rate: u32,
    pub timeout: Duration,
    pub upgrade_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            interface: None,
            baud_rate: DEFAULT_BAUD_RATE,
            timeout: DEFAULT_TIMEOUT,
            upgrade_timeout: DEFAULT_UPGRADE_TIMEOUT,
        }
    }
}

impl ConnectionConfig {
    /// Read `DPSIF`, `DPS_BAUD`, `DPS_TIMEOUT_MS` and `DPS_UPGRADE_TIMEOUT_MS`
    pub fn from_env() -> Result<Self, DeviceError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, DeviceError> {
        let defaults = Self::default();
        let interface = lookup("DPSIF").filter(|v| !v.trim().is_empty());
        let baud_rate = parse_var(&lookup, "DPS_BAUD", defaults.baud_rate)?;
        let timeout_ms = parse_var(
            &lookup,
            "DPS_TIMEOUT_MS",
            defaults.timeout.as_millis() as u64,
        )?;
        let upgrade_timeout_ms = parse_var(
            &lookup,
            "DPS_UPGRADE_TIMEOUT_MS",
            defaults.upgrade_timeout.as_millis() as u64,
        )?;

        Ok(Self {
            interface,
            baud_rate,
            timeout: Duration::from_millis(timeout_ms),
            upgrade_timeout: Duration::from_millis(upgrade_timeout_ms),
        })
    }

    /// Replace the interface when one was given explicitly
    #[must_use]
    pub fn with_interface(mut self, interface: Option<String>) -> Self {
        if let Some(interface) = interface.filter(|v| !v.trim().is_empty()) {
            self.interface = Some(interface);
        }
        self
    }

    /// Resolve the interface selector to an endpoint
    pub fn endpoint(&self) -> Result<Endpoint, DeviceError> {
        let interface = self
            .interface
            .as_deref()
            .ok_or_else(|| DeviceError::Config("no comms interface specified".to_string()))?;
        Ok(Endpoint::parse(interface, self.baud_rate)?)
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, DeviceError> {
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| DeviceError::Config(format!("{key} has invalid value '{value}'"))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ConnectionConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, ConnectionConfig::default());
        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.timeout, Duration::from_millis(1000));
    }

    #[test]
    fn test_from_vars() {
        let config = ConnectionConfig::from_lookup(lookup(&[
            ("DPSIF", "/dev/ttyUSB1"),
            ("DPS_BAUD", "115200"),
            ("DPS_TIMEOUT_MS", "250"),
            ("DPS_UPGRADE_TIMEOUT_MS", "8000"),
        ]))
        .unwrap();
        assert_eq!(config.interface.as_deref(), Some("/dev/ttyUSB1"));
        assert_eq!(config.baud_rate, 115_200);
        assert_eq!(config.timeout, Duration::from_millis(250));
        assert_eq!(config.upgrade_timeout, Duration::from_secs(8));
    }

    #[test]
    fn test_invalid_number() {
        assert!(matches!(
            ConnectionConfig::from_lookup(lookup(&[("DPS_BAUD", "fast")])),
            Err(DeviceError::Config(_))
        ));
    }

    #[test]
    fn test_interface_override() {
        let config = ConnectionConfig::from_lookup(lookup(&[("DPSIF", "10.0.0.2")]))
            .unwrap()
            .with_interface(Some("tcp:10.0.0.3".into()));
        assert_eq!(
            config.endpoint().unwrap(),
            Endpoint::Tcp {
                host: "10.0.0.3".into(),
                port: 5005
            }
        );

        let config = config.with_interface(Some(String::new()));
        assert_eq!(config.interface.as_deref(), Some("tcp:10.0.0.3"));
    }

    #[test]
    fn test_missing_interface() {
        let config = ConnectionConfig::from_lookup(lookup(&[("DPSIF", "")])).unwrap();
        assert!(matches!(config.endpoint(), Err(DeviceError::Config(_))));
    }
}
