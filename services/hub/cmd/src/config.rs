//! Configuration handling for the hub.
//!
//! Values come from a YAML file, then `MESHHUB_*` environment variables,
//! then command line flags, each layer overriding the previous one.

use anyhow::Result;
use hub_circuit::CircuitConfig;
use hub_procedures::{DiscoveryConfig, DEFAULT_SCAN_WAIT};
use hub_session::{SerialConfig, SessionConfig, DEFAULT_BAUD_RATE, DEFAULT_SERIAL_PORT};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Hub configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Coordinator device
    pub serial: SerialSection,
    /// Where the network graph is persisted
    pub graph_path: PathBuf,
    /// Request queue timing
    pub session: SessionSection,
    /// Virtual circuits and listeners
    pub circuits: CircuitSection,
    /// Discovery timing
    pub discovery: DiscoverySection,
    /// Seconds between statistics reports
    pub stats_interval_secs: u64,
}

/// Serial settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSection {
    /// Device path
    pub port: String,
    /// Line speed
    pub baud_rate: u32,
}

/// Session settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// Reply deadline in milliseconds
    pub reply_timeout_ms: u64,
    /// Pause after frames without reply, in milliseconds
    pub write_guard_ms: u64,
}

/// Circuit settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitSection {
    /// Open to OpenAck deadline in milliseconds
    pub handshake_timeout_ms: u64,
    /// Largest SendData payload
    pub chunk_size: usize,
    /// Node API port
    pub node_port: u16,
    /// `dynamic` or a fixed IP address
    pub bind_address: String,
    /// First port on a fixed address
    pub base_port_offset: u16,
    /// Ports available on a fixed address
    pub port_pool_size: u32,
}

/// Discovery settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySection {
    /// Scan duration in milliseconds
    pub scan_wait_ms: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            serial: SerialSection::default(),
            graph_path: PathBuf::from("meshmesh.json"),
            session: SessionSection::default(),
            circuits: CircuitSection::default(),
            discovery: DiscoverySection::default(),
            stats_interval_secs: 60,
        }
    }
}

impl Default for SerialSection {
    fn default() -> Self {
        Self {
            port: DEFAULT_SERIAL_PORT.to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

impl Default for SessionSection {
    fn default() -> Self {
        let defaults = SessionConfig::default();
        Self {
            reply_timeout_ms: defaults.reply_timeout.as_millis() as u64,
            write_guard_ms: defaults.write_guard.as_millis() as u64,
        }
    }
}

impl Default for CircuitSection {
    fn default() -> Self {
        let defaults = CircuitConfig::default();
        Self {
            handshake_timeout_ms: defaults.handshake_timeout.as_millis() as u64,
            chunk_size: defaults.chunk_size,
            node_port: defaults.node_port,
            bind_address: defaults.bind_address,
            base_port_offset: defaults.base_port_offset,
            port_pool_size: defaults.port_pool_size,
        }
    }
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            scan_wait_ms: DEFAULT_SCAN_WAIT.as_millis() as u64,
        }
    }
}

impl HubConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => match serde_yaml::from_str::<HubConfig>(&content) {
                Ok(config) => {
                    info!("Loaded configuration from {:?}", path);
                    config
                }
                Err(e) => {
                    warn!("Failed to parse config file {:?} ({}), using defaults", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok());

        info!(
            "Final hub configuration: serial={}@{}, graph={:?}, bind={}",
            config.serial.port,
            config.serial.baud_rate,
            config.graph_path,
            config.circuits.bind_address
        );
        Ok(config)
    }

    /// Apply `MESHHUB_*` overrides looked up through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("MESHHUB_SERIAL_PORT") {
            info!("Serial port overridden by environment: {}", port);
            self.serial.port = port;
        }

        if let Some(baud) = lookup("MESHHUB_BAUD_RATE") {
            match baud.parse::<u32>() {
                Ok(baud) => {
                    self.serial.baud_rate = baud;
                    info!("Baud rate overridden by environment: {}", baud);
                }
                Err(_) => warn!("Ignoring invalid MESHHUB_BAUD_RATE {:?}", baud),
            }
        }

        if let Some(path) = lookup("MESHHUB_GRAPH_PATH") {
            info!("Graph path overridden by environment: {}", path);
            self.graph_path = PathBuf::from(path);
        }

        if let Some(address) = lookup("MESHHUB_BIND_ADDRESS") {
            info!("Bind address overridden by environment: {}", address);
            self.circuits.bind_address = address;
        }
    }

    /// Serial transport settings
    pub fn serial_config(&self) -> SerialConfig {
        SerialConfig {
            port: self.serial.port.clone(),
            baud_rate: self.serial.baud_rate,
        }
    }

    /// Session manager settings
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            reply_timeout: Duration::from_millis(self.session.reply_timeout_ms),
            write_guard: Duration::from_millis(self.session.write_guard_ms),
            ..SessionConfig::default()
        }
    }

    /// Circuit manager and listener settings
    pub fn circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            handshake_timeout: Duration::from_millis(self.circuits.handshake_timeout_ms),
            chunk_size: self.circuits.chunk_size,
            node_port: self.circuits.node_port,
            bind_address: self.circuits.bind_address.clone(),
            base_port_offset: self.circuits.base_port_offset,
            port_pool_size: self.circuits.port_pool_size,
        }
    }

    /// Discovery settings
    pub fn discovery_config(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            scan_wait: Duration::from_millis(self.discovery.scan_wait_ms),
            ..DiscoveryConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = HubConfig::default();
        assert_eq!(config.serial.port, "/dev/ttyUSB0");
        assert_eq!(config.serial.baud_rate, 460_800);
        assert_eq!(config.graph_path, PathBuf::from("meshmesh.json"));
        assert_eq!(config.session.reply_timeout_ms, 500);
        assert_eq!(config.session.write_guard_ms, 50);
        assert_eq!(config.circuits.handshake_timeout_ms, 3000);
        assert_eq!(config.circuits.chunk_size, 512);
        assert_eq!(config.circuits.node_port, 6053);
        assert_eq!(config.circuits.bind_address, "dynamic");
        assert_eq!(config.circuits.base_port_offset, 20000);
        assert_eq!(config.circuits.port_pool_size, 10000);
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
serial:
  port: /dev/ttyACM1
graph_path: /var/lib/meshhub/graph.json
circuits:
  bind_address: 0.0.0.0
  handshake_timeout_ms: 5000
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let mut config = HubConfig::default();
        let content = std::fs::read_to_string(temp_file.path()).unwrap();
        config = serde_yaml::from_str::<HubConfig>(&content).unwrap_or(config);

        assert_eq!(config.serial.port, "/dev/ttyACM1");
        assert_eq!(config.serial.baud_rate, 460_800);
        assert_eq!(config.graph_path, PathBuf::from("/var/lib/meshhub/graph.json"));
        assert_eq!(config.circuits.bind_address, "0.0.0.0");
        assert_eq!(
            config.circuit_config().handshake_timeout,
            Duration::from_millis(5000)
        );
        assert_eq!(config.circuits.chunk_size, 512);
    }

    #[test]
    fn test_unparsable_file_falls_back() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"serial: [not, a, map").unwrap();
        let config = HubConfig::load_from_file(temp_file.path()).unwrap();
        assert_eq!(config.circuits, HubConfig::default().circuits);
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("MESHHUB_SERIAL_PORT", "/dev/ttyS3"),
            ("MESHHUB_BAUD_RATE", "115200"),
            ("MESHHUB_GRAPH_PATH", "other.json"),
            ("MESHHUB_BIND_ADDRESS", "127.0.0.1"),
        ]
        .into_iter()
        .collect();

        let mut config = HubConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.serial.port, "/dev/ttyS3");
        assert_eq!(config.serial.baud_rate, 115_200);
        assert_eq!(config.graph_path, PathBuf::from("other.json"));
        assert_eq!(config.circuit_config().bind_address, "127.0.0.1");

        config.apply_overrides(|key| (key == "MESHHUB_BAUD_RATE").then(|| "fast".to_string()));
        assert_eq!(config.serial.baud_rate, 115_200);
    }
}
