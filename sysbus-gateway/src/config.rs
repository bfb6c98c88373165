//! Configuration for the SysBus gateway.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use sysbus_common::LoggingConfig;
use thiserror::Error;

use crate::codec::MAX_READ_COUNT;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] sysbus_common::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Bus connection and timing
    pub bus: BusConfig,

    /// Register mapping table
    #[serde(default)]
    pub registers: Vec<RegisterConfig>,

    /// Ranges read on every poll cycle, in order
    #[serde(default)]
    pub poll_plan: Vec<PollRangeConfig>,

    /// Registers served together as one resource
    #[serde(default)]
    pub groups: Vec<GroupConfig>,

    /// Persistent register store
    #[serde(default)]
    pub store: StoreConfig,

    /// HTTP API
    #[serde(default)]
    pub http: HttpConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Bus settings shared by every transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Connection type and address
    pub connection: ConnectionConfig,

    /// Slave ids on the bus (one or two); the first is the default target
    #[serde(default = "default_slave_ids")]
    pub slave_ids: Vec<u8>,

    /// Idle time between poll cycles in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Response timeout per attempt in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Extra attempts after the first one fails
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_slave_ids() -> Vec<u8> {
    vec![240]
}

fn default_poll_interval() -> u64 {
    10
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_max_retries() -> u32 {
    3
}

impl BusConfig {
    /// Slave addressed when a register or range does not name one.
    pub fn primary_slave(&self) -> u8 {
        self.slave_ids.first().copied().unwrap_or(240)
    }

    /// Resolve an optional per-entry slave id.
    pub fn resolve_slave(&self, slave: Option<u8>) -> u8 {
        slave.unwrap_or_else(|| self.primary_slave())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Connection configuration (TCP, RTU or simulated).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConnectionConfig {
    /// RTU frames over a TCP socket (serial device server)
    Tcp {
        /// Host address (IP or hostname)
        host: String,
        /// TCP port (default: 502)
        #[serde(default = "default_modbus_port")]
        port: u16,
    },
    /// RTU over a local serial line
    Rtu {
        /// Serial port path (e.g., "/dev/ttyUSB0" or "COM1")
        port: String,
        /// Baud rate (default: 9600)
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        /// Data bits (default: 8)
        #[serde(default = "default_data_bits")]
        data_bits: u8,
        /// Parity: "none", "even", or "odd" (default: "none")
        #[serde(default = "default_parity")]
        parity: String,
        /// Stop bits: 1 or 2 (default: 1)
        #[serde(default = "default_stop_bits")]
        stop_bits: u8,
    },
    /// In-process simulated controller (demo mode)
    Simulated,
}

fn default_modbus_port() -> u16 {
    502
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_parity() -> String {
    "none".to_string()
}

fn default_stop_bits() -> u8 {
    1
}

/// Register address spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Space {
    /// Input registers (read-only, 16-bit)
    Input,
    /// Holding registers (read/write, 16-bit)
    Holding,
}

impl Space {
    /// Return the string name for this space.
    pub fn as_str(&self) -> &'static str {
        match self {
            Space::Input => "input",
            Space::Holding => "holding",
        }
    }

    /// Whether the API may write registers in this space.
    pub fn is_writable(&self) -> bool {
        matches!(self, Space::Holding)
    }
}

impl std::fmt::Display for Space {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Space {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "input" => Ok(Space::Input),
            "holding" => Ok(Space::Holding),
            other => Err(ConfigError::Validation(format!(
                "unknown register space '{}' (use input or holding)",
                other
            ))),
        }
    }
}

/// Interpretation of a 16-bit register word.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// Unsigned 16-bit integer (default)
    #[default]
    U16,
    /// Signed 16-bit integer
    I16,
    /// KNX DPT 9.001 two-byte float (temperatures, setpoints)
    Dpt9001,
}

/// One entry of the register mapping table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterConfig {
    /// Semantic name, e.g. "zone_1_1_setpoint"
    pub name: String,

    /// Address space
    pub space: Space,

    /// Register address (0-based)
    pub address: u16,

    /// Slave id (defaults to the first configured slave)
    #[serde(default)]
    pub slave: Option<u8>,

    /// Word interpretation
    #[serde(default)]
    pub data_type: DataType,

    /// Lowest accepted engineering value for writes
    #[serde(default)]
    pub min: Option<f64>,

    /// Highest accepted engineering value for writes
    #[serde(default)]
    pub max: Option<f64>,

    /// Unit of measurement (for metadata)
    #[serde(default)]
    pub unit: Option<String>,
}

/// A range of registers read on every cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollRangeConfig {
    /// Address space
    pub space: Space,

    /// Starting address (0-based)
    pub start: u16,

    /// Number of registers to read (default: 1)
    #[serde(default = "default_count")]
    pub count: u16,

    /// Slave id (defaults to the first configured slave)
    #[serde(default)]
    pub slave: Option<u8>,
}

fn default_count() -> u16 {
    1
}

/// Registers read and written together, e.g. the state, setpoint and
/// measurements of one heating zone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Resource name, e.g. "zone_1_1"
    pub name: String,

    /// Field name to register name
    pub members: BTreeMap<String, String>,
}

/// Register store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database file
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("registers.db")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

/// HTTP API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Serve the HTTP API
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,

    /// Listen address
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_http_enabled() -> bool {
    true
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            listen: default_listen(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: GatewayConfig = sysbus_common::load_config(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_bus()?;

        let mut names = HashSet::new();
        let mut keys = HashSet::new();

        for register in &self.registers {
            if register.name.is_empty() {
                return Err(ConfigError::Validation(
                    "Register name cannot be empty".to_string(),
                ));
            }

            if !names.insert(register.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Register '{}' is defined twice",
                    register.name
                )));
            }

            if !keys.insert((register.space, register.address)) {
                return Err(ConfigError::Validation(format!(
                    "Register '{}': {} address {} is already mapped",
                    register.name, register.space, register.address
                )));
            }

            self.check_slave(register.slave, &register.name)?;

            if let (Some(min), Some(max)) = (register.min, register.max) {
                if min > max {
                    return Err(ConfigError::Validation(format!(
                        "Register '{}': min {} is greater than max {}",
                        register.name, min, max
                    )));
                }
            }
        }

        for (index, range) in self.poll_plan.iter().enumerate() {
            let label = format!("poll range #{}", index);

            if range.count == 0 || range.count > MAX_READ_COUNT {
                return Err(ConfigError::Validation(format!(
                    "{}: count must be 1-{}",
                    label, MAX_READ_COUNT
                )));
            }

            if u32::from(range.start) + u32::from(range.count) > 0x1_0000 {
                return Err(ConfigError::Validation(format!(
                    "{}: range {}+{} exceeds the address space",
                    label, range.start, range.count
                )));
            }

            self.check_slave(range.slave, &label)?;
        }

        self.validate_groups(&names)?;
        self.validate_ownership()
    }

    fn validate_groups(&self, registers: &HashSet<&str>) -> Result<(), ConfigError> {
        let mut names = HashSet::new();

        for group in &self.groups {
            if group.name.is_empty() {
                return Err(ConfigError::Validation(
                    "Group name cannot be empty".to_string(),
                ));
            }

            if !names.insert(group.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Group '{}' is defined twice",
                    group.name
                )));
            }

            if group.members.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "Group '{}' has no members",
                    group.name
                )));
            }

            for (field, register) in &group.members {
                if !registers.contains(register.as_str()) {
                    return Err(ConfigError::Validation(format!(
                        "Group '{}': field '{}' refers to unknown register '{}'",
                        group.name, field, register
                    )));
                }
            }
        }

        Ok(())
    }

    /// The store keys registers by (space, address), so every address must
    /// belong to exactly one slave.
    fn validate_ownership(&self) -> Result<(), ConfigError> {
        let mut owners: HashMap<(Space, u16), u8> = HashMap::new();

        let mapped = self
            .registers
            .iter()
            .map(|r| (r.space, r.address, self.bus.resolve_slave(r.slave)));
        let polled = self.poll_plan.iter().flat_map(|range| {
            let slave = self.bus.resolve_slave(range.slave);
            (0..range.count).map(move |offset| (range.space, range.start + offset, slave))
        });

        for (space, address, slave) in mapped.chain(polled) {
            let owner = *owners.entry((space, address)).or_insert(slave);
            if owner != slave {
                return Err(ConfigError::Validation(format!(
                    "{} address {} is claimed by slaves {} and {}",
                    space, address, owner, slave
                )));
            }
        }

        Ok(())
    }

    fn validate_bus(&self) -> Result<(), ConfigError> {
        let bus = &self.bus;

        if bus.slave_ids.is_empty() || bus.slave_ids.len() > 2 {
            return Err(ConfigError::Validation(
                "One or two slave ids must be configured".to_string(),
            ));
        }

        for slave in &bus.slave_ids {
            if !(1..=247).contains(slave) {
                return Err(ConfigError::Validation(format!(
                    "Slave id {} must be 1-247",
                    slave
                )));
            }
        }

        if bus.slave_ids.len() == 2 && bus.slave_ids[0] == bus.slave_ids[1] {
            return Err(ConfigError::Validation(
                "Slave ids must be distinct".to_string(),
            ));
        }

        if bus.timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "timeout_ms must be greater than zero".to_string(),
            ));
        }

        if bus.poll_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "poll_interval_secs must be greater than zero".to_string(),
            ));
        }

        // Validate RTU parity
        if let ConnectionConfig::Rtu { parity, .. } = &bus.connection {
            match parity.to_lowercase().as_str() {
                "none" | "even" | "odd" => {}
                _ => {
                    return Err(ConfigError::Validation(format!(
                        "invalid parity '{}' (use none, even, or odd)",
                        parity
                    )));
                }
            }
        }

        Ok(())
    }

    fn check_slave(&self, slave: Option<u8>, owner: &str) -> Result<(), ConfigError> {
        match slave {
            Some(id) if !self.bus.slave_ids.contains(&id) => Err(ConfigError::Validation(
                format!("{}: slave {} is not in slave_ids", owner, id),
            )),
            _ => Ok(()),
        }
    }
}
