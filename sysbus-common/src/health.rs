//! Health and liveness types reported by the gateway.

use serde::{Deserialize, Serialize};

/// Bus slave availability status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Slave is answering every transaction.
    Online,
    /// Slave did not answer any transaction in the last cycle.
    Offline,
    /// Slave answered some transactions and failed others.
    Degraded,
    /// Slave has not been addressed yet.
    #[default]
    Unknown,
}

impl DeviceStatus {
    /// Classify a slave from the outcome counts of one cycle.
    pub fn from_outcomes(succeeded: u64, failed: u64) -> Self {
        match (succeeded, failed) {
            (0, 0) => DeviceStatus::Unknown,
            (_, 0) => DeviceStatus::Online,
            (0, _) => DeviceStatus::Offline,
            _ => DeviceStatus::Degraded,
        }
    }
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceStatus::Online => write!(f, "online"),
            DeviceStatus::Offline => write!(f, "offline"),
            DeviceStatus::Degraded => write!(f, "degraded"),
            DeviceStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Per-slave liveness information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaveLiveness {
    /// Slave id on the bus.
    pub slave: u8,
    /// Current status.
    pub status: DeviceStatus,
    /// Last successful exchange (millis since epoch).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<i64>,
    /// Consecutive failed cycles.
    pub consecutive_failures: u32,
}

impl SlaveLiveness {
    /// Liveness for a slave that has not been polled yet.
    pub fn new(slave: u8) -> Self {
        Self {
            slave,
            status: DeviceStatus::Unknown,
            last_seen: None,
            consecutive_failures: 0,
        }
    }
}
