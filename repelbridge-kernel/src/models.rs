use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Hardware output channel on the controller. Only 0 and 1 exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct BusId(u8);

impl BusId {
    pub const ALL: [BusId; 2] = [BusId(0), BusId(1)];
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("bus id must be 0 or 1, got {0}")]
pub struct InvalidBusId(pub u8);

impl TryFrom<u8> for BusId {
    type Error = InvalidBusId;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 | 1 => Ok(BusId(value)),
            other => Err(InvalidBusId(other)),
        }
    }
}

impl From<BusId> for u8 {
    fn from(bus: BusId) -> u8 {
        bus.0
    }
}

impl fmt::Display for BusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Device payloads. Only `device_name` is mandatory, the firmware omits the
// rest on older builds.

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemStatus {
    pub device_name: String,
    #[serde(default)]
    pub wifi_connected: bool,
    #[serde(default)]
    pub wifi_ssid: String,
    #[serde(default)]
    pub wifi_ip: String,
    #[serde(default)]
    pub free_heap: u64,
    #[serde(default)]
    pub uptime_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Color {
    #[serde(default)]
    pub red: u8,
    #[serde(default)]
    pub green: u8,
    #[serde(default)]
    pub blue: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusStatus {
    #[serde(default)]
    pub powered: bool,
    /// Device scale, 0-254.
    #[serde(default)]
    pub brightness: u8,
    #[serde(default)]
    pub color: Color,
    #[serde(default = "unknown_state")]
    pub state: String,
    #[serde(default)]
    pub repeller_count: u32,
}

fn unknown_state() -> String {
    "unknown".to_string()
}

/// Firmware builds differ on integer vs fractional readings, both decode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CartridgeStatus {
    #[serde(default)]
    pub percent_left: f64,
    #[serde(default)]
    pub runtime_hours: f64,
    #[serde(default)]
    pub active_seconds: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoShutoff {
    /// 0 disables the timer.
    #[serde(default)]
    pub auto_shutoff_minutes: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarnAt {
    #[serde(default = "default_warn_at_hours")]
    pub warn_at_hours: u32,
}

fn default_warn_at_hours() -> u32 {
    97
}

/// Everything fetched for one bus during a single refresh cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusRecord {
    pub status: BusStatus,
    pub cartridge: CartridgeStatus,
    pub auto_shutoff: AutoShutoff,
    pub warn_at: WarnAt,
}

/// Aggregated device view produced by one refresh cycle. Never mutated once
/// published; the coordinator swaps in a new one each cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub system: SystemStatus,
    /// A missing bus means its fetch failed during the cycle.
    pub buses: BTreeMap<BusId, BusRecord>,
}

impl Snapshot {
    pub fn bus(&self, bus: BusId) -> Option<&BusRecord> {
        self.buses.get(&bus)
    }
}
