/**
 * ENTITIES - Presentation adapters over the coordinator snapshot
 *
 * Each entity is a small record (descriptor + bus) implementing:
 * - Readable : snapshot -> EntityState (availability, state, attributes)
 * - Settable : user request -> list of DeviceCommand
 *
 * No entity talks to the device directly: commands go through
 * Coordinator::apply, which also triggers the follow-up refresh.
 *
 * Identity is scoped per entry: `{entry_id}_bus_{n}` devices,
 * `{entry_id}_bus_{n}_{suffix}` entities.
 */

use crate::client::{ClientError, DeviceCommand, MAX_AUTO_SHUTOFF_MINUTES, MAX_BRIGHTNESS, MAX_WARN_AT_HOURS, MIN_WARN_AT_HOURS};
use crate::coordinator::{Coordinator, CoordinatorStatus};
use crate::models::{BusId, BusRecord, Color};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::info;

pub const CARTRIDGE_LOW_THRESHOLD: u8 = 5;

const MANUFACTURER: &str = "RepelBridge";
const MODEL: &str = "Repeller Controller";
const SW_VERSION: &str = "1.0.0";

#[derive(Debug, thiserror::Error)]
pub enum EntityError {
    #[error("{unique_id} does not support {action}")]
    Unsupported { unique_id: String, action: &'static str },
    #[error("invalid value: {0}")]
    InvalidValue(String),
    #[error("device error: {0}")]
    Device(#[from] ClientError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Light,
    Switch,
    Number,
    Button,
    BinarySensor,
    Sensor,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DeviceIdentity {
    pub identifier: String,
    pub name: String,
    pub manufacturer: &'static str,
    pub model: &'static str,
    pub sw_version: &'static str,
}

impl DeviceIdentity {
    fn bus(entry_id: &str, title: &str, bus: BusId) -> Self {
        Self {
            identifier: format!("{entry_id}_bus_{bus}"),
            name: format!("{title} Bus {bus}"),
            manufacturer: MANUFACTURER,
            model: MODEL,
            sw_version: SW_VERSION,
        }
    }

    fn system(entry_id: &str, title: &str) -> Self {
        Self {
            identifier: format!("{entry_id}_system"),
            name: format!("{title} System"),
            manufacturer: MANUFACTURER,
            model: MODEL,
            sw_version: SW_VERSION,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EntityDescriptor {
    pub unique_id: String,
    pub name: String,
    pub platform: Platform,
    pub bus: Option<BusId>,
    pub device: DeviceIdentity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<&'static str>,
}

impl EntityDescriptor {
    fn for_bus(entry_id: &str, title: &str, bus: BusId, suffix: &str, label: &str, platform: Platform) -> Self {
        Self {
            unique_id: format!("{entry_id}_bus_{bus}_{suffix}"),
            name: if label.is_empty() {
                format!("{title} Bus {bus}")
            } else {
                format!("{title} Bus {bus} {label}")
            },
            platform,
            bus: Some(bus),
            device: DeviceIdentity::bus(entry_id, title, bus),
            unit: None,
            icon: None,
        }
    }

    fn for_system(entry_id: &str, title: &str, suffix: &str, label: &str) -> Self {
        Self {
            unique_id: format!("{entry_id}_{suffix}"),
            name: format!("{title} {label}"),
            platform: Platform::Sensor,
            bus: None,
            device: DeviceIdentity::system(entry_id, title),
            unit: None,
            icon: None,
        }
    }

    fn unit(mut self, unit: &'static str) -> Self {
        self.unit = Some(unit);
        self
    }

    fn icon(mut self, icon: &'static str) -> Self {
        self.icon = Some(icon);
        self
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EntityState {
    pub available: bool,
    pub state: Value,
    pub attributes: Map<String, Value>,
    /// Icon that depends on the current state; the static one is on the descriptor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_icon: Option<&'static str>,
}

impl EntityState {
    fn unavailable() -> Self {
        Self {
            available: false,
            state: Value::Null,
            attributes: Map::new(),
            state_icon: None,
        }
    }

    fn available(state: Value, attributes: Value) -> Self {
        Self {
            available: true,
            state,
            attributes: match attributes {
                Value::Object(map) => map,
                _ => Map::new(),
            },
            state_icon: None,
        }
    }
}

/// What a user (HTTP caller) asks an entity to do.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SetRequest {
    TurnOn {
        /// Presentation scale, 0-255.
        #[serde(default)]
        brightness: Option<u16>,
        #[serde(default)]
        rgb: Option<[u8; 3]>,
    },
    TurnOff,
    SetValue { value: f64 },
    Press,
}

impl SetRequest {
    fn name(&self) -> &'static str {
        match self {
            SetRequest::TurnOn { .. } => "turn_on",
            SetRequest::TurnOff => "turn_off",
            SetRequest::SetValue { .. } => "set_value",
            SetRequest::Press => "press",
        }
    }
}

pub trait Readable: Send + Sync {
    fn descriptor(&self) -> &EntityDescriptor;
    fn read(&self, status: &CoordinatorStatus) -> EntityState;
    fn as_settable(&self) -> Option<&dyn Settable> {
        None
    }
}

pub trait Settable: Send + Sync {
    fn commands(&self, request: &SetRequest) -> Result<Vec<DeviceCommand>, EntityError>;
}

fn unsupported(desc: &EntityDescriptor, request: &SetRequest) -> EntityError {
    EntityError::Unsupported {
        unique_id: desc.unique_id.clone(),
        action: request.name(),
    }
}

fn on_off(on: bool) -> Value {
    Value::from(if on { "on" } else { "off" })
}

/// Reads a bus entity: unavailable unless the bus made it into the last
/// successful snapshot.
fn read_bus<F>(status: &CoordinatorStatus, bus: BusId, f: F) -> EntityState
where
    F: FnOnce(&BusRecord) -> (Value, Value),
{
    match status.bus(bus) {
        Some(record) => {
            let (state, mut attributes) = f(record);
            if let Value::Object(map) = &mut attributes {
                map.insert("bus_id".into(), json!(bus));
            }
            EntityState::available(state, attributes)
        }
        None => EntityState::unavailable(),
    }
}

// ============ LIGHT ============

pub struct BusLight {
    desc: EntityDescriptor,
    bus: BusId,
}

impl Readable for BusLight {
    fn descriptor(&self) -> &EntityDescriptor {
        &self.desc
    }

    fn read(&self, status: &CoordinatorStatus) -> EntityState {
        read_bus(status, self.bus, |r| {
            let c = r.status.color;
            (
                on_off(r.status.powered),
                json!({
                    "brightness": r.status.brightness,
                    "rgb_color": [c.red, c.green, c.blue],
                    "bus_state": r.status.state,
                    "repeller_count": r.status.repeller_count,
                    "runtime_hours": r.cartridge.runtime_hours,
                    "cartridge_percent_left": r.cartridge.percent_left,
                    "auto_shutoff_minutes": r.auto_shutoff.auto_shutoff_minutes,
                }),
            )
        })
    }

    fn as_settable(&self) -> Option<&dyn Settable> {
        Some(self)
    }
}

impl Settable for BusLight {
    fn commands(&self, request: &SetRequest) -> Result<Vec<DeviceCommand>, EntityError> {
        let bus = self.bus;
        match request {
            SetRequest::TurnOn { brightness, rgb } => {
                let mut commands = Vec::new();
                if let Some(b) = *brightness {
                    if b > 255 {
                        return Err(EntityError::InvalidValue(format!("brightness {b} is above 255")));
                    }
                    // 255 has no device equivalent, truncate instead of rescaling
                    commands.push(DeviceCommand::SetBrightness {
                        bus,
                        value: b.min(MAX_BRIGHTNESS as u16),
                    });
                }
                if let Some([red, green, blue]) = *rgb {
                    commands.push(DeviceCommand::SetColor {
                        bus,
                        color: Color { red, green, blue },
                    });
                }
                commands.push(DeviceCommand::SetPower { bus, on: true });
                Ok(commands)
            }
            SetRequest::TurnOff => Ok(vec![DeviceCommand::SetPower { bus, on: false }]),
            other => Err(unsupported(&self.desc, other)),
        }
    }
}

// ============ SWITCH ============

pub struct PowerSwitch {
    desc: EntityDescriptor,
    bus: BusId,
}

impl Readable for PowerSwitch {
    fn descriptor(&self) -> &EntityDescriptor {
        &self.desc
    }

    fn read(&self, status: &CoordinatorStatus) -> EntityState {
        read_bus(status, self.bus, |r| {
            (
                on_off(r.status.powered),
                json!({
                    "bus_state": r.status.state,
                    "repeller_count": r.status.repeller_count,
                    "runtime_hours": r.cartridge.runtime_hours,
                    "cartridge_percent_left": r.cartridge.percent_left,
                    "brightness": r.status.brightness,
                    "color": r.status.color,
                }),
            )
        })
    }

    fn as_settable(&self) -> Option<&dyn Settable> {
        Some(self)
    }
}

impl Settable for PowerSwitch {
    fn commands(&self, request: &SetRequest) -> Result<Vec<DeviceCommand>, EntityError> {
        match request {
            SetRequest::TurnOn { .. } => Ok(vec![DeviceCommand::SetPower { bus: self.bus, on: true }]),
            SetRequest::TurnOff => Ok(vec![DeviceCommand::SetPower { bus: self.bus, on: false }]),
            other => Err(unsupported(&self.desc, other)),
        }
    }
}

// ============ NUMBERS ============

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumberKind {
    AutoShutoff,
    WarnAt,
}

impl NumberKind {
    pub fn range(self) -> (u32, u32) {
        match self {
            NumberKind::AutoShutoff => (0, MAX_AUTO_SHUTOFF_MINUTES as u32),
            NumberKind::WarnAt => (MIN_WARN_AT_HOURS, MAX_WARN_AT_HOURS),
        }
    }
}

pub struct BusNumber {
    desc: EntityDescriptor,
    bus: BusId,
    kind: NumberKind,
}

impl Readable for BusNumber {
    fn descriptor(&self) -> &EntityDescriptor {
        &self.desc
    }

    fn read(&self, status: &CoordinatorStatus) -> EntityState {
        let (min, max) = self.kind.range();
        read_bus(status, self.bus, |r| match self.kind {
            NumberKind::AutoShutoff => (
                json!(r.auto_shutoff.auto_shutoff_minutes),
                json!({
                    "min": min,
                    "max": max,
                    "step": 1,
                    "description": "Automatic shutoff time in minutes (0 = disabled)",
                    "max_hours": max / 60,
                }),
            ),
            NumberKind::WarnAt => (
                json!(r.warn_at.warn_at_hours),
                json!({
                    "min": min,
                    "max": max,
                    "step": 1,
                    "description": "Cartridge replacement warning threshold in hours",
                    "current_runtime_hours": r.cartridge.runtime_hours,
                    "percent_left": r.cartridge.percent_left,
                }),
            ),
        })
    }

    fn as_settable(&self) -> Option<&dyn Settable> {
        Some(self)
    }
}

impl Settable for BusNumber {
    fn commands(&self, request: &SetRequest) -> Result<Vec<DeviceCommand>, EntityError> {
        let SetRequest::SetValue { value } = *request else {
            return Err(unsupported(&self.desc, request));
        };
        let (min, max) = self.kind.range();
        if !value.is_finite() || value < min as f64 || value > max as f64 {
            return Err(EntityError::InvalidValue(format!(
                "{value} is outside {min}..={max} for {}",
                self.desc.unique_id
            )));
        }
        let value = value.trunc() as u32;
        let command = match self.kind {
            NumberKind::AutoShutoff => DeviceCommand::SetAutoShutoff {
                bus: self.bus,
                minutes: value as u16,
            },
            NumberKind::WarnAt => DeviceCommand::SetWarnAt {
                bus: self.bus,
                hours: value,
            },
        };
        Ok(vec![command])
    }
}

// ============ BUTTON ============

pub struct ResetCartridgeButton {
    desc: EntityDescriptor,
    bus: BusId,
}

impl Readable for ResetCartridgeButton {
    fn descriptor(&self) -> &EntityDescriptor {
        &self.desc
    }

    fn read(&self, status: &CoordinatorStatus) -> EntityState {
        read_bus(status, self.bus, |_| (Value::Null, json!({})))
    }

    fn as_settable(&self) -> Option<&dyn Settable> {
        Some(self)
    }
}

impl Settable for ResetCartridgeButton {
    fn commands(&self, request: &SetRequest) -> Result<Vec<DeviceCommand>, EntityError> {
        match request {
            SetRequest::Press => Ok(vec![DeviceCommand::ResetCartridge { bus: self.bus }]),
            other => Err(unsupported(&self.desc, other)),
        }
    }
}

// ============ SENSORS ============

pub struct CartridgeLowSensor {
    desc: EntityDescriptor,
    bus: BusId,
    threshold: u8,
}

impl Readable for CartridgeLowSensor {
    fn descriptor(&self) -> &EntityDescriptor {
        &self.desc
    }

    fn read(&self, status: &CoordinatorStatus) -> EntityState {
        let mut low = false;
        let mut state = read_bus(status, self.bus, |r| {
            low = r.cartridge.percent_left <= f64::from(self.threshold);
            (
                on_off(low),
                json!({
                    "percent_left": r.cartridge.percent_left,
                    "runtime_hours": r.cartridge.runtime_hours,
                    "threshold": self.threshold,
                }),
            )
        });
        if state.available {
            state.state_icon = Some(if low { "mdi:battery-alert" } else { "mdi:battery" });
        }
        state
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusSensorKind {
    RuntimeHours,
    CartridgeLife,
    RepellerCount,
}

pub struct BusSensor {
    desc: EntityDescriptor,
    bus: BusId,
    kind: BusSensorKind,
}

impl Readable for BusSensor {
    fn descriptor(&self) -> &EntityDescriptor {
        &self.desc
    }

    fn read(&self, status: &CoordinatorStatus) -> EntityState {
        read_bus(status, self.bus, |r| match self.kind {
            BusSensorKind::RuntimeHours => (
                json!(r.cartridge.runtime_hours),
                json!({ "active_seconds": r.cartridge.active_seconds }),
            ),
            BusSensorKind::CartridgeLife => (
                json!(r.cartridge.percent_left),
                json!({
                    "runtime_hours": r.cartridge.runtime_hours,
                    "warn_at_hours": r.warn_at.warn_at_hours,
                }),
            ),
            BusSensorKind::RepellerCount => (
                json!(r.status.repeller_count),
                json!({ "bus_state": r.status.state }),
            ),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemSensorKind {
    WifiStatus,
    Uptime,
}

pub struct SystemSensor {
    desc: EntityDescriptor,
    kind: SystemSensorKind,
}

impl Readable for SystemSensor {
    fn descriptor(&self) -> &EntityDescriptor {
        &self.desc
    }

    fn read(&self, status: &CoordinatorStatus) -> EntityState {
        let Some(snapshot) = status.current() else {
            let mut state = EntityState::unavailable();
            if self.kind == SystemSensorKind::WifiStatus {
                state.state = json!("unknown");
            }
            return state;
        };
        let sys = &snapshot.system;
        match self.kind {
            SystemSensorKind::WifiStatus => EntityState::available(
                json!(if sys.wifi_connected { "connected" } else { "disconnected" }),
                json!({
                    "ssid": sys.wifi_ssid,
                    "ip_address": sys.wifi_ip,
                    "free_heap": sys.free_heap,
                }),
            ),
            SystemSensorKind::Uptime => EntityState::available(
                json!(sys.uptime_ms / 1000),
                json!({
                    "uptime_ms": sys.uptime_ms,
                    "device_name": sys.device_name,
                }),
            ),
        }
    }
}

// ============ FACTORY / DISPATCH ============

pub type EntityList = Vec<Box<dyn Readable>>;

/// Every entity of one device entry: 9 per bus plus 2 system sensors.
pub fn build_entities(entry_id: &str, title: &str) -> EntityList {
    let mut entities: EntityList = Vec::new();

    for bus in BusId::ALL {
        let d = |suffix: &str, label: &str, platform| {
            EntityDescriptor::for_bus(entry_id, title, bus, suffix, label, platform)
        };

        entities.push(Box::new(BusLight { desc: d("light", "", Platform::Light), bus }));
        entities.push(Box::new(PowerSwitch { desc: d("power", "Power", Platform::Switch), bus }));
        entities.push(Box::new(BusNumber {
            desc: d("auto_shutoff", "Auto Shutoff", Platform::Number).unit("min"),
            bus,
            kind: NumberKind::AutoShutoff,
        }));
        entities.push(Box::new(BusNumber {
            desc: d("cartridge_warn_at", "Cartridge Warning", Platform::Number).unit("h"),
            bus,
            kind: NumberKind::WarnAt,
        }));
        entities.push(Box::new(ResetCartridgeButton {
            desc: d("reset_cartridge", "Reset Cartridge", Platform::Button).icon("mdi:restore"),
            bus,
        }));
        entities.push(Box::new(CartridgeLowSensor {
            desc: d("cartridge_low", "Cartridge Low", Platform::BinarySensor),
            bus,
            threshold: CARTRIDGE_LOW_THRESHOLD,
        }));
        entities.push(Box::new(BusSensor {
            desc: d("runtime_hours", "Runtime Hours", Platform::Sensor).unit("h"),
            bus,
            kind: BusSensorKind::RuntimeHours,
        }));
        entities.push(Box::new(BusSensor {
            desc: d("cartridge_life", "Cartridge Life", Platform::Sensor).unit("%"),
            bus,
            kind: BusSensorKind::CartridgeLife,
        }));
        entities.push(Box::new(BusSensor {
            desc: d("repeller_count", "Device Count", Platform::Sensor),
            bus,
            kind: BusSensorKind::RepellerCount,
        }));
    }

    entities.push(Box::new(SystemSensor {
        desc: EntityDescriptor::for_system(entry_id, title, "wifi_status", "WiFi Status"),
        kind: SystemSensorKind::WifiStatus,
    }));
    entities.push(Box::new(SystemSensor {
        desc: EntityDescriptor::for_system(entry_id, title, "uptime", "Uptime").unit("s"),
        kind: SystemSensorKind::Uptime,
    }));

    entities
}

pub fn find_entity<'a>(entities: &'a [Box<dyn Readable>], unique_id: &str) -> Option<&'a dyn Readable> {
    entities
        .iter()
        .find(|e| e.descriptor().unique_id == unique_id)
        .map(|e| e.as_ref())
}

/// Turns the request into device commands and runs them (with the
/// follow-up refresh) through the coordinator.
pub async fn apply_request(
    entity: &dyn Readable,
    coordinator: &Coordinator,
    request: &SetRequest,
) -> Result<(), EntityError> {
    let desc = entity.descriptor();
    let settable = entity
        .as_settable()
        .ok_or_else(|| unsupported(desc, request))?;
    let commands = settable.commands(request)?;
    coordinator.apply(&commands).await?;
    info!(entity = %desc.unique_id, action = request.name(), "entity command applied");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::DeviceClient;
    use crate::models::{AutoShutoff, BusStatus, CartridgeStatus, Snapshot, SystemStatus, WarnAt};
    use repelbridge_devkit::FakeDevice;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    fn bus(n: u8) -> BusId {
        BusId::try_from(n).unwrap()
    }

    fn record(percent_left: f64) -> BusRecord {
        BusRecord {
            status: BusStatus {
                powered: true,
                brightness: 200,
                color: Color { red: 1, green: 2, blue: 3 },
                state: "running".into(),
                repeller_count: 3,
            },
            cartridge: CartridgeStatus {
                percent_left,
                runtime_hours: 12.0,
                active_seconds: 43_200.0,
            },
            auto_shutoff: AutoShutoff { auto_shutoff_minutes: 90 },
            warn_at: WarnAt { warn_at_hours: 100 },
        }
    }

    fn status_with(buses: &[(u8, BusRecord)], success: bool) -> CoordinatorStatus {
        let snapshot = Snapshot {
            system: SystemStatus {
                device_name: "Liv1".into(),
                wifi_connected: true,
                wifi_ssid: "HomeNet".into(),
                wifi_ip: "10.0.0.2".into(),
                free_heap: 1000,
                uptime_ms: 65_500,
            },
            buses: buses
                .iter()
                .map(|(n, r)| (bus(*n), r.clone()))
                .collect::<BTreeMap<_, _>>(),
        };
        CoordinatorStatus {
            last_update_success: success,
            last_update: None,
            last_error: None,
            snapshot: Some(Arc::new(snapshot)),
        }
    }

    fn entity<'a>(entities: &'a EntityList, id: &str) -> &'a dyn Readable {
        find_entity(entities, id).unwrap_or_else(|| panic!("no entity {id}"))
    }

    #[test]
    fn builds_all_entities_with_entry_scoped_ids() {
        let entities = build_entities("abc", "Garden");
        assert_eq!(entities.len(), 20);

        let light = entity(&entities, "abc_bus_0_light").descriptor();
        assert_eq!(light.name, "Garden Bus 0");
        assert_eq!(light.device.identifier, "abc_bus_0");
        assert_eq!(light.platform, Platform::Light);

        let uptime = entity(&entities, "abc_uptime").descriptor();
        assert_eq!(uptime.device.identifier, "abc_system");
        assert_eq!(uptime.bus, None);
    }

    #[test]
    fn bus_entities_unavailable_when_bus_missing() {
        let entities = build_entities("e", "T");
        let status = status_with(&[(0, record(50.0))], true);

        assert!(entity(&entities, "e_bus_0_power").read(&status).available);
        let missing = entity(&entities, "e_bus_1_power").read(&status);
        assert!(!missing.available);
        assert_eq!(missing.state, Value::Null);
        assert!(missing.attributes.is_empty());
    }

    #[test]
    fn everything_unavailable_after_failed_cycle() {
        let entities = build_entities("e", "T");
        let status = status_with(&[(0, record(50.0)), (1, record(50.0))], false);

        for e in &entities {
            assert!(!e.read(&status).available, "{}", e.descriptor().unique_id);
        }
        assert_eq!(entity(&entities, "e_wifi_status").read(&status).state, json!("unknown"));
    }

    #[test]
    fn light_reports_color_and_cartridge() {
        let entities = build_entities("e", "T");
        let state = entity(&entities, "e_bus_0_light").read(&status_with(&[(0, record(50.0))], true));

        assert_eq!(state.state, json!("on"));
        assert_eq!(state.attributes["brightness"], 200);
        assert_eq!(state.attributes["rgb_color"], json!([1, 2, 3]));
        assert_eq!(state.attributes["bus_id"], 0);
        assert_eq!(state.attributes["cartridge_percent_left"], 50.0);
    }

    #[test]
    fn cartridge_low_uses_threshold() {
        let entities = build_entities("e", "T");
        let status = status_with(&[(0, record(5.0)), (1, record(5.5))], true);

        let low = entity(&entities, "e_bus_0_cartridge_low").read(&status);
        assert_eq!(low.state, json!("on"));
        assert_eq!(low.state_icon, Some("mdi:battery-alert"));
        assert_eq!(low.attributes["threshold"], 5);

        let ok = entity(&entities, "e_bus_1_cartridge_low").read(&status);
        assert_eq!(ok.state, json!("off"));
        assert_eq!(ok.state_icon, Some("mdi:battery"));
    }

    #[test]
    fn system_sensors_convert_units() {
        let entities = build_entities("e", "T");
        let status = status_with(&[], true);

        assert_eq!(entity(&entities, "e_uptime").read(&status).state, json!(65));
        let wifi = entity(&entities, "e_wifi_status").read(&status);
        assert_eq!(wifi.state, json!("connected"));
        assert_eq!(wifi.attributes["ip_address"], "10.0.0.2");
    }

    #[test]
    fn numbers_report_current_values() {
        let entities = build_entities("e", "T");
        let status = status_with(&[(1, record(40.0))], true);

        let shutoff = entity(&entities, "e_bus_1_auto_shutoff").read(&status);
        assert_eq!(shutoff.state, json!(90));
        assert_eq!(shutoff.attributes["max_hours"], 16);
        let warn = entity(&entities, "e_bus_1_cartridge_warn_at").read(&status);
        assert_eq!(warn.state, json!(100));
        assert_eq!(warn.attributes["current_runtime_hours"], 12.0);
    }

    #[test]
    fn light_turn_on_orders_brightness_color_power() {
        let entities = build_entities("e", "T");
        let light = entity(&entities, "e_bus_1_light").as_settable().unwrap();

        let commands = light
            .commands(&SetRequest::TurnOn { brightness: Some(255), rgb: Some([9, 8, 7]) })
            .unwrap();
        assert_eq!(
            commands,
            vec![
                DeviceCommand::SetBrightness { bus: bus(1), value: 254 },
                DeviceCommand::SetColor { bus: bus(1), color: Color { red: 9, green: 8, blue: 7 } },
                DeviceCommand::SetPower { bus: bus(1), on: true },
            ]
        );
        assert!(light
            .commands(&SetRequest::TurnOn { brightness: Some(300), rgb: None })
            .is_err());
    }

    #[test]
    fn numbers_validate_range_and_truncate() {
        let entities = build_entities("e", "T");
        let shutoff = entity(&entities, "e_bus_0_auto_shutoff").as_settable().unwrap();
        let warn = entity(&entities, "e_bus_0_cartridge_warn_at").as_settable().unwrap();

        assert_eq!(
            shutoff.commands(&SetRequest::SetValue { value: 45.9 }).unwrap(),
            vec![DeviceCommand::SetAutoShutoff { bus: bus(0), minutes: 45 }]
        );
        assert!(matches!(
            shutoff.commands(&SetRequest::SetValue { value: 961.0 }),
            Err(EntityError::InvalidValue(_))
        ));
        assert!(warn.commands(&SetRequest::SetValue { value: 0.0 }).is_err());
        assert!(warn.commands(&SetRequest::SetValue { value: f64::NAN }).is_err());
        assert!(matches!(
            warn.commands(&SetRequest::Press),
            Err(EntityError::Unsupported { action: "press", .. })
        ));
    }

    #[test]
    fn sensors_are_read_only() {
        let entities = build_entities("e", "T");
        assert!(entity(&entities, "e_bus_0_runtime_hours").as_settable().is_none());
        assert!(entity(&entities, "e_uptime").as_settable().is_none());
    }

    #[test]
    fn set_request_parses_from_json() {
        let req: SetRequest =
            serde_json::from_value(json!({"action": "turn_on", "brightness": 10})).unwrap();
        assert_eq!(req, SetRequest::TurnOn { brightness: Some(10), rgb: None });
        let req: SetRequest = serde_json::from_value(json!({"action": "press"})).unwrap();
        assert_eq!(req, SetRequest::Press);
        assert!(serde_json::from_value::<SetRequest>(json!({"action": "explode"})).is_err());
    }

    #[tokio::test]
    async fn button_press_resets_and_refreshes() {
        let device = FakeDevice::start().await.unwrap();
        let client = DeviceClient::new(reqwest::Client::new(), &device.host(), Duration::from_secs(2));
        let coordinator = Coordinator::new("e", client);
        coordinator.request_refresh().await.unwrap();

        let entities = build_entities("e", "T");
        let button = entity(&entities, "e_bus_1_reset_cartridge");
        apply_request(button, &coordinator, &SetRequest::Press).await.unwrap();

        assert_eq!(device.request_count("POST", "/api/bus/1/cartridge/reset"), 1);
        let life = entity(&entities, "e_bus_1_cartridge_life").read(&coordinator.status());
        assert_eq!(life.state, json!(100.0));
    }

    #[tokio::test]
    async fn read_only_entity_sends_nothing() {
        let device = FakeDevice::start().await.unwrap();
        let client = DeviceClient::new(reqwest::Client::new(), &device.host(), Duration::from_secs(2));
        let coordinator = Coordinator::new("e", client);

        let entities = build_entities("e", "T");
        let err = apply_request(entity(&entities, "e_uptime"), &coordinator, &SetRequest::Press)
            .await
            .unwrap_err();
        assert!(matches!(err, EntityError::Unsupported { .. }));
        assert_eq!(device.total_requests(), 0);
    }
}
