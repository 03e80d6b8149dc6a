/*!
JSON bodies as the RepelBridge firmware sends them

Used by the fake device to render its state, and by tests that need a
hand-made body (probe of a foreign host, truncated firmware answers...).
*/

use crate::fake_device::{BusState, CartridgeState, SystemState};
use serde_json::{json, Value};

pub fn system_status(system: &SystemState) -> Value {
    json!({
        "device_name": system.device_name,
        "wifi_connected": system.wifi_connected,
        "wifi_ssid": system.wifi_ssid,
        "wifi_ip": system.wifi_ip,
        "free_heap": system.free_heap,
        "uptime_ms": system.uptime_ms,
    })
}

pub fn bus_status(bus: &BusState) -> Value {
    json!({
        "powered": bus.powered,
        "brightness": bus.brightness,
        "color": bus.color,
        "state": bus.state,
        "repeller_count": bus.repeller_count,
    })
}

pub fn cartridge(cartridge: &CartridgeState) -> Value {
    json!({
        "percent_left": cartridge.percent_left,
        "runtime_hours": cartridge.runtime_hours,
        "active_seconds": cartridge.active_seconds,
    })
}

pub fn auto_shutoff(minutes: u16) -> Value {
    json!({ "auto_shutoff_minutes": minutes })
}

pub fn warn_at(hours: u32) -> Value {
    json!({ "warn_at_hours": hours })
}

/// What some other HTTP appliance answers on `/api/system/status`.
pub fn foreign_status() -> String {
    json!({ "status": "ok" }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_device::DeviceState;

    #[test]
    fn bus_status_nests_color() {
        let state = DeviceState::default();
        let body = bus_status(&state.buses[0]);
        assert_eq!(body["color"]["red"], 255);
        assert_eq!(body["state"], "idle");
    }

    #[test]
    fn foreign_status_has_no_device_name() {
        let body: Value = serde_json::from_str(&foreign_status()).unwrap();
        assert!(body.get("device_name").is_none());
    }
}
