use crate::coordinator::CycleStats;
use crate::registry::DeviceRegistry;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Serialize)]
pub struct EntryHealth {
    pub entry_id: String,
    pub available: bool,
    pub last_error: Option<String>,
    #[serde(flatten)]
    pub cycles: CycleStats,
}

#[derive(Debug, Serialize)]
pub struct BridgeHealth {
    pub uptime_seconds: u64,
    pub entries: usize,
    pub entries_available: usize,
    pub mqtt_status: String,
    pub mqtt_reconnects: u32,
    pub devices: Vec<EntryHealth>,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    mqtt_reconnects: Arc<AtomicU32>,
    mqtt_status: Arc<Mutex<String>>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            mqtt_reconnects: Arc::new(AtomicU32::new(0)),
            mqtt_status: Arc::new(Mutex::new("disabled".to_string())),
        }
    }

    pub fn mark_mqtt_connected(&self) {
        *self.mqtt_status.lock() = "connected".to_string();
    }

    pub fn increment_reconnects(&self) {
        self.mqtt_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.mqtt_status.lock() = "reconnecting".to_string();
    }

    pub fn get_health(&self, registry: &DeviceRegistry) -> BridgeHealth {
        let devices: Vec<EntryHealth> = registry
            .list()
            .iter()
            .map(|entry| {
                let status = entry.coordinator.status();
                EntryHealth {
                    entry_id: entry.entry_id.clone(),
                    available: status.last_update_success,
                    last_error: status.last_error,
                    cycles: entry.coordinator.stats(),
                }
            })
            .collect();

        BridgeHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            entries: devices.len(),
            entries_available: devices.iter().filter(|d| d.available).count(),
            mqtt_status: self.mqtt_status.lock().clone(),
            mqtt_reconnects: self.mqtt_reconnects.load(Ordering::Relaxed),
            devices,
        }
    }
}
