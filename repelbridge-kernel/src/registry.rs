/**
 * DEVICE REGISTRY - Loaded RepelBridge entries
 *
 * One entry = one device host: client + coordinator + scheduler + entities.
 * Owned by main, shared (cheap clone) with the HTTP API and the MQTT
 * publisher. Load/unload notifications go out on a broadcast channel.
 */

use crate::client::{DeviceClient, DeviceCommand};
use crate::config_flow::{validate_host, DeviceInfo, ValidateError};
use crate::coordinator::{Coordinator, UpdateFailed};
use crate::entities::{build_entities, EntityList};
use crate::models::BusId;
use crate::scheduler::spawn_refresh_loop;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error(transparent)]
    Probe(#[from] ValidateError),
    #[error("first refresh failed: {0}")]
    FirstRefresh(#[from] UpdateFailed),
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("{host} is already configured")]
    AlreadyConfigured { host: String },
    #[error("entry {0} not found")]
    NotFound(String),
    #[error("{host} not ready: {source}")]
    NotReady {
        host: String,
        #[source]
        source: SetupError,
    },
}

#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Loaded(Arc<DeviceEntry>),
    Unloaded(String),
}

pub struct DeviceEntry {
    pub entry_id: String,
    pub info: DeviceInfo,
    pub coordinator: Arc<Coordinator>,
    pub entities: EntityList,
    scheduler: JoinHandle<()>,
}

#[derive(Debug, Serialize)]
pub struct EntryView {
    pub entry_id: String,
    pub title: String,
    pub host: String,
    pub device_name: String,
    pub available: bool,
}

impl DeviceEntry {
    pub fn view(&self) -> EntryView {
        EntryView {
            entry_id: self.entry_id.clone(),
            title: self.info.title.clone(),
            host: self.info.host.clone(),
            device_name: self.info.device_name.clone(),
            available: self.coordinator.is_available(),
        }
    }
}

impl std::fmt::Debug for DeviceEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceEntry")
            .field("entry_id", &self.entry_id)
            .field("host", &self.info.host)
            .finish()
    }
}

impl Drop for DeviceEntry {
    fn drop(&mut self) {
        self.scheduler.abort();
    }
}

#[derive(Clone)]
pub struct DeviceRegistry {
    entries: Arc<RwLock<BTreeMap<String, Arc<DeviceEntry>>>>,
    http: reqwest::Client,
    scan_interval: Duration,
    request_timeout: Duration,
    events: broadcast::Sender<RegistryEvent>,
}

impl DeviceRegistry {
    pub fn new(http: reqwest::Client, scan_interval: Duration, request_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            entries: Arc::new(RwLock::new(BTreeMap::new())),
            http,
            scan_interval,
            request_timeout,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn find_host(&self, host: &str) -> Option<String> {
        self.entries
            .read()
            .values()
            .find(|e| e.info.host == host)
            .map(|e| e.entry_id.clone())
    }

    /// Probe, build, first refresh, start polling. Nothing is registered
    /// unless every step succeeded.
    pub async fn setup_entry(
        &self,
        entry_id: &str,
        host: &str,
        name: Option<&str>,
    ) -> Result<Arc<DeviceEntry>, RegistryError> {
        if self.find_host(host).is_some() || self.entries.read().contains_key(entry_id) {
            return Err(RegistryError::AlreadyConfigured { host: host.to_string() });
        }
        let not_ready = |source: SetupError| RegistryError::NotReady {
            host: host.to_string(),
            source,
        };

        let info = validate_host(&self.http, host, name)
            .await
            .map_err(|e| not_ready(e.into()))?;

        let client = DeviceClient::new(self.http.clone(), host, self.request_timeout);
        let coordinator = Arc::new(Coordinator::new(entry_id, client));
        coordinator
            .request_refresh()
            .await
            .map_err(|e| not_ready(e.into()))?;

        let entry = Arc::new(DeviceEntry {
            entry_id: entry_id.to_string(),
            entities: build_entities(entry_id, &info.title),
            info,
            scheduler: spawn_refresh_loop(coordinator.clone(), self.scan_interval),
            coordinator,
        });

        {
            let mut entries = self.entries.write();
            // another setup for the same host may have finished meanwhile
            if entries.contains_key(entry_id) || entries.values().any(|e| e.info.host == host) {
                return Err(RegistryError::AlreadyConfigured { host: host.to_string() });
            }
            entries.insert(entry_id.to_string(), entry.clone());
        }

        info!(
            entry = entry_id,
            host,
            device = %entry.info.device_name,
            entities = entry.entities.len(),
            "device entry loaded"
        );
        let _ = self.events.send(RegistryEvent::Loaded(entry.clone()));
        Ok(entry)
    }

    /// Entry created at runtime, identified by a fresh UUID.
    pub async fn add(&self, host: &str, name: Option<&str>) -> Result<Arc<DeviceEntry>, RegistryError> {
        let entry_id = uuid::Uuid::new_v4().to_string();
        self.setup_entry(&entry_id, host, name).await
    }

    pub fn unload_entry(&self, entry_id: &str) -> Result<(), RegistryError> {
        let entry = self
            .entries
            .write()
            .remove(entry_id)
            .ok_or_else(|| RegistryError::NotFound(entry_id.to_string()))?;
        entry.scheduler.abort();
        info!(entry = entry_id, host = %entry.info.host, "device entry unloaded");
        let _ = self.events.send(RegistryEvent::Unloaded(entry_id.to_string()));
        Ok(())
    }

    pub fn get(&self, entry_id: &str) -> Option<Arc<DeviceEntry>> {
        self.entries.read().get(entry_id).cloned()
    }

    pub fn list(&self) -> Vec<Arc<DeviceEntry>> {
        self.entries.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// The `reset_cartridge` service. Without an entry id every loaded
    /// entry is reset; per-entry failures are logged, not returned.
    /// Returns how many entries were reset.
    pub async fn reset_cartridge(&self, bus: BusId, entry_id: Option<&str>) -> Result<usize, RegistryError> {
        let targets = match entry_id {
            Some(id) => vec![self.get(id).ok_or_else(|| RegistryError::NotFound(id.to_string()))?],
            None => self.list(),
        };

        let mut done = 0;
        for entry in targets {
            match entry.coordinator.apply(&[DeviceCommand::ResetCartridge { bus }]).await {
                Ok(()) => {
                    info!(entry = %entry.entry_id, bus = %bus, "cartridge reset");
                    done += 1;
                }
                Err(e) => {
                    error!(entry = %entry.entry_id, bus = %bus, error = %e, "error resetting cartridge");
                }
            }
        }
        if done == 0 && !self.is_empty() {
            warn!(bus = %bus, "cartridge reset reached no device");
        }
        Ok(done)
    }
}
