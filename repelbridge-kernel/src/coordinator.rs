/**
 * SNAPSHOT COORDINATOR - One consistent view of a RepelBridge device
 *
 * ROLE :
 * Runs refresh cycles (system status, then 4 reads per bus) and publishes the
 * resulting Snapshot for every consumer (entities, HTTP API, MQTT).
 *
 * RULES :
 * - System status failure = cycle failure, previous snapshot kept, flag false
 * - Bus failure = bus dropped from the new snapshot, warning, cycle still ok
 * - Cycles never overlap; requests made during a cycle queue behind it and
 *   share a single follow-up cycle
 * - Every command batch is followed by one refresh
 */

use crate::client::{ClientError, DeviceClient, DeviceCommand};
use crate::models::{BusId, BusRecord, Snapshot};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, thiserror::Error)]
#[error("error communicating with device: {0}")]
pub struct UpdateFailed(pub String);

impl From<ClientError> for UpdateFailed {
    fn from(err: ClientError) -> Self {
        UpdateFailed(err.to_string())
    }
}

/// What consumers see. Cloning is cheap, the snapshot is shared.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CoordinatorStatus {
    pub last_update_success: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_update: Option<OffsetDateTime>,
    pub last_error: Option<String>,
    pub snapshot: Option<Arc<Snapshot>>,
}

impl CoordinatorStatus {
    /// The snapshot, but only while the last cycle succeeded.
    pub fn current(&self) -> Option<&Snapshot> {
        if self.last_update_success {
            self.snapshot.as_deref()
        } else {
            None
        }
    }

    pub fn bus(&self, bus: BusId) -> Option<&BusRecord> {
        self.current().and_then(|snap| snap.bus(bus))
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CycleStats {
    pub cycles_ok: u64,
    pub cycles_failed: u64,
    pub buses_dropped: u64,
}

/// Fetch a complete snapshot. Only the system status is fatal.
pub async fn fetch_snapshot(client: &DeviceClient) -> Result<Snapshot, UpdateFailed> {
    let system = client.get_system_status().await?;

    let mut buses = BTreeMap::new();
    for bus in BusId::ALL {
        match fetch_bus(client, bus).await {
            Ok(record) => {
                buses.insert(bus, record);
            }
            Err(e) => {
                warn!(bus = %bus, error = %e, timeout = e.is_timeout(), "error fetching bus data, bus skipped this cycle");
            }
        }
    }

    Ok(Snapshot { system, buses })
}

async fn fetch_bus(client: &DeviceClient, bus: BusId) -> Result<BusRecord, ClientError> {
    let status = client.get_bus_status(bus).await?;
    let cartridge = client.get_cartridge_status(bus).await?;
    let auto_shutoff = client.get_auto_shutoff(bus).await?;
    let warn_at = client.get_warn_at(bus).await?;
    Ok(BusRecord { status, cartridge, auto_shutoff, warn_at })
}

pub struct Coordinator {
    name: String,
    client: DeviceClient,
    status_tx: watch::Sender<CoordinatorStatus>,
    /// Serializes cycles. Holds the number of cycles started so far.
    cycle_lock: Mutex<u64>,
    cycles_started: AtomicU64,
    cycles_ok: AtomicU64,
    cycles_failed: AtomicU64,
    buses_dropped: AtomicU64,
}

impl Coordinator {
    pub fn new(name: impl Into<String>, client: DeviceClient) -> Self {
        let (status_tx, _) = watch::channel(CoordinatorStatus::default());
        Self {
            name: name.into(),
            client,
            status_tx,
            cycle_lock: Mutex::new(0),
            cycles_started: AtomicU64::new(0),
            cycles_ok: AtomicU64::new(0),
            cycles_failed: AtomicU64::new(0),
            buses_dropped: AtomicU64::new(0),
        }
    }

    pub fn status(&self) -> CoordinatorStatus {
        self.status_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CoordinatorStatus> {
        self.status_tx.subscribe()
    }

    pub fn is_available(&self) -> bool {
        self.status_tx.borrow().last_update_success
    }

    pub fn stats(&self) -> CycleStats {
        CycleStats {
            cycles_ok: self.cycles_ok.load(Ordering::Relaxed),
            cycles_failed: self.cycles_failed.load(Ordering::Relaxed),
            buses_dropped: self.buses_dropped.load(Ordering::Relaxed),
        }
    }

    /// Single entry point for timer and on-demand refreshes.
    ///
    /// If a cycle is running, waits for it, then runs a new one unless some
    /// other caller already ran a cycle that started after this request.
    pub async fn request_refresh(&self) -> Result<Arc<Snapshot>, UpdateFailed> {
        let ticket = self.cycles_started.load(Ordering::SeqCst);
        let mut started = self.cycle_lock.lock().await;

        if *started > ticket {
            debug!(coordinator = %self.name, "refresh coalesced into a newer cycle");
            let status = self.status();
            return match (status.last_update_success, status.snapshot) {
                (true, Some(snap)) => Ok(snap),
                _ => Err(UpdateFailed(
                    status.last_error.unwrap_or_else(|| "no data".to_string()),
                )),
            };
        }

        *started += 1;
        self.cycles_started.store(*started, Ordering::SeqCst);
        self.run_cycle().await
    }

    async fn run_cycle(&self) -> Result<Arc<Snapshot>, UpdateFailed> {
        let outcome = fetch_snapshot(&self.client).await;
        let now = OffsetDateTime::now_utc();
        let was_available = self.is_available();

        match outcome {
            Ok(snapshot) => {
                let dropped = (BusId::ALL.len() - snapshot.buses.len()) as u64;
                self.buses_dropped.fetch_add(dropped, Ordering::Relaxed);
                self.cycles_ok.fetch_add(1, Ordering::Relaxed);

                let snapshot = Arc::new(snapshot);
                self.status_tx.send_replace(CoordinatorStatus {
                    last_update_success: true,
                    last_update: Some(now),
                    last_error: None,
                    snapshot: Some(snapshot.clone()),
                });

                if !was_available {
                    info!(coordinator = %self.name, device = %self.client.base_url(), buses = snapshot.buses.len(), "device data available");
                } else {
                    debug!(coordinator = %self.name, buses = snapshot.buses.len(), "refresh done");
                }
                Ok(snapshot)
            }
            Err(err) => {
                self.cycles_failed.fetch_add(1, Ordering::Relaxed);
                // keep the previous snapshot, consumers gate on the flag
                self.status_tx.send_modify(|status| {
                    status.last_update_success = false;
                    status.last_update = Some(now);
                    status.last_error = Some(err.to_string());
                });

                if was_available {
                    warn!(coordinator = %self.name, error = %err, "device unavailable");
                } else {
                    debug!(coordinator = %self.name, error = %err, "device still unavailable");
                }
                Err(err)
            }
        }
    }

    /// Run commands in order, stop at the first failure, then refresh once.
    pub async fn apply(&self, commands: &[DeviceCommand]) -> Result<(), ClientError> {
        for command in commands {
            self.client.execute(command).await?;
            debug!(coordinator = %self.name, bus = %command.bus(), ?command, "command applied");
        }
        if let Err(e) = self.request_refresh().await {
            warn!(coordinator = %self.name, error = %e, "refresh after command failed");
        }
        Ok(())
    }
}
