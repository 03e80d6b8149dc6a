/**
 * MQTT STATE PUBLISHER - Pushes each entry's coordinator status to a broker
 *
 * Topics (retained, QoS 1):
 * - repelbridge/{entry_id}/availability : "online" / "offline"
 * - repelbridge/{entry_id}/snapshot     : coordinator status JSON
 *
 * One forwarding task per loaded entry follows the coordinator's watch
 * channel; registry events start/stop those tasks.
 */

use crate::config::MqttConf;
use crate::coordinator::{Coordinator, CoordinatorStatus};
use crate::health::HealthTracker;
use crate::registry::{DeviceRegistry, RegistryEvent};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::{self, JoinHandle};
use tracing::{debug, error, info, warn};

pub fn availability_topic(entry_id: &str) -> String {
    format!("repelbridge/{entry_id}/availability")
}

pub fn snapshot_topic(entry_id: &str) -> String {
    format!("repelbridge/{entry_id}/snapshot")
}

/// Messages to publish for one coordinator status.
pub fn status_messages(entry_id: &str, status: &CoordinatorStatus) -> Vec<(String, Vec<u8>)> {
    let availability = if status.last_update_success { "online" } else { "offline" };
    let mut out = vec![(availability_topic(entry_id), availability.as_bytes().to_vec())];

    if status.snapshot.is_some() {
        match serde_json::to_vec(status) {
            Ok(payload) => out.push((snapshot_topic(entry_id), payload)),
            Err(e) => error!(entry = entry_id, error = %e, "cannot serialize snapshot"),
        }
    }
    out
}

async fn publish_status(client: &AsyncClient, entry_id: &str, status: &CoordinatorStatus) {
    for (topic, payload) in status_messages(entry_id, status) {
        if let Err(e) = client.publish(topic.as_str(), QoS::AtLeastOnce, true, payload).await {
            warn!(entry = entry_id, topic = %topic, error = ?e, "mqtt publish failed");
        }
    }
}

fn spawn_entry_forwarder(client: AsyncClient, entry_id: String, coordinator: Arc<Coordinator>) -> JoinHandle<()> {
    task::spawn(async move {
        let mut rx = coordinator.subscribe();
        let current = rx.borrow_and_update().clone();
        publish_status(&client, &entry_id, &current).await;

        while rx.changed().await.is_ok() {
            let status = rx.borrow_and_update().clone();
            publish_status(&client, &entry_id, &status).await;
            debug!(entry = %entry_id, online = status.last_update_success, "status published");
        }
    })
}

type Forwarders = HashMap<String, JoinHandle<()>>;

/// Applies one registry event. Never waits on the broker: the request queue
/// may be full while the broker is down, so the offline marker is queued
/// with `try_publish` and dropped (logged) when there is no room.
fn on_registry_event(client: &AsyncClient, forwarders: &mut Forwarders, event: RegistryEvent) {
    match event {
        RegistryEvent::Loaded(entry) => {
            let handle = spawn_entry_forwarder(client.clone(), entry.entry_id.clone(), entry.coordinator.clone());
            if let Some(old) = forwarders.insert(entry.entry_id.clone(), handle) {
                old.abort();
            }
        }
        RegistryEvent::Unloaded(entry_id) => {
            if let Some(handle) = forwarders.remove(&entry_id) {
                handle.abort();
            }
            if let Err(e) = client.try_publish(availability_topic(&entry_id), QoS::AtLeastOnce, true, "offline") {
                warn!(entry = %entry_id, error = ?e, "mqtt queue full, offline marker dropped");
            }
        }
    }
}

/// Starts the publisher: broker event loop in its own task (always polled),
/// plus one forwarder per entry driven by registry events.
pub fn spawn_state_publisher(conf: &MqttConf, registry: DeviceRegistry, health: HealthTracker) {
    let mut opts = MqttOptions::new("repelbridge-kernel", &conf.host, conf.port);
    opts.set_keep_alive(Duration::from_secs(15));
    let (client, mut eventloop) = AsyncClient::new(opts, 32);
    info!(host = %conf.host, port = conf.port, "mqtt state publisher starting");

    task::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    health.mark_mqtt_connected();
                }
                Ok(_) => {}
                Err(e) => {
                    error!(error = ?e, "mqtt error, retrying in 2s");
                    health.increment_reconnects();
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    // subscribe before listing so no entry is missed
    let mut events = registry.subscribe();
    let mut forwarders: Forwarders = HashMap::new();
    for entry in registry.list() {
        on_registry_event(&client, &mut forwarders, RegistryEvent::Loaded(entry));
    }

    task::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => on_registry_event(&client, &mut forwarders, event),
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "registry events lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}
