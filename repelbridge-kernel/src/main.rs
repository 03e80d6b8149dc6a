/**
 * REPELBRIDGE KERNEL - Entry point of the bridge
 *
 * ROLE : Wires config, device registry, schedulers, MQTT publisher and the
 * HTTP API. Configured devices that fail setup are logged and skipped; they
 * can be added again later through POST /entries.
 */

mod client;
mod config;
mod config_flow;
mod coordinator;
mod entities;
mod health;
mod http;
mod models;
mod mqtt;
mod registry;
mod scheduler;

use crate::config::load_config;
use crate::health::HealthTracker;
use crate::http::AppState;
use crate::registry::DeviceRegistry;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("repelbridge_kernel=info")),
        )
        .init();

    let cfg = load_config().await;
    info!(
        devices = cfg.devices.len(),
        scan_interval_secs = cfg.scan_interval().as_secs(),
        "starting repelbridge kernel"
    );

    // one HTTP session shared by every device client
    let session = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;

    let registry = DeviceRegistry::new(session, cfg.scan_interval(), cfg.request_timeout());
    let health = HealthTracker::new();

    if let Some(mqtt_conf) = &cfg.mqtt {
        mqtt::spawn_state_publisher(mqtt_conf, registry.clone(), health.clone());
    }

    for (entry_id, device) in &cfg.devices {
        if let Err(e) = registry.setup_entry(entry_id, &device.host, Some(&device.name)).await {
            error!(entry = %entry_id, host = %device.host, error = %e, "device setup failed");
        }
    }
    info!(loaded = registry.len(), configured = cfg.devices.len(), "device entries ready");

    let app = http::build_router(AppState { registry, health });

    let listener = TcpListener::bind(&cfg.http.bind)
        .await
        .with_context(|| format!("failed to bind {}", cfg.http.bind))?;
    info!(addr = %cfg.http.bind, "listening");
    axum::serve(listener, app).await.context("http server stopped")?;
    Ok(())
}
