/**
 * BRIDGE HTTP API - REST surface of the RepelBridge kernel
 *
 * ROUTES :
 * - /health, /system/health                 : liveness + counters
 * - /entries                                : list / add (config flow + setup)
 * - /entries/{id}                           : unload
 * - /entries/{id}/snapshot, /refresh        : coordinator status, on-demand refresh
 * - /entries/{id}/entities[/{unique_id}]    : entity states + commands
 * - /services/reset_cartridge               : reset one bus on one or all entries
 *
 * Errors are JSON `{ok: false, error: <code>, msg}` with a matching status.
 */

use crate::client::ClientError;
use crate::config_flow::ValidateError;
use crate::entities::{apply_request, find_entity, EntityDescriptor, EntityError, EntityState, Readable, SetRequest};
use crate::health::{BridgeHealth, HealthTracker};
use crate::models::BusId;
use crate::registry::{DeviceEntry, DeviceRegistry, EntryView, RegistryError, SetupError};
use crate::coordinator::CoordinatorStatus;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

#[derive(Clone)]
pub struct AppState {
    pub registry: DeviceRegistry,
    pub health: HealthTracker,
}

type ApiError = (StatusCode, Json<Value>);
type ApiResult<T> = Result<T, ApiError>;

fn api_error(status: StatusCode, code: &str, msg: impl std::fmt::Display) -> ApiError {
    (status, Json(json!({ "ok": false, "error": code, "msg": msg.to_string() })))
}

fn registry_error(err: RegistryError) -> ApiError {
    let (status, code) = match &err {
        RegistryError::AlreadyConfigured { .. } => (StatusCode::CONFLICT, "already_configured"),
        RegistryError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        RegistryError::NotReady { source: SetupError::Probe(v), .. } => match v {
            ValidateError::InvalidHost { .. } => (StatusCode::BAD_REQUEST, v.code()),
            ValidateError::CannotConnect { .. } => (StatusCode::BAD_GATEWAY, v.code()),
        },
        RegistryError::NotReady { source: SetupError::FirstRefresh(_), .. } => {
            (StatusCode::SERVICE_UNAVAILABLE, "not_ready")
        }
    };
    api_error(status, code, err)
}

fn entity_error(err: EntityError) -> ApiError {
    let (status, code) = match &err {
        EntityError::Unsupported { .. } => (StatusCode::BAD_REQUEST, "unsupported"),
        EntityError::InvalidValue(_) => (StatusCode::BAD_REQUEST, "invalid_value"),
        EntityError::Device(ClientError::OutOfRange { .. }) => (StatusCode::BAD_REQUEST, "invalid_value"),
        EntityError::Device(_) => (StatusCode::BAD_GATEWAY, "device_error"),
    };
    api_error(status, code, err)
}

#[derive(Serialize)]
struct EntityView<'a> {
    #[serde(flatten)]
    descriptor: &'a EntityDescriptor,
    #[serde(flatten)]
    state: EntityState,
}

fn to_view<'a>(entity: &'a dyn Readable, status: &CoordinatorStatus) -> EntityView<'a> {
    EntityView {
        descriptor: entity.descriptor(),
        state: entity.read(status),
    }
}

#[derive(Debug, Deserialize)]
struct NewEntry {
    host: String,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResetCartridgeCall {
    bus_id: i64,
    entry_id: Option<String>,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/entries", get(list_entries).post(add_entry))
        .route("/entries/{id}", get(get_entry).delete(remove_entry))
        .route("/entries/{id}/snapshot", get(get_snapshot))
        .route("/entries/{id}/refresh", post(refresh_entry))
        .route("/entries/{id}/entities", get(list_entities))
        .route("/entries/{id}/entities/{unique_id}", get(get_entity).post(set_entity))
        .route("/services/reset_cartridge", post(reset_cartridge))
        .with_state(app_state)
}

fn lookup(app: &AppState, id: &str) -> ApiResult<Arc<DeviceEntry>> {
    app.registry
        .get(id)
        .ok_or_else(|| registry_error(RegistryError::NotFound(id.to_string())))
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<BridgeHealth> {
    Json(app.health.get_health(&app.registry))
}

// GET /entries
async fn list_entries(State(app): State<AppState>) -> Json<Vec<EntryView>> {
    Json(app.registry.list().iter().map(|e| e.view()).collect())
}

// GET /entries/{id}
async fn get_entry(State(app): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<EntryView>> {
    Ok(Json(lookup(&app, &id)?.view()))
}

// POST /entries
async fn add_entry(
    State(app): State<AppState>,
    Json(body): Json<Value>,
) -> ApiResult<(StatusCode, Json<EntryView>)> {
    let req: NewEntry = serde_json::from_value(body)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, "invalid_request", e))?;
    let host = req.host.trim();
    if host.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "invalid_request", "host is empty"));
    }

    let entry = app
        .registry
        .add(host, req.name.as_deref())
        .await
        .map_err(|e| {
            warn!(host, error = %e, "device entry rejected");
            registry_error(e)
        })?;
    Ok((StatusCode::CREATED, Json(entry.view())))
}

// DELETE /entries/{id}
async fn remove_entry(State(app): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    app.registry.unload_entry(&id).map_err(registry_error)?;
    Ok(Json(json!({ "ok": true, "entry_id": id })))
}

// GET /entries/{id}/snapshot
async fn get_snapshot(State(app): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<CoordinatorStatus>> {
    Ok(Json(lookup(&app, &id)?.coordinator.status()))
}

// POST /entries/{id}/refresh
async fn refresh_entry(State(app): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<CoordinatorStatus>> {
    let entry = lookup(&app, &id)?;
    entry
        .coordinator
        .request_refresh()
        .await
        .map_err(|e| api_error(StatusCode::SERVICE_UNAVAILABLE, "update_failed", e))?;
    Ok(Json(entry.coordinator.status()))
}

// GET /entries/{id}/entities
async fn list_entities(State(app): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    let entry = lookup(&app, &id)?;
    let status = entry.coordinator.status();
    let views: Vec<EntityView> = entry.entities.iter().map(|e| to_view(e.as_ref(), &status)).collect();
    Ok(Json(json!(views)))
}

// GET /entries/{id}/entities/{unique_id}
async fn get_entity(
    State(app): State<AppState>,
    Path((id, unique_id)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let entry = lookup(&app, &id)?;
    let entity = find_entity(&entry.entities, &unique_id)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "not_found", format!("no entity {unique_id}")))?;
    Ok(Json(json!(to_view(entity, &entry.coordinator.status()))))
}

// POST /entries/{id}/entities/{unique_id}
async fn set_entity(
    State(app): State<AppState>,
    Path((id, unique_id)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> ApiResult<Json<Value>> {
    let entry = lookup(&app, &id)?;
    let entity = find_entity(&entry.entities, &unique_id)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "not_found", format!("no entity {unique_id}")))?;
    let request: SetRequest = serde_json::from_value(body)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, "invalid_request", e))?;

    apply_request(entity, &entry.coordinator, &request)
        .await
        .map_err(entity_error)?;
    Ok(Json(json!(to_view(entity, &entry.coordinator.status()))))
}

// POST /services/reset_cartridge
async fn reset_cartridge(State(app): State<AppState>, Json(body): Json<Value>) -> ApiResult<Json<Value>> {
    let call: ResetCartridgeCall = serde_json::from_value(body)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, "invalid_request", e))?;
    let bus = u8::try_from(call.bus_id)
        .ok()
        .and_then(|n| BusId::try_from(n).ok())
        .ok_or_else(|| {
            api_error(StatusCode::BAD_REQUEST, "invalid_bus", format!("bus_id must be 0 or 1, got {}", call.bus_id))
        })?;

    let reset = app
        .registry
        .reset_cartridge(bus, call.entry_id.as_deref())
        .await
        .map_err(registry_error)?;
    Ok(Json(json!({ "ok": true, "bus_id": bus, "entries_reset": reset })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use repelbridge_devkit::{payloads, FakeDevice, Fault};
    use std::time::Duration;
    use tokio::net::TcpListener;

    struct Harness {
        base: String,
        registry: DeviceRegistry,
        http: reqwest::Client,
    }

    impl Harness {
        async fn start() -> Self {
            let registry = DeviceRegistry::new(reqwest::Client::new(), Duration::from_secs(60), Duration::from_millis(300));
            let app = build_router(AppState {
                registry: registry.clone(),
                health: HealthTracker::new(),
            });
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                axum::serve(listener, app).await.unwrap();
            });
            Self {
                base: format!("http://{addr}"),
                registry,
                http: reqwest::Client::new(),
            }
        }

        async fn get(&self, path: &str) -> (u16, Value) {
            let resp = self.http.get(format!("{}{}", self.base, path)).send().await.unwrap();
            let status = resp.status().as_u16();
            (status, resp.json().await.unwrap_or(Value::Null))
        }

        async fn post(&self, path: &str, body: Value) -> (u16, Value) {
            let resp = self
                .http
                .post(format!("{}{}", self.base, path))
                .json(&body)
                .send()
                .await
                .unwrap();
            let status = resp.status().as_u16();
            (status, resp.json().await.unwrap_or(Value::Null))
        }
    }

    #[tokio::test]
    async fn health_is_open() {
        let h = Harness::start().await;
        let resp = h.http.get(format!("{}/health", h.base)).send().await.unwrap();
        assert_eq!(resp.text().await.unwrap(), "ok");

        let (code, body) = h.get("/system/health").await;
        assert_eq!(code, 200);
        assert_eq!(body["entries"], 0);
    }

    #[tokio::test]
    async fn add_list_and_remove_entry() {
        let device = FakeDevice::start().await.unwrap();
        let h = Harness::start().await;

        let (code, body) = h.post("/entries", json!({"host": device.host(), "name": "Porch"})).await;
        assert_eq!(code, 201);
        assert_eq!(body["title"], "Porch");
        assert_eq!(body["available"], true);
        let id = body["entry_id"].as_str().unwrap().to_string();

        let (_, list) = h.get("/entries").await;
        assert_eq!(list.as_array().unwrap().len(), 1);

        let (code, _) = h.post("/entries", json!({"host": device.host()})).await;
        assert_eq!(code, 409);

        let resp = h.http.delete(format!("{}/entries/{id}", h.base)).send().await.unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        let (code, body) = h.get(&format!("/entries/{id}")).await;
        assert_eq!(code, 404);
        assert_eq!(body["error"], "not_found");
    }

    #[tokio::test]
    async fn add_maps_probe_failures() {
        let foreign = FakeDevice::start().await.unwrap();
        foreign.inject("/api/system/status", Fault::Body(payloads::foreign_status()));
        let broken = FakeDevice::start().await.unwrap();
        broken.inject("/api/system/status", Fault::Status(500));
        let h = Harness::start().await;

        let (code, body) = h.post("/entries", json!({"host": foreign.host()})).await;
        assert_eq!(code, 400);
        assert_eq!(body["error"], "invalid_host");

        let (code, body) = h.post("/entries", json!({"host": broken.host()})).await;
        assert_eq!(code, 502);
        assert_eq!(body["error"], "cannot_connect");

        let (code, _) = h.post("/entries", json!({"name": "no host"})).await;
        assert_eq!(code, 400);
        assert!(h.registry.is_empty());
    }

    #[tokio::test]
    async fn snapshot_and_refresh() {
        let device = FakeDevice::start().await.unwrap();
        let h = Harness::start().await;
        h.registry.setup_entry("e", &device.host(), None).await.unwrap();

        let (code, body) = h.get("/entries/e/snapshot").await;
        assert_eq!(code, 200);
        assert_eq!(body["last_update_success"], true);
        assert_eq!(body["snapshot"]["buses"]["1"]["status"]["state"], "running");

        device.inject("/api/system/status", Fault::Status(500));
        let (code, body) = h.post("/entries/e/refresh", json!({})).await;
        assert_eq!(code, 503);
        assert_eq!(body["error"], "update_failed");

        let (_, body) = h.get("/entries/e/entities/e_bus_0_light").await;
        assert_eq!(body["available"], false);
    }

    #[tokio::test]
    async fn entities_read_and_write() {
        let device = FakeDevice::start().await.unwrap();
        let h = Harness::start().await;
        h.registry.setup_entry("e", &device.host(), Some("Garden")).await.unwrap();

        let (_, list) = h.get("/entries/e/entities").await;
        assert_eq!(list.as_array().unwrap().len(), 20);

        let (code, body) = h.get("/entries/e/entities/e_bus_0_light").await;
        assert_eq!(code, 200);
        assert_eq!(body["name"], "Garden Bus 0");
        assert_eq!(body["state"], "off");

        let (code, body) = h
            .post("/entries/e/entities/e_bus_0_light", json!({"action": "turn_on", "brightness": 255}))
            .await;
        assert_eq!(code, 200);
        assert_eq!(body["state"], "on");
        assert_eq!(body["attributes"]["brightness"], 254);
        assert!(device.bus_state(0).powered);

        let (code, _) = h.get("/entries/e/entities/e_bus_7_light").await;
        assert_eq!(code, 404);
    }

    #[tokio::test]
    async fn static_and_state_icons_use_distinct_keys() {
        let device = FakeDevice::start().await.unwrap();
        let h = Harness::start().await;
        h.registry.setup_entry("e", &device.host(), None).await.unwrap();

        let (_, button) = h.get("/entries/e/entities/e_bus_0_reset_cartridge").await;
        assert_eq!(button["icon"], "mdi:restore");
        assert!(button.get("state_icon").is_none());

        // bus 1 starts at 4% left
        let (_, low) = h.get("/entries/e/entities/e_bus_1_cartridge_low").await;
        assert_eq!(low["state"], "on");
        assert_eq!(low["state_icon"], "mdi:battery-alert");
        assert!(low.get("icon").is_none());
    }

    #[tokio::test]
    async fn invalid_entity_requests_send_nothing() {
        let device = FakeDevice::start().await.unwrap();
        let h = Harness::start().await;
        h.registry.setup_entry("e", &device.host(), None).await.unwrap();
        device.clear_requests();

        let (code, body) = h
            .post("/entries/e/entities/e_bus_1_auto_shutoff", json!({"action": "set_value", "value": 2000}))
            .await;
        assert_eq!(code, 400);
        assert_eq!(body["error"], "invalid_value");

        let (code, body) = h.post("/entries/e/entities/e_uptime", json!({"action": "press"})).await;
        assert_eq!(code, 400);
        assert_eq!(body["error"], "unsupported");

        let (code, _) = h.post("/entries/e/entities/e_bus_1_light", json!({"action": "dance"})).await;
        assert_eq!(code, 400);
        assert_eq!(device.total_requests(), 0);
    }

    #[tokio::test]
    async fn device_failure_is_bad_gateway() {
        let device = FakeDevice::start().await.unwrap();
        let h = Harness::start().await;
        h.registry.setup_entry("e", &device.host(), None).await.unwrap();
        device.inject("/api/bus/0/power", Fault::Status(500));

        let (code, body) = h.post("/entries/e/entities/e_bus_0_power", json!({"action": "turn_off"})).await;
        assert_eq!(code, 502);
        assert_eq!(body["error"], "device_error");
    }

    #[tokio::test]
    async fn reset_cartridge_service() {
        let device = FakeDevice::start().await.unwrap();
        let h = Harness::start().await;
        h.registry.setup_entry("e", &device.host(), None).await.unwrap();

        let (code, body) = h.post("/services/reset_cartridge", json!({"bus_id": 2})).await;
        assert_eq!(code, 400);
        assert_eq!(body["error"], "invalid_bus");
        let (code, _) = h.post("/services/reset_cartridge", json!({"bus_id": -1})).await;
        assert_eq!(code, 400);
        assert_eq!(device.request_count("POST", "/api/bus/1/cartridge/reset"), 0);

        let (code, body) = h.post("/services/reset_cartridge", json!({"bus_id": 1})).await;
        assert_eq!(code, 200);
        assert_eq!(body["entries_reset"], 1);
        assert_eq!(device.request_count("POST", "/api/bus/1/cartridge/reset"), 1);

        let (code, _) = h
            .post("/services/reset_cartridge", json!({"bus_id": 0, "entry_id": "nope"}))
            .await;
        assert_eq!(code, 404);
    }
}
