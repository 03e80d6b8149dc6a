/*!
Fake RepelBridge controller for tests without hardware

Serves the controller HTTP API on 127.0.0.1 with in-memory state:
- Every request is recorded (method, path, body, content type)
- Faults can be injected per path: HTTP status, raw body, delay
- Writes mutate the state so later reads see them, like the real firmware
*/

use crate::payloads;
use anyhow::Result;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SystemState {
    pub device_name: String,
    pub wifi_connected: bool,
    pub wifi_ssid: String,
    pub wifi_ip: String,
    pub free_heap: u64,
    pub uptime_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ColorState {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CartridgeState {
    pub percent_left: u8,
    pub runtime_hours: u64,
    pub active_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusState {
    pub powered: bool,
    pub brightness: u8,
    pub color: ColorState,
    pub state: String,
    pub repeller_count: u32,
    pub cartridge: CartridgeState,
    pub auto_shutoff_minutes: u16,
    pub warn_at_hours: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceState {
    pub system: SystemState,
    pub buses: [BusState; 2],
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            system: SystemState {
                device_name: "Liv1".into(),
                wifi_connected: true,
                wifi_ssid: "HomeNet".into(),
                wifi_ip: "192.168.1.40".into(),
                free_heap: 123_456,
                uptime_ms: 3_600_000,
            },
            buses: [
                BusState {
                    powered: false,
                    brightness: 128,
                    color: ColorState { red: 255, green: 0, blue: 0 },
                    state: "idle".into(),
                    repeller_count: 2,
                    cartridge: CartridgeState {
                        percent_left: 80,
                        runtime_hours: 20,
                        active_seconds: 72_000,
                    },
                    auto_shutoff_minutes: 120,
                    warn_at_hours: 97,
                },
                BusState {
                    powered: true,
                    brightness: 254,
                    color: ColorState { red: 0, green: 255, blue: 0 },
                    state: "running".into(),
                    repeller_count: 1,
                    cartridge: CartridgeState {
                        percent_left: 4,
                        runtime_hours: 95,
                        active_seconds: 342_000,
                    },
                    auto_shutoff_minutes: 240,
                    warn_at_hours: 97,
                },
            ],
        }
    }
}

/// Injected misbehaviour for one path. Stays until cleared.
#[derive(Debug, Clone)]
pub enum Fault {
    /// Answer with this status code.
    Status(u16),
    /// Answer 200 with this raw body.
    Body(String),
    /// Sleep before answering normally.
    Delay(Duration),
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub body: String,
    pub content_type: Option<String>,
}

struct Inner {
    state: Mutex<DeviceState>,
    faults: Mutex<HashMap<String, Fault>>,
    log: Mutex<Vec<RecordedRequest>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Decrements the in-flight counter even when the client hangs up early.
struct InFlight<'a>(&'a Inner);

impl<'a> InFlight<'a> {
    fn enter(inner: &'a Inner) -> Self {
        let now = inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        inner.max_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight(inner)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct FakeDevice {
    addr: SocketAddr,
    inner: Arc<Inner>,
    server: JoinHandle<()>,
}

impl FakeDevice {
    /// Starts a device with the default state on an ephemeral port.
    pub async fn start() -> Result<Self> {
        Self::start_with(DeviceState::default()).await
    }

    pub async fn start_with(state: DeviceState) -> Result<Self> {
        let _ = env_logger::builder().is_test(true).try_init();

        let inner = Arc::new(Inner {
            state: Mutex::new(state),
            faults: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        });

        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let addr = listener.local_addr()?;
        let app = Router::new().fallback(handle).with_state(inner.clone());

        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                log::error!("[fake-device] server stopped: {}", e);
            }
        });

        log::info!("🦟 [fake-device] listening on {}", addr);
        Ok(Self { addr, inner, server })
    }

    /// `host:port`, what the bridge stores as the device host.
    pub fn host(&self) -> String {
        self.addr.to_string()
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn inject(&self, path: &str, fault: Fault) {
        log::debug!("[fake-device] fault on {}: {:?}", path, fault);
        self.inner.faults.lock().insert(path.to_string(), fault);
    }

    pub fn clear_fault(&self, path: &str) {
        self.inner.faults.lock().remove(path);
    }

    pub fn clear_faults(&self) {
        self.inner.faults.lock().clear();
    }

    // ============ STATE ============

    pub fn state(&self) -> DeviceState {
        self.inner.state.lock().clone()
    }

    pub fn update<F: FnOnce(&mut DeviceState)>(&self, f: F) {
        f(&mut self.inner.state.lock());
    }

    pub fn bus_state(&self, bus: usize) -> BusState {
        self.inner.state.lock().buses[bus].clone()
    }

    pub fn cartridge_state(&self, bus: usize) -> CartridgeState {
        self.inner.state.lock().buses[bus].cartridge.clone()
    }

    pub fn warn_at_hours(&self, bus: usize) -> u32 {
        self.inner.state.lock().buses[bus].warn_at_hours
    }

    pub fn auto_shutoff_minutes(&self, bus: usize) -> u16 {
        self.inner.state.lock().buses[bus].auto_shutoff_minutes
    }

    pub fn set_powered(&self, bus: usize, on: bool) {
        self.inner.state.lock().buses[bus].powered = on;
    }

    // ============ REQUEST LOG ============

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.inner.log.lock().clone()
    }

    pub fn total_requests(&self) -> usize {
        self.inner.log.lock().len()
    }

    pub fn request_count(&self, method: &str, path: &str) -> usize {
        self.inner
            .log
            .lock()
            .iter()
            .filter(|r| r.method == method && r.path == path)
            .count()
    }

    pub fn last_request(&self, method: &str, path: &str) -> Option<RecordedRequest> {
        self.inner
            .log
            .lock()
            .iter()
            .rev()
            .find(|r| r.method == method && r.path == path)
            .cloned()
    }

    /// Highest number of requests the device was serving at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn clear_requests(&self) {
        self.inner.log.lock().clear();
    }

    /// Polls the log until `count` matching requests were seen.
    pub async fn wait_for_requests(&self, method: &str, path: &str, count: usize, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if self.request_count(method, path) >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        log::warn!("⏰ [fake-device] timeout waiting for {} x {} {}", count, method, path);
        false
    }
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn handle(
    State(inner): State<Arc<Inner>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let _guard = InFlight::enter(&inner);
    let path = uri.path().to_string();
    let body = String::from_utf8_lossy(&body).into_owned();

    inner.log.lock().push(RecordedRequest {
        method: method.to_string(),
        path: path.clone(),
        body: body.clone(),
        content_type: headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    });
    log::debug!("[fake-device] {} {} {}", method, path, body);

    let fault = inner.faults.lock().get(&path).cloned();
    match fault {
        Some(Fault::Status(code)) => {
            let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            return (status, Json(serde_json::json!({ "error": "injected" }))).into_response();
        }
        Some(Fault::Body(raw)) => {
            return (StatusCode::OK, [(header::CONTENT_TYPE, "application/json")], raw).into_response();
        }
        Some(Fault::Delay(d)) => tokio::time::sleep(d).await,
        None => {}
    }

    route(&inner, &method, &path, &body)
}

fn route(inner: &Inner, method: &Method, path: &str, body: &str) -> Response {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    let mut state = inner.state.lock();

    match (method.as_str(), segments.as_slice()) {
        ("GET", ["api", "system", "status"]) => Json(payloads::system_status(&state.system)).into_response(),
        (m, ["api", "bus", id, rest @ ..]) => {
            let Some(bus) = id.parse::<usize>().ok().filter(|b| *b < 2) else {
                return not_found();
            };
            let bus = &mut state.buses[bus];
            match (m, rest) {
                ("GET", ["status"]) => Json(payloads::bus_status(bus)).into_response(),
                ("GET", ["cartridge"]) => Json(payloads::cartridge(&bus.cartridge)).into_response(),
                ("GET", ["auto_shutoff"]) => Json(payloads::auto_shutoff(bus.auto_shutoff_minutes)).into_response(),
                ("GET", ["warn_at"]) => Json(payloads::warn_at(bus.warn_at_hours)).into_response(),
                ("POST", ["power"]) => match form_field(body, "state").as_deref() {
                    Some("true") => ok_with(|| bus.powered = true),
                    Some("false") => ok_with(|| bus.powered = false),
                    _ => bad_request(),
                },
                ("POST", ["brightness"]) => match form_field(body, "value").and_then(|v| v.parse::<u8>().ok()) {
                    Some(v) if v <= 254 => ok_with(|| bus.brightness = v),
                    _ => bad_request(),
                },
                ("POST", ["color"]) => {
                    let channel = |name| form_field(body, name).and_then(|v| v.parse::<u8>().ok());
                    match (channel("red"), channel("green"), channel("blue")) {
                        (Some(red), Some(green), Some(blue)) => {
                            ok_with(|| bus.color = ColorState { red, green, blue })
                        }
                        _ => bad_request(),
                    }
                }
                ("POST", ["cartridge", "reset"]) => ok_with(|| {
                    bus.cartridge = CartridgeState {
                        percent_left: 100,
                        runtime_hours: 0,
                        active_seconds: 0,
                    }
                }),
                ("POST", ["auto_shutoff"]) => match json_field(body, "minutes") {
                    Some(m) if m <= 960 => ok_with(|| bus.auto_shutoff_minutes = m as u16),
                    _ => bad_request(),
                },
                ("POST", ["warn_at"]) => match json_field(body, "hours") {
                    Some(h) if h >= 1 => ok_with(|| bus.warn_at_hours = h as u32),
                    _ => bad_request(),
                },
                _ => not_found(),
            }
        }
        _ => not_found(),
    }
}

fn form_field(body: &str, name: &str) -> Option<String> {
    body.split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.to_string())
}

fn json_field(body: &str, name: &str) -> Option<u64> {
    serde_json::from_str::<Value>(body).ok()?.get(name)?.as_u64()
}

fn ok_with<F: FnOnce()>(apply: F) -> Response {
    apply();
    Json(serde_json::json!({ "success": true })).into_response()
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(serde_json::json!({ "error": "not found" }))).into_response()
}

fn bad_request() -> Response {
    (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": "bad request" }))).into_response()
}
