/**
 * DEVICE CLIENT - HTTP wrapper around the RepelBridge controller API
 *
 * ROLE : one logical operation = one HTTP request against `http://<host>`.
 * Decodes JSON bodies, turns any non-2xx into an error, never retries.
 *
 * The underlying reqwest::Client (connection pool) belongs to the host
 * application; DeviceClient only borrows it and is cheap to clone.
 */

use crate::models::{AutoShutoff, BusId, BusStatus, CartridgeStatus, Color, SystemStatus, WarnAt};
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

pub const MAX_BRIGHTNESS: u8 = 254;
pub const MAX_AUTO_SHUTOFF_MINUTES: u16 = 960;
pub const MIN_WARN_AT_HOURS: u32 = 1;
pub const MAX_WARN_AT_HOURS: u32 = 1000;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("invalid JSON from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{field} must be within {min}..={max}, got {value}")]
    OutOfRange {
        field: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },
}

impl ClientError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::Transport { source, .. } if source.is_timeout())
    }
}

/// Mutating operations, so callers can queue several and run them in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    SetPower { bus: BusId, on: bool },
    SetBrightness { bus: BusId, value: u16 },
    SetColor { bus: BusId, color: Color },
    SetAutoShutoff { bus: BusId, minutes: u16 },
    SetWarnAt { bus: BusId, hours: u32 },
    ResetCartridge { bus: BusId },
}

impl DeviceCommand {
    pub fn bus(&self) -> BusId {
        match self {
            DeviceCommand::SetPower { bus, .. }
            | DeviceCommand::SetBrightness { bus, .. }
            | DeviceCommand::SetColor { bus, .. }
            | DeviceCommand::SetAutoShutoff { bus, .. }
            | DeviceCommand::SetWarnAt { bus, .. }
            | DeviceCommand::ResetCartridge { bus } => *bus,
        }
    }
}

#[derive(Clone)]
pub struct DeviceClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl DeviceClient {
    pub fn new(http: reqwest::Client, host: &str, timeout: Duration) -> Self {
        Self {
            http,
            base_url: format!("http://{}", host.trim_end_matches('/')),
            timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    // ============ READS ============

    pub async fn get_system_status(&self) -> Result<SystemStatus, ClientError> {
        self.get("/api/system/status").await
    }

    pub async fn get_bus_status(&self, bus: BusId) -> Result<BusStatus, ClientError> {
        self.get(&format!("/api/bus/{bus}/status")).await
    }

    pub async fn get_cartridge_status(&self, bus: BusId) -> Result<CartridgeStatus, ClientError> {
        self.get(&format!("/api/bus/{bus}/cartridge")).await
    }

    pub async fn get_auto_shutoff(&self, bus: BusId) -> Result<AutoShutoff, ClientError> {
        self.get(&format!("/api/bus/{bus}/auto_shutoff")).await
    }

    pub async fn get_warn_at(&self, bus: BusId) -> Result<WarnAt, ClientError> {
        self.get(&format!("/api/bus/{bus}/warn_at")).await
    }

    // ============ WRITES ============

    pub async fn set_power(&self, bus: BusId, on: bool) -> Result<Value, ClientError> {
        let state = if on { "true" } else { "false" };
        let req = self
            .request(Method::POST, &format!("/api/bus/{bus}/power"))
            .form(&[("state", state)]);
        self.send(req, &format!("/api/bus/{bus}/power")).await
    }

    /// Values above the device maximum are clamped to 254, not rejected.
    pub async fn set_brightness(&self, bus: BusId, value: u16) -> Result<Value, ClientError> {
        let clamped = value.min(MAX_BRIGHTNESS as u16);
        if clamped != value {
            debug!(bus = %bus, requested = value, sent = clamped, "brightness clamped to device range");
        }
        let path = format!("/api/bus/{bus}/brightness");
        let req = self
            .request(Method::POST, &path)
            .form(&[("value", clamped.to_string())]);
        self.send(req, &path).await
    }

    pub async fn set_color(&self, bus: BusId, color: Color) -> Result<Value, ClientError> {
        let path = format!("/api/bus/{bus}/color");
        let req = self.request(Method::POST, &path).form(&[
            ("red", color.red.to_string()),
            ("green", color.green.to_string()),
            ("blue", color.blue.to_string()),
        ]);
        self.send(req, &path).await
    }

    pub async fn reset_cartridge(&self, bus: BusId) -> Result<Value, ClientError> {
        let path = format!("/api/bus/{bus}/cartridge/reset");
        let req = self.request(Method::POST, &path);
        self.send(req, &path).await
    }

    pub async fn set_auto_shutoff(&self, bus: BusId, minutes: u16) -> Result<Value, ClientError> {
        check_range("auto_shutoff_minutes", minutes as i64, 0, MAX_AUTO_SHUTOFF_MINUTES as i64)?;
        let path = format!("/api/bus/{bus}/auto_shutoff");
        let req = self
            .request(Method::POST, &path)
            .json(&serde_json::json!({ "minutes": minutes }));
        self.send(req, &path).await
    }

    pub async fn set_warn_at(&self, bus: BusId, hours: u32) -> Result<Value, ClientError> {
        check_range(
            "warn_at_hours",
            hours as i64,
            MIN_WARN_AT_HOURS as i64,
            MAX_WARN_AT_HOURS as i64,
        )?;
        let path = format!("/api/bus/{bus}/warn_at");
        let req = self
            .request(Method::POST, &path)
            .json(&serde_json::json!({ "hours": hours }));
        self.send(req, &path).await
    }

    pub async fn execute(&self, command: &DeviceCommand) -> Result<Value, ClientError> {
        match *command {
            DeviceCommand::SetPower { bus, on } => self.set_power(bus, on).await,
            DeviceCommand::SetBrightness { bus, value } => self.set_brightness(bus, value).await,
            DeviceCommand::SetColor { bus, color } => self.set_color(bus, color).await,
            DeviceCommand::SetAutoShutoff { bus, minutes } => self.set_auto_shutoff(bus, minutes).await,
            DeviceCommand::SetWarnAt { bus, hours } => self.set_warn_at(bus, hours).await,
            DeviceCommand::ResetCartridge { bus } => self.reset_cartridge(bus).await,
        }
    }

    // ============ PLUMBING ============

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .timeout(self.timeout)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let req = self.request(Method::GET, path);
        let body = self.send_raw(req, path).await?;
        serde_json::from_slice(&body).map_err(|source| ClientError::Decode {
            url: self.url(path),
            source,
        })
    }

    async fn send(&self, req: RequestBuilder, path: &str) -> Result<Value, ClientError> {
        let body = self.send_raw(req, path).await?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&body).map_err(|source| ClientError::Decode {
            url: self.url(path),
            source,
        })
    }

    async fn send_raw(&self, req: RequestBuilder, path: &str) -> Result<Vec<u8>, ClientError> {
        let url = self.url(path);
        debug!(url = %url, "device request");
        let response = req.send().await.map_err(|source| ClientError::Transport {
            url: url.clone(),
            source,
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Status {
                url,
                status: status.as_u16(),
            });
        }
        let body = response
            .bytes()
            .await
            .map_err(|source| ClientError::Transport { url, source })?;
        Ok(body.to_vec())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn check_range(field: &'static str, value: i64, min: i64, max: i64) -> Result<(), ClientError> {
    if value < min || value > max {
        return Err(ClientError::OutOfRange { field, value, min, max });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use repelbridge_devkit::{FakeDevice, Fault};

    fn client_for(device: &FakeDevice) -> DeviceClient {
        DeviceClient::new(reqwest::Client::new(), &device.host(), Duration::from_millis(500))
    }

    fn bus(n: u8) -> BusId {
        BusId::try_from(n).unwrap()
    }

    #[tokio::test]
    async fn reads_system_status() {
        let device = FakeDevice::start().await.unwrap();
        let client = client_for(&device);

        let sys = client.get_system_status().await.unwrap();
        assert_eq!(sys.device_name, "Liv1");
        assert_eq!(device.request_count("GET", "/api/system/status"), 1);
    }

    #[tokio::test]
    async fn non_2xx_is_a_status_error() {
        let device = FakeDevice::start().await.unwrap();
        device.inject("/api/bus/1/cartridge", Fault::Status(500));
        let client = client_for(&device);

        let err = client.get_cartridge_status(bus(1)).await.unwrap_err();
        assert!(matches!(err, ClientError::Status { status: 500, .. }));
        // no retry
        assert_eq!(device.request_count("GET", "/api/bus/1/cartridge"), 1);
    }

    #[tokio::test]
    async fn malformed_json_is_a_decode_error() {
        let device = FakeDevice::start().await.unwrap();
        device.inject("/api/bus/0/status", Fault::Body("{not json".into()));
        let client = client_for(&device);

        let err = client.get_bus_status(bus(0)).await.unwrap_err();
        assert!(matches!(err, ClientError::Decode { .. }));
    }

    #[tokio::test]
    async fn slow_device_times_out() {
        let device = FakeDevice::start().await.unwrap();
        device.inject("/api/system/status", Fault::Delay(Duration::from_secs(2)));
        let client = client_for(&device);

        let err = client.get_system_status().await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn power_is_sent_as_form() {
        let device = FakeDevice::start().await.unwrap();
        let client = client_for(&device);

        client.set_power(bus(0), true).await.unwrap();
        let req = device.last_request("POST", "/api/bus/0/power").unwrap();
        assert_eq!(req.body, "state=true");
        assert!(device.bus_state(0).powered);
    }

    #[tokio::test]
    async fn brightness_above_device_range_is_clamped() {
        let device = FakeDevice::start().await.unwrap();
        let client = client_for(&device);

        client.set_brightness(bus(0), 300).await.unwrap();
        let req = device.last_request("POST", "/api/bus/0/brightness").unwrap();
        assert_eq!(req.body, "value=254");
    }

    #[tokio::test]
    async fn color_sends_three_fields() {
        let device = FakeDevice::start().await.unwrap();
        let client = client_for(&device);

        let color = Color { red: 10, green: 20, blue: 30 };
        client.set_color(bus(1), color).await.unwrap();
        let req = device.last_request("POST", "/api/bus/1/color").unwrap();
        assert_eq!(req.body, "red=10&green=20&blue=30");
    }

    #[tokio::test]
    async fn auto_shutoff_uses_json_and_rejects_out_of_range() {
        let device = FakeDevice::start().await.unwrap();
        let client = client_for(&device);

        client.set_auto_shutoff(bus(1), 0).await.unwrap();
        let req = device.last_request("POST", "/api/bus/1/auto_shutoff").unwrap();
        assert_eq!(req.content_type.as_deref(), Some("application/json"));
        assert_eq!(serde_json::from_str::<Value>(&req.body).unwrap()["minutes"], 0);

        let err = client.set_auto_shutoff(bus(1), 961).await.unwrap_err();
        assert!(matches!(err, ClientError::OutOfRange { field: "auto_shutoff_minutes", .. }));
        assert_eq!(device.request_count("POST", "/api/bus/1/auto_shutoff"), 1);
    }

    #[tokio::test]
    async fn warn_at_rejects_zero_hours() {
        let device = FakeDevice::start().await.unwrap();
        let client = client_for(&device);

        assert!(client.set_warn_at(bus(0), 0).await.is_err());
        assert_eq!(device.request_count("POST", "/api/bus/0/warn_at"), 0);

        client.set_warn_at(bus(0), 120).await.unwrap();
        assert_eq!(device.warn_at_hours(0), 120);
    }

    #[tokio::test]
    async fn empty_success_body_is_null() {
        let device = FakeDevice::start().await.unwrap();
        device.inject("/api/bus/0/cartridge/reset", Fault::Body(String::new()));
        let client = client_for(&device);

        let value = client.reset_cartridge(bus(0)).await.unwrap();
        assert!(value.is_null());
    }

    #[tokio::test]
    async fn execute_dispatches_each_command_once() {
        let device = FakeDevice::start().await.unwrap();
        let client = client_for(&device);

        client
            .execute(&DeviceCommand::ResetCartridge { bus: bus(1) })
            .await
            .unwrap();
        assert_eq!(device.request_count("POST", "/api/bus/1/cartridge/reset"), 1);
        assert_eq!(device.cartridge_state(1).percent_left, 100);
    }
}
