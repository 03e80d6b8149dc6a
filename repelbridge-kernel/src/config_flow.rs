//! Connectivity probe run before a device entry is created.
//!
//! A host is a RepelBridge only if `/api/system/status` answers 200 with a
//! JSON object carrying `device_name`.

use crate::config::DEFAULT_NAME;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{error, warn};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ValidateError {
    #[error("cannot connect to {host}: {reason}")]
    CannotConnect { host: String, reason: String },
    #[error("{host} is not a RepelBridge device")]
    InvalidHost { host: String },
}

impl ValidateError {
    /// Short code used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            ValidateError::CannotConnect { .. } => "cannot_connect",
            ValidateError::InvalidHost { .. } => "invalid_host",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DeviceInfo {
    pub title: String,
    pub host: String,
    pub device_name: String,
}

pub async fn validate_host(
    http: &reqwest::Client,
    host: &str,
    name: Option<&str>,
) -> Result<DeviceInfo, ValidateError> {
    let cannot_connect = |reason: String| ValidateError::CannotConnect {
        host: host.to_string(),
        reason,
    };

    let url = format!("http://{}/api/system/status", host.trim_end_matches('/'));
    let response = http
        .get(&url)
        .timeout(PROBE_TIMEOUT)
        .send()
        .await
        .map_err(|e| {
            error!(host, error = %e, "error connecting to RepelBridge");
            cannot_connect(e.to_string())
        })?;

    if response.status() != reqwest::StatusCode::OK {
        return Err(cannot_connect(format!("HTTP {}", response.status().as_u16())));
    }

    let body: Value = response.json().await.map_err(|e| {
        error!(host, error = %e, "unexpected answer from RepelBridge probe");
        cannot_connect(e.to_string())
    })?;

    let Some(fields) = body.as_object() else {
        return Err(cannot_connect("status is not a JSON object".into()));
    };
    let Some(device_name) = fields.get("device_name") else {
        warn!(host, "system status has no device_name");
        return Err(ValidateError::InvalidHost { host: host.to_string() });
    };

    Ok(DeviceInfo {
        title: name.unwrap_or(DEFAULT_NAME).to_string(),
        host: host.to_string(),
        device_name: device_name.as_str().unwrap_or_default().to_string(),
    })
}
