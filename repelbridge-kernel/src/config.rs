use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

pub const DEFAULT_NAME: &str = "RepelBridge";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BridgeConfig {
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub http: HttpConf,
    /// entry id -> device
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceConf>,
    pub mqtt: Option<MqttConf>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DeviceConf {
    pub host: String,
    #[serde(default = "default_name")]
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct HttpConf {
    pub bind: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
}

fn default_scan_interval() -> u64 { 30 }
fn default_request_timeout() -> u64 { 10 }
fn default_name() -> String { DEFAULT_NAME.to_string() }

impl Default for HttpConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8080".into() }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: default_scan_interval(),
            request_timeout_secs: default_request_timeout(),
            http: HttpConf::default(),
            devices: BTreeMap::new(),
            mqtt: None,
        }
    }
}

impl BridgeConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

pub fn parse_config(txt: &str) -> Result<BridgeConfig, ConfigError> {
    if txt.trim().is_empty() {
        return Ok(BridgeConfig::default());
    }
    Ok(serde_yaml::from_str(txt)?)
}

pub async fn read_config(path: &Path) -> Result<BridgeConfig, ConfigError> {
    let txt = fs::read_to_string(path).await.map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_config(&txt)
}

/// Reads `REPELBRIDGE_CONFIG` (default `repelbridge.yaml`). A missing or
/// broken file falls back to defaults so the API still comes up.
pub async fn load_config() -> BridgeConfig {
    let path = std::env::var("REPELBRIDGE_CONFIG").unwrap_or_else(|_| "repelbridge.yaml".into());
    let path = Path::new(&path);
    if !path.exists() {
        info!(path = %path.display(), "no config file, using defaults");
        return BridgeConfig::default();
    }
    read_config(path).await.unwrap_or_else(|e| {
        warn!(error = %e, "config ignored, using defaults");
        BridgeConfig::default()
    })
}
