use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;

/// Process-level settings, taken from the environment.
#[derive(Debug, Deserialize)]
pub struct AppSettings {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_config_path")]
    pub config_path: String,
}

fn default_bind_address() -> String {
    "0.0.0.0:8083".to_string()
}

fn default_config_path() -> String {
    "config.json".to_string()
}

impl AppSettings {
    pub fn new() -> Result<Self> {
        envy::from_env::<Self>().map_err(|e| anyhow::anyhow!(e))
    }
}

/// The gateway configuration file: the static stream map plus WebRTC
/// transport settings.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub streams: HashMap<String, SourceConfig>,
    #[serde(default)]
    pub webrtc: WebRtcConfig,
    /// Per-viewer queue depth; a viewer that falls this far behind starts
    /// dropping samples.
    #[serde(default = "default_viewer_queue")]
    pub viewer_queue: usize,
}

fn default_viewer_queue() -> usize {
    100
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            streams: HashMap::new(),
            webrtc: WebRtcConfig::default(),
            viewer_queue: default_viewer_queue(),
        }
    }
}

impl GatewayConfig {
    pub fn load(path: &str) -> Result<Self> {
        let raw = std::fs::read(path).with_context(|| format!("failed to read config {path}"))?;
        serde_json::from_slice(&raw).with_context(|| format!("failed to parse config {path}"))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub url: String,
    /// Connect only while viewers are present.
    #[serde(default)]
    pub on_demand: bool,
    #[serde(default)]
    pub disable_audio: bool,
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebRtcConfig {
    #[serde(default)]
    pub port_min: u16,
    #[serde(default)]
    pub port_max: u16,
    /// NAT 1:1 public addresses advertised as host candidates.
    #[serde(default)]
    pub host_ips: Vec<String>,
    #[serde(default)]
    pub ice_servers: Vec<String>,
    #[serde(default)]
    pub ice_username: String,
    #[serde(default)]
    pub ice_credential: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let raw = r#"{
            "streams": {
                "cam1": { "url": "rtsp://10.0.0.20/live" },
                "door": { "url": "rtsp://10.0.0.21/live", "on_demand": true, "disable_audio": true }
            },
            "webrtc": { "port_min": 50000, "port_max": 50100 }
        }"#;

        let config: GatewayConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.streams.len(), 2);
        assert!(!config.streams["cam1"].on_demand);
        assert!(config.streams["door"].on_demand);
        assert!(config.streams["door"].disable_audio);
        assert_eq!(config.webrtc.port_min, 50000);
        assert_eq!(config.viewer_queue, 100);
    }
}
