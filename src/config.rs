use crate::model::AlertSettings;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub engine: EngineConfig,
    /// Share-links registered into the store at startup.
    #[serde(default)]
    pub links: Vec<String>,
    /// Initial alert settings; the singleton keeps its lazy defaults when
    /// this is absent.
    #[serde(default)]
    pub alert: Option<AlertSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_binary")]
    pub binary: String,
    /// Target URL probed through each session.
    #[serde(default = "default_test_url")]
    pub test_url: String,
    /// Fixed grace period the engine gets to bind its SOCKS inbound.
    #[serde(default = "default_startup_delay_ms")]
    pub startup_delay_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Tighter budget for live-monitor samples.
    #[serde(default = "default_monitor_timeout_ms")]
    pub monitor_timeout_ms: u64,
}

fn default_listen() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_binary() -> String {
    "/usr/local/bin/xray".to_string()
}

fn default_test_url() -> String {
    "https://www.google.com/generate_204".to_string()
}

fn default_startup_delay_ms() -> u64 {
    800
}

fn default_request_timeout_ms() -> u64 {
    8000
}

fn default_monitor_timeout_ms() -> u64 {
    500
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            test_url: default_test_url(),
            startup_delay_ms: default_startup_delay_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            monitor_timeout_ms: default_monitor_timeout_ms(),
        }
    }
}

impl EngineConfig {
    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn monitor_timeout(&self) -> Duration {
        Duration::from_millis(self.monitor_timeout_ms)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            engine: EngineConfig::default(),
            links: Vec::new(),
            alert: None,
        }
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if !path.exists() {
        tracing::info!("config file not found, creating default at {}", path.display());
        let defaults = AppConfig::default();
        save_config(path, &defaults)?;
        return Ok(defaults);
    }

    let content = fs::read_to_string(path).context("Failed to read config file")?;
    serde_json::from_str(&content).context("Failed to parse config file")
}

pub fn save_config(path: &Path, config: &AppConfig) -> anyhow::Result<()> {
    let content = serde_json::to_string_pretty(config)?;
    let tmp_file = path.with_extension("json.tmp");
    fs::write(&tmp_file, content).context("Failed to write temp config file")?;
    fs::rename(&tmp_file, path).context("Failed to replace config file")?;
    Ok(())
}
