use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::paths::Paths;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserConfig {
    /// Explicit Chrome/Chromium binary. Searched on PATH when unset.
    #[serde(default)]
    pub executable: Option<String>,
    #[serde(default = "default_headless")]
    pub headless: bool,
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Attach to a browser already listening on this debugging port
    /// instead of launching one.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
}

fn default_headless() -> bool {
    true
}

fn default_startup_timeout_secs() -> u64 {
    15
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            executable: None,
            headless: default_headless(),
            extra_args: Vec::new(),
            port: None,
            startup_timeout_secs: default_startup_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolConfig {
    /// Timeout for ordinary protocol commands. 0 disables it.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    /// How long navigation may take to produce the page's execution context
    /// and load event. 0 disables it.
    #[serde(default = "default_page_load_timeout_secs")]
    pub page_load_timeout_secs: u64,
}

fn default_command_timeout_secs() -> u64 {
    30
}

fn default_page_load_timeout_secs() -> u64 {
    30
}

fn seconds(secs: u64) -> Option<Duration> {
    match secs {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: default_command_timeout_secs(),
            page_load_timeout_secs: default_page_load_timeout_secs(),
        }
    }
}

impl ProtocolConfig {
    pub fn command_timeout(&self) -> Option<Duration> {
        seconds(self.command_timeout_secs)
    }

    pub fn page_load_timeout(&self) -> Option<Duration> {
        seconds(self.page_load_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanConfig {
    /// Heap snapshot node type a watched instance must have.
    #[serde(default = "default_node_type")]
    pub node_type: String,
    /// Constructor names expected to be gone at every test boundary.
    #[serde(default = "default_watched_types")]
    pub watched_types: Vec<String>,
    #[serde(default)]
    pub stop_on_first_leak: bool,
    /// Truncate printed retaining paths to this many links. 0 prints them whole.
    #[serde(default)]
    pub max_path_length: usize,
}

fn default_node_type() -> String {
    "object".to_string()
}

fn default_watched_types() -> Vec<String> {
    vec!["Container".to_string()]
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            node_type: default_node_type(),
            watched_types: default_watched_types(),
            stop_on_first_leak: false,
            max_path_length: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub scan: ScanConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.scan.watched_types.iter().all(|t| t.trim().is_empty()) {
            return Err(Error::Config(
                "scan.watchedTypes must name at least one type".to_string(),
            ));
        }
        if self.scan.node_type.trim().is_empty() {
            return Err(Error::Config("scan.nodeType must not be empty".to_string()));
        }
        Ok(())
    }
}
