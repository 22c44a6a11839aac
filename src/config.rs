//! Runtime configuration: YAML file with defaults for every field, plus
//! a small set of environment overrides for credentials that should not
//! live in the file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use pagepulse_attribute_center::AttributeConfig;
use pagepulse_session_center::SessionConfig;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub thinking_data: ThinkingDataConfig,
    pub session: SessionConfig,
    pub attributes: AttributeConfig,
    pub modules: ModulesConfig,
    pub click: ClickRules,
    pub scroll: ScrollRules,
    pub form: FormRules,
    pub storage: StorageConfig,
    pub search_console: SearchConsoleSettings,
    pub debug: bool,
}

/// Ingestion endpoint settings shared by the browser-side sink and the
/// batch reporting bridge.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ThinkingDataConfig {
    pub app_id: String,
    pub server_url: String,
    pub endpoint_path: String,
    pub batch_size: usize,
    pub timeout_ms: u64,
    /// Wire the live sink into the dispatcher at startup. Off keeps the
    /// dispatcher gated, which is what the replay/test paths want.
    pub auto_track: bool,
}

impl Default for ThinkingDataConfig {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            server_url: "https://receiver.thinkingdata.example".to_string(),
            endpoint_path: "/sync_json".to_string(),
            batch_size: 20,
            timeout_ms: 10_000,
            auto_track: false,
        }
    }
}

/// Per-category tracker switches.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ModulesConfig {
    pub click: bool,
    pub scroll: bool,
    pub form: bool,
    pub popup: bool,
    pub resource: bool,
    pub video: bool,
    pub page_view: bool,
    pub exit: bool,
}

impl Default for ModulesConfig {
    fn default() -> Self {
        Self {
            click: true,
            scroll: true,
            form: true,
            popup: true,
            resource: true,
            video: true,
            page_view: true,
            exit: true,
        }
    }
}

/// Classification tables for click events.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClickRules {
    /// Extensions that mark a link as a download, without the dot.
    pub download_extensions: Vec<String>,
    pub cta_classes: Vec<String>,
    pub nav_classes: Vec<String>,
    /// Hosts treated as internal; anything else with an http(s) href is
    /// an external link.
    pub internal_hosts: Vec<String>,
}

impl Default for ClickRules {
    fn default() -> Self {
        Self {
            download_extensions: ["pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx", "zip"]
                .map(str::to_string)
                .to_vec(),
            cta_classes: ["btn-primary", "cta", "contact-button"]
                .map(str::to_string)
                .to_vec(),
            nav_classes: ["nav-link", "menu-item"].map(str::to_string).to_vec(),
            internal_hosts: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrollRules {
    /// Depth percentages reported once each per page, ascending.
    pub thresholds: Vec<u8>,
    /// Dwell seconds below which a page counts as a surface read.
    pub surface_dwell_secs: u64,
    /// Dwell seconds at or above which a page counts as a deep read.
    pub deep_dwell_secs: u64,
}

impl Default for ScrollRules {
    fn default() -> Self {
        Self {
            thresholds: vec![25, 50, 75, 100],
            surface_dwell_secs: 15,
            deep_dwell_secs: 120,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FormRules {
    /// Form ids excluded from tracking (e.g. search boxes).
    pub ignored_form_ids: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backing file for visitor state; in-memory when unset.
    pub path: Option<PathBuf>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConsoleSettings {
    pub site_url: String,
    pub api_base: String,
    /// Usually supplied via `PAGEPULSE_GSC_TOKEN` instead of the file.
    pub access_token: String,
    pub dimensions: Vec<String>,
    pub row_limit: u32,
    pub timeout_ms: u64,
    /// Days the API lags behind; `collect --mode daily` targets
    /// `today - lag_days` by default.
    pub lag_days: u32,
}

impl Default for SearchConsoleSettings {
    fn default() -> Self {
        Self {
            site_url: String::new(),
            api_base: "https://www.googleapis.com/webmasters/v3".to_string(),
            access_token: String::new(),
            dimensions: vec!["query".to_string(), "page".to_string()],
            row_limit: 1000,
            timeout_ms: 30_000,
            lag_days: 2,
        }
    }
}

impl Config {
    /// Load from an explicit path (must parse), the default location
    /// (ignored when absent), or defaults, then apply env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match default_config_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(app_id) = std::env::var("PAGEPULSE_APP_ID") {
            self.thinking_data.app_id = app_id;
        }
        if let Ok(server_url) = std::env::var("PAGEPULSE_SERVER_URL") {
            self.thinking_data.server_url = server_url;
        }
        if let Ok(token) = std::env::var("PAGEPULSE_GSC_TOKEN") {
            self.search_console.access_token = token;
        }
        if let Ok(site) = std::env::var("PAGEPULSE_GSC_SITE") {
            self.search_console.site_url = site;
        }
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("pagepulse").join("config.yaml"))
}
