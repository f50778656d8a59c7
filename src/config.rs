//! Configuration loading and persistence.
//!
//! Reads `config.json` from the webtty configuration directory and layers
//! `WEBTTY_*` environment variables on top.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::{
    CLOSE_MESSAGE_TIMEOUT, DEFAULT_MAX_SESSIONS, DEFAULT_SESSION_WINDOW_MINUTES, KEEPALIVE_INTERVAL,
};
use crate::session::ControllerOptions;

const CONFIG_FILE: &str = "config.json";

/// Configuration for the webtty client.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Page URL of the webtty server; the socket lives at `<url>/ws`.
    pub server_url: String,
    /// Maximum number of sessions open at once.
    pub max_sessions: u32,
    /// Admission window in minutes.
    pub session_window_minutes: u32,
    /// Seconds between keep-alive pings.
    pub ping_interval_secs: u64,
    /// How long the "Connection Closed" status stays up.
    pub close_message_timeout_ms: u64,
    /// JSONL file mirroring session traffic.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telemetry_path: Option<PathBuf>,
    /// Base URL for peer share links (`<base>?jid=<id>`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub share_base_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8080".to_string(),
            max_sessions: DEFAULT_MAX_SESSIONS,
            session_window_minutes: DEFAULT_SESSION_WINDOW_MINUTES,
            ping_interval_secs: KEEPALIVE_INTERVAL.as_secs(),
            close_message_timeout_ms: CLOSE_MESSAGE_TIMEOUT.as_millis() as u64,
            telemetry_path: None,
            share_base_url: None,
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// `WEBTTY_CONFIG_DIR` overrides the platform config directory
    /// (Linux: `~/.config/webtty`).
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("WEBTTY_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("webtty")
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration from file, with environment variable overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_dir()?)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Loads `config.json` from `dir`, or defaults when it does not exist.
    pub fn load_from(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            log::debug!("[config] No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("invalid config {}", path.display()))
    }

    /// Apply `WEBTTY_*` overrides read through `var`. Unparseable numbers are ignored.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(server_url) = var("WEBTTY_SERVER_URL") {
            self.server_url = server_url;
        }

        if let Some(max_sessions) = var("WEBTTY_MAX_SESSIONS") {
            match max_sessions.parse::<u32>() {
                Ok(max) => self.max_sessions = max,
                Err(_) => log::warn!("[config] Ignoring WEBTTY_MAX_SESSIONS={max_sessions:?}"),
            }
        }

        if let Some(window) = var("WEBTTY_SESSION_WINDOW_MINUTES") {
            match window.parse::<u32>() {
                Ok(minutes) => self.session_window_minutes = minutes,
                Err(_) => log::warn!("[config] Ignoring WEBTTY_SESSION_WINDOW_MINUTES={window:?}"),
            }
        }

        if let Some(path) = var("WEBTTY_TELEMETRY_PATH") {
            self.telemetry_path = (!path.is_empty()).then(|| PathBuf::from(path));
        }
    }

    /// Persists the configuration to `config.json`.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_dir()?)
    }

    /// Persists the configuration to `config.json` in `dir`.
    pub fn save_to(&self, dir: &Path) -> Result<()> {
        let path = dir.join(CONFIG_FILE);
        fs::write(&path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    /// Controller timing derived from this configuration.
    pub fn controller_options(&self) -> ControllerOptions {
        ControllerOptions {
            keepalive_interval: Duration::from_secs(self.ping_interval_secs.max(1)),
            close_message_timeout: Duration::from_millis(self.close_message_timeout_ms),
        }
    }

    /// Share link for a peer identifier, when a share base is configured.
    pub fn share_url(&self, peer_id: &str) -> Option<String> {
        self.share_base_url
            .as_deref()
            .map(|base| format!("{base}?jid={peer_id}"))
    }
}
