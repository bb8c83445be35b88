//! Client configuration.

use anyhow::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tether_core::{ReconnectPolicy, RecoveryConfig, TerminalConfig, TurnSessionConfig};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Base URL of the turn backend's HTTP API
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    /// WebSocket endpoint of the terminal backend
    #[serde(default = "default_terminal_url")]
    pub terminal_url: String,
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
    #[serde(default = "default_event_log_capacity")]
    pub event_log_capacity: usize,
    #[serde(default)]
    pub recovery: RecoverySection,
    #[serde(default)]
    pub terminal: TerminalSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecoverySection {
    #[serde(default = "default_recovery_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_lazy_retry_ms")]
    pub lazy_retry_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TerminalSection {
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_retry_min_interval_ms")]
    pub retry_min_interval_ms: u64,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
}

fn default_api_base_url() -> String {
    "http://127.0.0.1:8080/api".to_string()
}

fn default_terminal_url() -> String {
    "ws://127.0.0.1:8080/ws/terminal".to_string()
}

fn default_store_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tether")
        .join("state.db")
}

fn default_event_log_capacity() -> usize {
    tether_core::DEFAULT_EVENT_LOG_CAPACITY
}

fn default_recovery_timeout_ms() -> u64 {
    8_000
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_lazy_retry_ms() -> u64 {
    30_000
}

fn default_reconnect_base_ms() -> u64 {
    1_000
}

fn default_reconnect_max_ms() -> u64 {
    8_000
}

fn default_max_reconnect_attempts() -> u32 {
    3
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_retry_min_interval_ms() -> u64 {
    1_500
}

fn default_cols() -> u16 {
    80
}

fn default_rows() -> u16 {
    24
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            timeout_ms: default_recovery_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            lazy_retry_ms: default_lazy_retry_ms(),
        }
    }
}

impl Default for TerminalSection {
    fn default() -> Self {
        Self {
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            connect_timeout_ms: default_connect_timeout_ms(),
            retry_min_interval_ms: default_retry_min_interval_ms(),
            cols: default_cols(),
            rows: default_rows(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            terminal_url: default_terminal_url(),
            store_path: default_store_path(),
            event_log_capacity: default_event_log_capacity(),
            recovery: RecoverySection::default(),
            terminal: TerminalSection::default(),
        }
    }
}

impl Config {
    /// Load config from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load config from config/tether.toml or fall back to defaults.
    pub fn load() -> Result<Self> {
        let config_path = PathBuf::from("config/tether.toml");
        if config_path.exists() {
            return Self::load_from(&config_path);
        }
        Ok(Config::default())
    }

    pub fn turn_session(&self) -> TurnSessionConfig {
        TurnSessionConfig {
            event_log_capacity: self.event_log_capacity,
            recovery: RecoveryConfig {
                timeout: Duration::from_millis(self.recovery.timeout_ms),
                poll_interval: Duration::from_millis(self.recovery.poll_interval_ms),
                lazy_retry: Duration::from_millis(self.recovery.lazy_retry_ms),
            },
        }
    }

    pub fn terminal(&self) -> TerminalConfig {
        TerminalConfig {
            reconnect: ReconnectPolicy {
                base: Duration::from_millis(self.terminal.reconnect_base_ms),
                max: Duration::from_millis(self.terminal.reconnect_max_ms),
                max_attempts: self.terminal.max_reconnect_attempts,
            },
            connect_timeout: Duration::from_millis(self.terminal.connect_timeout_ms),
            retry_min_interval: Duration::from_millis(self.terminal.retry_min_interval_ms),
            cols: self.terminal.cols,
            rows: self.terminal.rows,
        }
    }
}
