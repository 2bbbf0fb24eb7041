//! Configuration loading for sync-client.
//!
//! Configuration is loaded from a TOML file (default: `courier.toml`).
//! Every section and field is optional.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Event log configuration.
    pub event_log: EventLogConfig,
    /// Notification stream configuration.
    pub stream: StreamConfig,
    /// Notification fetching triggered by push announcements.
    pub push: StreamConfig,
    /// Request scheduling configuration.
    pub scheduler: SchedulerConfig,
}

/// Event log configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EventLogConfig {
    /// Path to SQLite database file.
    #[serde(default = "default_database_path")]
    pub database: PathBuf,
    /// Events decoded per batch (default: 500).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

/// Notification stream listing configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Listing endpoint (default: `/notifications`).
    #[serde(default = "default_stream_path")]
    pub base_path: String,
    /// Query key carrying the continuation token (default: `since`).
    #[serde(default = "default_start_key")]
    pub start_key: String,
    /// Notifications per page (default: 500).
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Client id sent as the `client` query parameter.
    pub client_id: Option<String>,
}

/// Request scheduling configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Upper bound on requests sent by one `run_until_idle` (default: 1000).
    #[serde(default = "default_max_requests_per_run")]
    pub max_requests_per_run: usize,
}

// Default value functions
fn default_database_path() -> PathBuf {
    PathBuf::from("courier-events.db")
}

fn default_batch_size() -> usize {
    crate::decoder::DEFAULT_BATCH_SIZE
}

fn default_stream_path() -> String {
    "/notifications".to_string()
}

fn default_start_key() -> String {
    "since".to_string()
}

fn default_page_size() -> usize {
    500
}

fn default_max_requests_per_run() -> usize {
    1000
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            database: default_database_path(),
            batch_size: default_batch_size(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            base_path: default_stream_path(),
            start_key: default_start_key(),
            page_size: default_page_size(),
            client_id: None,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_requests_per_run: default_max_requests_per_run(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
}
