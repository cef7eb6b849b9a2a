use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ConfigError;
use crate::hub::HubConfig;
use crate::poller::PollConfig;
use crate::reconcile::ReconcilerConfig;

const APP_DIR: &str = "feed-relay";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    pub server: ServerConfig,
    pub poll: PollSettings,
    pub store: StoreConfig,
    pub hub: HubSettings,
    pub client: ClientSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub feed_url: String,
    /// Start polling as soon as the server is up.
    pub autostart: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PollSettings {
    pub interval_seconds: u64,
    pub request_timeout_seconds: u64,
    /// Fetch attempts per cycle, the first one included.
    pub retry_attempts: u8,
    pub retry_backoff_ms: u64,
    /// `null` disables the early-exit heuristic.
    pub early_exit_threshold: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    /// `null` keeps the store in memory only.
    pub path: Option<PathBuf>,
    pub max_records: usize,
    pub seen_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HubSettings {
    pub queue_capacity: usize,
    pub snapshot_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientSettings {
    pub server_url: String,
    pub working_set_cap: usize,
    pub highlight_seconds: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub ping_interval_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:5127".into(),
            feed_url: "https://nsearchives.nseindia.com/content/RSS/Online_announcements.xml".into(),
            autostart: false,
        }
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval_seconds: 5,
            request_timeout_seconds: 10,
            retry_attempts: 3,
            retry_backoff_ms: 500,
            early_exit_threshold: None,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: dirs::data_dir().map(|dir| dir.join(APP_DIR).join("records.json")),
            max_records: 500,
            seen_capacity: 1000,
        }
    }
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            snapshot_limit: 500,
        }
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:5127/ws".into(),
            working_set_cap: 50,
            highlight_seconds: 300,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            max_reconnect_attempts: 10,
            ping_interval_seconds: 30,
        }
    }
}

impl From<&PollSettings> for PollConfig {
    fn from(settings: &PollSettings) -> Self {
        Self {
            interval: Duration::from_secs(settings.interval_seconds.max(1)),
            request_timeout: Duration::from_secs(settings.request_timeout_seconds),
            max_retries: settings.retry_attempts.saturating_sub(1),
            retry_backoff_ms: settings.retry_backoff_ms,
            early_exit_threshold: settings.early_exit_threshold,
        }
    }
}

impl From<&HubSettings> for HubConfig {
    fn from(settings: &HubSettings) -> Self {
        Self {
            queue_capacity: settings.queue_capacity,
            snapshot_limit: settings.snapshot_limit,
        }
    }
}

impl From<&ClientSettings> for ReconcilerConfig {
    fn from(settings: &ClientSettings) -> Self {
        Self {
            working_set_cap: settings.working_set_cap,
            highlight_duration: Duration::from_secs(settings.highlight_seconds),
            reconnect_base_delay: Duration::from_millis(settings.reconnect_base_delay_ms),
            reconnect_max_delay: Duration::from_millis(settings.reconnect_max_delay_ms),
            max_reconnect_attempts: settings.max_reconnect_attempts,
            ping_interval: Duration::from_secs(settings.ping_interval_seconds.max(1)),
        }
    }
}

impl RelayConfig {
    /// Récupère le chemin du fichier de configuration
    pub fn config_file_path() -> Result<PathBuf, ConfigError> {
        let config_dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(config_dir.join(APP_DIR).join("config.json"))
    }

    /// Charge la configuration, ou retombe sur les valeurs par défaut.
    /// An explicit path is never overwritten; the default location gets the
    /// default file written back when it does not exist yet.
    pub fn load(explicit: Option<&Path>) -> Self {
        if let Some(path) = explicit {
            return Self::from_file(path).unwrap_or_else(|e| {
                warn!(error = %e, path = %path.display(), "failed to load config, using defaults");
                Self::default()
            });
        }
        let path = match Self::config_file_path() {
            Ok(path) => path,
            Err(e) => {
                warn!(error = %e, "no config location, using defaults");
                return Self::default();
            }
        };
        if !path.exists() {
            let config = Self::default();
            if let Err(e) = config.save_to(&path) {
                warn!(error = %e, path = %path.display(), "failed to write default config");
            }
            return config;
        }
        Self::from_file(&path).unwrap_or_else(|e| {
            warn!(error = %e, path = %path.display(), "failed to load config, using defaults");
            Self::default()
        })
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Sauvegarde la configuration dans le fichier
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn poll_config(&self) -> PollConfig {
        PollConfig::from(&self.poll)
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig::from(&self.hub)
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig::from(&self.client)
    }
}
