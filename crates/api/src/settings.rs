//! Process settings

use alert_model::Catalog;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable naming the settings file
pub const CONFIG_PATH_ENV: &str = "ALERTMGR_CONFIG";
/// Settings file used when [`CONFIG_PATH_ENV`] is unset
pub const DEFAULT_CONFIG_PATH: &str = "alertmgr.toml";

/// Everything the process reads from configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Address the HTTP server binds
    pub listen_addr: String,
    /// Maximum log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Emit logs as JSON lines
    pub log_json: bool,
    /// Capacity of the ingestion queue and of each pipeline queue
    pub queue_capacity: usize,
    pub expiry_interval_secs: u64,
    pub escalation_interval_secs: u64,
    pub rule_refresh_secs: u64,
    pub remind_interval_secs: u64,
    pub catalog: Catalog,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            log_level: "info".to_string(),
            log_json: false,
            queue_capacity: pipeline::DEFAULT_QUEUE_CAPACITY,
            expiry_interval_secs: 300,
            escalation_interval_secs: 180,
            rule_refresh_secs: 600,
            remind_interval_secs: 120,
            catalog: Catalog::default(),
        }
    }
}

impl Settings {
    /// Path of the settings file for this process
    pub fn path() -> String {
        std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string())
    }

    /// Load from `path` (optional) layered with `ALERTMGR__*` environment
    /// variables, e.g. `ALERTMGR__LOG_LEVEL=debug`
    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix("ALERTMGR")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }

    pub fn expiry_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_interval_secs.max(1))
    }

    pub fn escalation_interval(&self) -> Duration {
        Duration::from_secs(self.escalation_interval_secs.max(1))
    }

    pub fn rule_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.rule_refresh_secs.max(1))
    }

    pub fn remind_interval(&self) -> Duration {
        Duration::from_secs(self.remind_interval_secs.max(1))
    }
}
