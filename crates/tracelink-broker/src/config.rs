//! Broker configuration, loaded from a JSON file.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::routes::RouteConfig;

/// Current config format version.
///
/// Increment this when making breaking changes to the config format; the
/// broker checks it on startup.
pub const CURRENT_CONFIG_VERSION: u32 = 1;

/// How the broker combines include and exclude patterns for subscribers.
///
/// Producers always use include-wins semantics; the broker's rule is a
/// deployment decision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterRule {
    /// Include and exclude predicates must both pass.
    #[default]
    Conjunctive,
    /// A matching include pattern delivers regardless of excludes.
    IncludeWins,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerConfig {
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,

    /// Interval between link probes.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    #[serde(default)]
    pub filter_rule: FilterRule,

    /// Accepted for config compatibility; retention is not implemented.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_retention: Option<u64>,

    /// Accepted for config compatibility; frame compression is not
    /// implemented.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub compression: bool,

    #[serde(default = "default_routes")]
    pub routes: Vec<RouteConfig>,
}

fn default_version() -> u32 {
    CURRENT_CONFIG_VERSION
}

fn default_port() -> u16 {
    8765
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_routes() -> Vec<RouteConfig> {
    vec![RouteConfig::console("/")]
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            port: default_port(),
            host: default_host(),
            heartbeat_secs: default_heartbeat_secs(),
            filter_rule: FilterRule::default(),
            log_retention: None,
            compression: false,
            routes: default_routes(),
        }
    }
}

impl BrokerConfig {
    /// Load from `path`, falling back to defaults when the file is absent.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(Error::ConfigRead)?;
        let config: BrokerConfig =
            serde_json::from_str(&content).map_err(|e| Error::ConfigParse(e.to_string()))?;
        if config.version > CURRENT_CONFIG_VERSION {
            return Err(Error::ConfigVersionTooNew {
                found: config.version,
                supported: CURRENT_CONFIG_VERSION,
            });
        }
        Ok(config)
    }

    /// Write the default configuration to `path`.
    pub fn write_default(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(Error::ConfigRead)?;
            }
        }
        let content = serde_json::to_string_pretty(&Self::default())
            .map_err(|e| Error::ConfigParse(e.to_string()))?;
        fs::write(path, content).map_err(Error::ConfigRead)?;
        Ok(())
    }
}
