//! Route configuration and longest-prefix matching.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Where a route's records go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RouteOutput {
    /// Write records to stdout.
    Console,
    /// Append records to this file.
    File(PathBuf),
}

impl Default for RouteOutput {
    fn default() -> Self {
        RouteOutput::Console
    }
}

impl From<String> for RouteOutput {
    fn from(value: String) -> Self {
        if value == "console" {
            RouteOutput::Console
        } else {
            RouteOutput::File(PathBuf::from(value))
        }
    }
}

impl From<RouteOutput> for String {
    fn from(value: RouteOutput) -> Self {
        match value {
            RouteOutput::Console => "console".to_string(),
            RouteOutput::File(path) => path.display().to_string(),
        }
    }
}

/// How much of each event a route persists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CaptureMode {
    /// `{timestamp, clientId, route, type, data}`
    #[default]
    Full,
    /// `{timestamp, data}`
    PayloadOnly,
    /// The bare event object.
    BodyOnly,
}

/// On-disk record format. `json` and `jsonl` both write one object per
/// line; `json` is kept as a config alias.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordFormat {
    Text,
    Json,
    #[default]
    Jsonl,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteConfig {
    pub route_prefix: String,

    #[serde(default)]
    pub output: RouteOutput,

    #[serde(default)]
    pub capture: CaptureMode,

    #[serde(default)]
    pub format: RecordFormat,
}

impl RouteConfig {
    /// A console route with default capture, useful as a catch-all.
    pub fn console(prefix: impl Into<String>) -> Self {
        Self {
            route_prefix: prefix.into(),
            output: RouteOutput::Console,
            capture: CaptureMode::default(),
            format: RecordFormat::default(),
        }
    }
}

/// The configured routes, selected by longest matching prefix.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<RouteConfig>,
}

impl RouteTable {
    pub fn new(routes: Vec<RouteConfig>) -> Self {
        Self { routes }
    }

    /// Longest-prefix match; `None` when no configured prefix applies.
    pub fn resolve(&self, route: &str) -> Option<&RouteConfig> {
        self.routes
            .iter()
            .filter(|r| route.starts_with(r.route_prefix.as_str()))
            .max_by_key(|r| r.route_prefix.len())
    }
}
