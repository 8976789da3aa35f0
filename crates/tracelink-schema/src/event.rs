//! Log and trace event types.

use serde::{Deserialize, Serialize};

/// Severity of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A plain log record.
///
/// This struct doubles as the common header of [`TraceEvent`], which embeds
/// it with `#[serde(flatten)]` so both shapes share the same wire fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    /// Unique per event within a producer session; opaque to the broker.
    pub id: String,

    /// ISO-8601 wall time, assigned by the producer at creation.
    pub timestamp: String,

    pub level: Level,

    /// Human-formatted message; trace events carry their markers here.
    pub message: String,

    /// Producer identity, e.g. a hostname.
    pub source: String,

    /// Producer-assigned context id.
    pub thread_id: u64,

    /// Depth in the producer's call stack at emission.
    pub nesting_level: u32,

    /// Optional structured payload, sanitized before serialization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,

    /// Captured call-site frames, for errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// What a trace event records about its function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceKind {
    Entry,
    Exit,
    Log,
    Error,
}

/// A trace record: a log header plus call information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceEvent {
    #[serde(flatten)]
    pub base: LogEvent,

    pub kind: TraceKind,

    pub function_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<serde_json::Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_value: Option<serde_json::Value>,

    /// Wall-clock duration of the call in milliseconds, on exit events.
    #[serde(
        default,
        rename = "executionTime",
        skip_serializing_if = "Option::is_none"
    )]
    pub execution_time_ms: Option<u64>,
}

/// A log or trace record as it travels on the link.
///
/// The discriminant is carried by the enclosing frame's `type` field, not
/// inside the event object itself.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Log(LogEvent),
    Trace(TraceEvent),
}

impl Event {
    /// The common header shared by both shapes.
    pub fn header(&self) -> &LogEvent {
        match self {
            Event::Log(e) => e,
            Event::Trace(e) => &e.base,
        }
    }

    pub fn id(&self) -> &str {
        &self.header().id
    }

    pub fn level(&self) -> Level {
        self.header().level
    }

    pub fn message(&self) -> &str {
        &self.header().message
    }

    pub fn source(&self) -> &str {
        &self.header().source
    }

    pub fn nesting_level(&self) -> u32 {
        self.header().nesting_level
    }

    pub fn is_trace(&self) -> bool {
        matches!(self, Event::Trace(_))
    }

    /// Serialize the bare event object, without any frame envelope.
    pub fn to_value(&self) -> serde_json::Value {
        match self {
            Event::Log(e) => serde_json::to_value(e).unwrap_or(serde_json::Value::Null),
            Event::Trace(e) => serde_json::to_value(e).unwrap_or(serde_json::Value::Null),
        }
    }
}
