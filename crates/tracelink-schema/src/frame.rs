//! The frame envelope exchanged on a link.
//!
//! Every frame is a single self-delimited text payload carrying one JSON
//! object, discriminated by its `type` field.

use serde::{Deserialize, Serialize};

use crate::event::{Event, Level, LogEvent, TraceEvent};

/// Filter predicates attached to a subscription.
///
/// Empty collections mean "no constraint"; they are omitted on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubscriptionFilters {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub levels: Vec<Level>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub include_patterns: Vec<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub exclude_patterns: Vec<String>,
}

impl SubscriptionFilters {
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
            && self.sources.is_empty()
            && self.include_patterns.is_empty()
            && self.exclude_patterns.is_empty()
    }
}

/// Frames sent from a producer or consumer to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientFrame {
    Log {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        route: Option<String>,
        data: LogEvent,
    },
    Trace {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        route: Option<String>,
        data: TraceEvent,
    },
    Subscribe {
        route: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filters: Option<SubscriptionFilters>,
    },
    Unsubscribe {
        route: String,
    },
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
}

impl ClientFrame {
    /// Wrap an event for transmission; the frame id mirrors the event id.
    pub fn from_event(event: Event, route: Option<String>) -> Self {
        match event {
            Event::Log(data) => ClientFrame::Log {
                id: data.id.clone(),
                route,
                data,
            },
            Event::Trace(data) => ClientFrame::Trace {
                id: data.base.id.clone(),
                route,
                data,
            },
        }
    }
}

/// Acknowledgement states reported by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Connected,
    Ok,
    Subscribed,
    Unsubscribed,
}

/// Frames sent from the broker to a link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerFrame {
    Log {
        data: LogEvent,
    },
    Trace {
        data: TraceEvent,
    },
    Status {
        status: StatusKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    Pong,
    Error {
        error: String,
    },
}

impl ServerFrame {
    /// Wrap an event for broadcast to a subscriber.
    pub fn from_event(event: Event) -> Self {
        match event {
            Event::Log(data) => ServerFrame::Log { data },
            Event::Trace(data) => ServerFrame::Trace { data },
        }
    }

    /// The broadcast event, if this frame carries one.
    pub fn into_event(self) -> Option<Event> {
        match self {
            ServerFrame::Log { data } => Some(Event::Log(data)),
            ServerFrame::Trace { data } => Some(Event::Trace(data)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_log() -> LogEvent {
        LogEvent {
            id: "evt-9".to_string(),
            timestamp: "2026-08-01T10:00:00.000Z".to_string(),
            level: Level::Warn,
            message: "careful".to_string(),
            source: "host-a".to_string(),
            thread_id: 1,
            nesting_level: 0,
            data: None,
            stack: None,
        }
    }

    #[test]
    fn test_log_frame_wire_shape() {
        let frame = ClientFrame::from_event(Event::Log(sample_log()), Some("/app".to_string()));
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "log");
        assert_eq!(value["id"], "evt-9");
        assert_eq!(value["route"], "/app");
        assert_eq!(value["data"]["message"], "careful");
    }

    #[test]
    fn test_subscribe_frame_parses_with_filters() {
        let json = r#"{
            "type": "subscribe",
            "route": "/trace",
            "filters": {"levels": ["error"], "includePatterns": [".*db.*"]}
        }"#;
        let frame: ClientFrame = serde_json::from_str(json).unwrap();
        match frame {
            ClientFrame::Subscribe { route, filters } => {
                assert_eq!(route, "/trace");
                let filters = filters.unwrap();
                assert_eq!(filters.levels, vec![Level::Error]);
                assert_eq!(filters.include_patterns, vec![".*db.*".to_string()]);
                assert!(filters.sources.is_empty());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_ping_without_id() {
        let frame: ClientFrame = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(frame, ClientFrame::Ping { id: None });
    }

    #[test]
    fn test_pong_serializes_bare() {
        let json = serde_json::to_string(&ServerFrame::Pong).unwrap();
        assert_eq!(json, r#"{"type":"pong"}"#);
    }

    #[test]
    fn test_status_frame_shape() {
        let frame = ServerFrame::Status {
            status: StatusKind::Connected,
            id: None,
            data: Some(serde_json::json!({"serverTime": "2026-08-01T10:00:00Z"})),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "status");
        assert_eq!(value["status"], "connected");
        assert!(value.get("id").is_none());
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let err = serde_json::from_str::<ClientFrame>(r#"{"type":"shout","volume":11}"#);
        assert!(err.is_err());
    }

    #[test]
    fn test_broadcast_round_trips_header_fields() {
        let frame = ServerFrame::from_event(Event::Log(sample_log()));
        let json = serde_json::to_string(&frame).unwrap();
        let back: ServerFrame = serde_json::from_str(&json).unwrap();
        let event = back.into_event().unwrap();
        assert_eq!(event.level(), Level::Warn);
        assert_eq!(event.message(), "careful");
        assert_eq!(event.header().thread_id, 1);
        assert_eq!(event.nesting_level(), 0);
    }
}
