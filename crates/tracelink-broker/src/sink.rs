//! Persistence of dispatched events to route sinks.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde_json::json;
use tracelink_schema::Event;
use tracing::warn;

use crate::routes::{CaptureMode, RecordFormat, RouteConfig, RouteOutput};

/// Everything a sink needs to know about one dispatched event.
pub struct DispatchRecord<'a> {
    pub client_id: u64,
    pub route: &'a str,
    pub event: &'a Event,
}

/// Persist one record. Failures are logged and never abort dispatch.
pub fn persist(config: &RouteConfig, record: &DispatchRecord<'_>) {
    let line = render_record(config, record);
    match &config.output {
        RouteOutput::Console => println!("{line}"),
        RouteOutput::File(path) => {
            if let Err(error) = append_line(path, &line) {
                warn!(path = %path.display(), %error, "Route sink write failed");
            }
        }
    }
}

fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")
}

/// Render one line according to the route's capture mode and format.
pub fn render_record(config: &RouteConfig, record: &DispatchRecord<'_>) -> String {
    let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    if config.format == RecordFormat::Text {
        let event = record.event;
        return format!(
            "[{timestamp}] {} {}",
            event.level().as_str().to_uppercase(),
            event.message()
        );
    }
    let value = match config.capture {
        CaptureMode::Full => json!({
            "timestamp": timestamp,
            "clientId": record.client_id,
            "route": record.route,
            "type": if record.event.is_trace() { "trace" } else { "log" },
            "data": record.event.to_value(),
        }),
        CaptureMode::PayloadOnly => json!({
            "timestamp": timestamp,
            "data": record.event.to_value(),
        }),
        CaptureMode::BodyOnly => record.event.to_value(),
    };
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracelink_schema::{Level, LogEvent};

    fn sample_event() -> Event {
        Event::Log(LogEvent {
            id: "evt-5".to_string(),
            timestamp: "2026-08-01T10:00:00.000Z".to_string(),
            level: Level::Info,
            message: "persisted".to_string(),
            source: "host-a".to_string(),
            thread_id: 4,
            nesting_level: 0,
            data: None,
            stack: None,
        })
    }

    fn record(event: &Event) -> DispatchRecord<'_> {
        DispatchRecord {
            client_id: 11,
            route: "/app",
            event,
        }
    }

    fn route_with(capture: CaptureMode, format: RecordFormat) -> RouteConfig {
        RouteConfig {
            route_prefix: "/app".to_string(),
            output: RouteOutput::Console,
            capture,
            format,
        }
    }

    #[test]
    fn test_full_capture_wraps_event() {
        let event = sample_event();
        let line = render_record(
            &route_with(CaptureMode::Full, RecordFormat::Jsonl),
            &record(&event),
        );
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["clientId"], 11);
        assert_eq!(value["route"], "/app");
        assert_eq!(value["type"], "log");
        assert_eq!(value["data"]["message"], "persisted");
    }

    #[test]
    fn test_payload_only_capture() {
        let event = sample_event();
        let line = render_record(
            &route_with(CaptureMode::PayloadOnly, RecordFormat::Jsonl),
            &record(&event),
        );
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert!(value.get("clientId").is_none());
        assert!(value.get("timestamp").is_some());
        assert_eq!(value["data"]["id"], "evt-5");
    }

    #[test]
    fn test_body_only_capture_is_the_bare_event() {
        let event = sample_event();
        let line = render_record(
            &route_with(CaptureMode::BodyOnly, RecordFormat::Jsonl),
            &record(&event),
        );
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["id"], "evt-5");
        assert_eq!(value["message"], "persisted");
        assert!(value.get("data").is_none());
    }

    #[test]
    fn test_text_format_renders_level_and_message() {
        let event = sample_event();
        let line = render_record(
            &route_with(CaptureMode::Full, RecordFormat::Text),
            &record(&event),
        );
        assert!(line.contains("INFO persisted"));
    }

    #[test]
    fn test_file_sink_creates_parent_dirs() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("nested").join("out.jsonl");
        let config = RouteConfig {
            route_prefix: "/".to_string(),
            output: RouteOutput::File(path.clone()),
            capture: CaptureMode::BodyOnly,
            format: RecordFormat::Jsonl,
        };
        let event = sample_event();
        persist(&config, &record(&event));
        persist(&config, &record(&event));

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }
}
