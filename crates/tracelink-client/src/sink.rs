//! Local sinks: deterministic line rendering to a file or stderr.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use chrono::Local;
use tracelink_schema::{Event, TraceKind};
use tracing::warn;

use crate::error::{Error, Result};

/// A destination for rendered events, independent of the link.
pub trait EventSink: Send + Sync {
    fn accept(&self, event: &Event);
}

/// Render an event to its line form: `[HH.MM.SS.mmm] <pipes><message>`.
///
/// `<pipes>` is one `|` per nesting level. Trace entry/exit markers sit
/// directly against their pipes; any other message at depth > 0 is
/// indented two spaces past them, so nested logs render as children of
/// the enclosing frame.
pub fn render_line(event: &Event) -> String {
    let now = Local::now().format("%H.%M.%S%.3f");
    let depth = event.nesting_level() as usize;
    let pipes = "|".repeat(depth);
    let message = event.message();
    let is_marker = matches!(
        event,
        Event::Trace(t) if matches!(t.kind, TraceKind::Entry | TraceKind::Exit)
    );
    if is_marker || depth == 0 {
        format!("[{now}] {pipes}{message}")
    } else {
        format!("[{now}] {pipes}  {message}")
    }
}

/// Configuration for the file sink.
#[derive(Debug, Clone)]
pub struct FileSinkConfig {
    pub path: PathBuf,
    /// Start from an empty file instead of appending.
    pub truncate: bool,
}

impl FileSinkConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            truncate: false,
        }
    }
}

/// Appends one rendered line per event to a configured file.
pub struct FileSink {
    file: Mutex<File>,
}

impl FileSink {
    /// Open the sink file, creating its parent directory if absent.
    pub fn new(config: &FileSinkConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| Error::SinkOpen {
                    path: config.path.clone(),
                    source,
                })?;
            }
        }
        let mut options = OpenOptions::new();
        options.create(true);
        if config.truncate {
            options.write(true).truncate(true);
        } else {
            options.append(true);
        }
        let file = options.open(&config.path).map_err(|source| Error::SinkOpen {
            path: config.path.clone(),
            source,
        })?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl EventSink for FileSink {
    fn accept(&self, event: &Event) {
        let line = render_line(event);
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(error) = writeln!(file, "{line}") {
            warn!(%error, "File sink write failed");
        }
    }
}

/// Mirrors rendered lines to stderr with a tag marker.
pub struct ConsoleSink;

impl EventSink for ConsoleSink {
    fn accept(&self, event: &Event) {
        eprintln!("[TRACE] {}", render_line(event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracelink_schema::{Level, LogEvent, TraceEvent};

    fn log_at(depth: u32, message: &str) -> Event {
        Event::Log(LogEvent {
            id: "e".to_string(),
            timestamp: "2026-08-01T10:00:00.000Z".to_string(),
            level: Level::Info,
            message: message.to_string(),
            source: "test".to_string(),
            thread_id: 1,
            nesting_level: depth,
            data: None,
            stack: None,
        })
    }

    fn trace_at(depth: u32, kind: TraceKind, message: &str) -> Event {
        let Event::Log(base) = log_at(depth, message) else {
            unreachable!()
        };
        Event::Trace(TraceEvent {
            base,
            kind,
            function_name: "f".to_string(),
            args: None,
            return_value: None,
            execution_time_ms: None,
        })
    }

    /// Timestamp prefix is `[HH.MM.SS.mmm] `, 15 characters.
    fn body(line: &str) -> &str {
        assert_eq!(line.as_bytes()[0], b'[');
        assert_eq!(line.as_bytes()[13], b']');
        assert_eq!(line.as_bytes()[3], b'.');
        assert_eq!(line.as_bytes()[6], b'.');
        assert_eq!(line.as_bytes()[9], b'.');
        &line[15..]
    }

    #[test]
    fn test_entry_marker_sits_on_its_pipes() {
        let line = render_line(&trace_at(1, TraceKind::Entry, ">>> Call a"));
        assert_eq!(body(&line), "|>>> Call a");
    }

    #[test]
    fn test_nested_markers_stack_pipes() {
        let line = render_line(&trace_at(2, TraceKind::Exit, "<<< Exit b"));
        assert_eq!(body(&line), "||<<< Exit b");
    }

    #[test]
    fn test_nested_log_is_indented_past_pipes() {
        let line = render_line(&log_at(2, "hi"));
        assert_eq!(body(&line), "||  hi");
    }

    #[test]
    fn test_top_level_log_has_no_pipes() {
        let line = render_line(&log_at(0, "plain"));
        assert_eq!(body(&line), "plain");
    }

    #[test]
    fn test_file_sink_appends_lines() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("logs").join("out.log");
        let sink = FileSink::new(&FileSinkConfig::new(&path)).unwrap();
        sink.accept(&log_at(0, "first"));
        sink.accept(&log_at(0, "second"));

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("first"));
        assert!(lines[1].ends_with("second"));
    }

    #[test]
    fn test_file_sink_truncates_on_request() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("out.log");
        fs::write(&path, "stale\n").unwrap();

        let config = FileSinkConfig {
            path: path.clone(),
            truncate: true,
        };
        let sink = FileSink::new(&config).unwrap();
        sink.accept(&log_at(0, "fresh"));

        let content = fs::read_to_string(&path).unwrap();
        assert!(!content.contains("stale"));
        assert!(content.trim_end().ends_with("fresh"));
    }
}
