//! tracelink-client: the producer side of the tracelink fabric
//!
//! This crate provides:
//! - A trace context engine whose nesting state follows tasks across
//!   suspension (scoped mode) or accumulates globally (interactive mode)
//! - Local file and console sinks with deterministic line rendering
//! - A reconnecting WebSocket link that queues frames while disconnected

pub mod context;
pub mod error;
pub mod link;
pub mod sink;
pub mod tracer;

pub use context::ScopeOptions;
pub use error::{Error, Result};
pub use link::{Link, LinkConfig, LinkState};
pub use sink::{ConsoleSink, EventSink, FileSink, FileSinkConfig, render_line};
pub use tracer::{TraceInfo, Tracer, TracerConfig};
