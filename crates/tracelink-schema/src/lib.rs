//! tracelink-schema: the wire schema shared by producers and the broker
//!
//! This crate defines:
//! - The event model (log and trace records with their common header)
//! - The frame envelope exchanged on a link, in both directions
//! - Subscription filter predicates and compiled pattern sets
//! - Payload sanitizing for structured `data` fields

pub mod event;
pub mod filter;
pub mod frame;
pub mod payload;

pub use event::{Event, Level, LogEvent, TraceEvent, TraceKind};
pub use filter::PatternSet;
pub use frame::{ClientFrame, ServerFrame, StatusKind, SubscriptionFilters};
pub use payload::sanitize_payload;
