//! tracelink-broker: the fan-out hub of the tracelink fabric
//!
//! This crate provides:
//! - WebSocket link acceptance with per-link subscription state
//! - Route resolution by longest prefix and per-route persistence
//! - Filtered broadcast to subscribed consumers
//! - Runtime statistics and health endpoints

pub mod config;
pub mod error;
pub mod link;
pub mod routes;
pub mod server;
pub mod sink;
pub mod state;
pub mod stats;

pub use config::{BrokerConfig, FilterRule};
pub use error::{Error, Result};
pub use routes::{CaptureMode, RecordFormat, RouteConfig, RouteOutput, RouteTable};
pub use server::{run_server, serve_on};
pub use state::{BrokerContext, SharedContext};
pub use stats::StatsSnapshot;
