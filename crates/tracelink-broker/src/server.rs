//! HTTP server setup and routing.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{State, ws::WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::BrokerConfig;
use crate::error::{Error, Result};
use crate::link::serve_link;
use crate::state::{BrokerContext, SharedContext};
use crate::stats::StatsSnapshot;

/// Health check response
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    active_links: usize,
}

/// Health check endpoint
async fn healthz(State(ctx): State<SharedContext>) -> impl IntoResponse {
    let active_links = ctx.link_count().await;
    let snapshot = ctx.stats.snapshot(active_links);
    Json(HealthResponse {
        status: "ok",
        uptime_secs: snapshot.uptime_secs,
        active_links,
    })
}

/// Runtime statistics endpoint
async fn api_stats(State(ctx): State<SharedContext>) -> Json<StatsSnapshot> {
    let active_links = ctx.link_count().await;
    Json(ctx.stats.snapshot(active_links))
}

/// WebSocket upgrade handler. Every producer and consumer link enters
/// here.
async fn ws_handler(ws: WebSocketUpgrade, State(ctx): State<SharedContext>) -> impl IntoResponse {
    ws.on_upgrade(|socket| serve_link(socket, ctx))
}

/// Build the axum router
fn build_router(ctx: SharedContext) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/stats", get(api_stats))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

/// Bind and run the broker until `shutdown` fires.
pub async fn run_server(config: BrokerConfig, shutdown: CancellationToken) -> Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await.map_err(Error::Bind)?;
    serve_on(listener, config, shutdown).await
}

/// Run the broker on an already-bound listener. Split out from
/// [`run_server`] so tests can bind port 0 and read the chosen address.
pub async fn serve_on(
    listener: TcpListener,
    config: BrokerConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let ctx = Arc::new(BrokerContext::new(config));
    let router = build_router(ctx);

    let addr = listener.local_addr().map_err(Error::Bind)?;
    info!(%addr, "Broker listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::Server(e.to_string()))?;

    info!("Broker shut down");
    Ok(())
}
