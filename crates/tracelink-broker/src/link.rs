//! Per-connection handling: the reader loop, frame dispatch, and the
//! writer task that owns the socket's send half.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tracelink_schema::{ClientFrame, Event, ServerFrame, StatusKind};
use tracing::{debug, info, warn};

use crate::sink::{self, DispatchRecord};
use crate::state::{LinkHandle, SharedContext};

/// Serve one accepted WebSocket until it closes or errors.
pub async fn serve_link(socket: WebSocket, ctx: SharedContext) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let link = ctx.register_link(sender).await;
    info!(link_id = link.id, "Link connected");

    // Greet before reading anything; the writer task drains in order.
    link.send(ServerFrame::Status {
        status: StatusKind::Connected,
        id: None,
        data: Some(json!({ "serverTime": chrono::Utc::now().to_rfc3339() })),
    });

    let (ws_tx, mut ws_rx) = socket.split();
    let heartbeat = Duration::from_secs(ctx.config.heartbeat_secs.max(1));
    let writer = tokio::spawn(write_frames(ws_tx, receiver, heartbeat));

    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(text)) => {
                link.touch();
                dispatch_text(&ctx, &link, text.as_str()).await;
            }
            Ok(Message::Pong(_)) => link.touch(),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(error) => {
                debug!(link_id = link.id, %error, "Link read error");
                break;
            }
        }
    }

    ctx.remove_link(link.id).await;
    writer.abort();
    info!(link_id = link.id, "Link disconnected");
}

/// Writer half: forwards queued frames and probes the link periodically.
/// A probe response lands in the reader loop and refreshes the link's
/// last-activity time.
async fn write_frames(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<ServerFrame>,
    heartbeat: Duration,
) {
    let mut probe = tokio::time::interval(heartbeat);
    probe.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    probe.tick().await; // the first tick fires immediately; skip it
    loop {
        tokio::select! {
            maybe_frame = rx.recv() => {
                let Some(frame) = maybe_frame else { break };
                let json = match serde_json::to_string(&frame) {
                    Ok(json) => json,
                    Err(error) => {
                        warn!(%error, "Dropping unserializable frame");
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            _ = probe.tick() => {
                if ws_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Parse and dispatch one inbound text frame.
async fn dispatch_text(ctx: &SharedContext, link: &Arc<LinkHandle>, text: &str) {
    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(_) => {
            link.send(ServerFrame::Error {
                error: reject_reason(text),
            });
            return;
        }
    };

    match frame {
        ClientFrame::Log { id, route, data } => {
            dispatch_event(ctx, link, id, route, Event::Log(data)).await;
        }
        ClientFrame::Trace { id, route, data } => {
            dispatch_event(ctx, link, id, route, Event::Trace(data)).await;
        }
        ClientFrame::Subscribe { route, filters } => {
            debug!(link_id = link.id, %route, "Subscribe");
            link.subscribe(route.clone(), filters.unwrap_or_default());
            link.send(ServerFrame::Status {
                status: StatusKind::Subscribed,
                id: None,
                data: Some(json!({ "route": route })),
            });
        }
        ClientFrame::Unsubscribe { route } => {
            debug!(link_id = link.id, %route, "Unsubscribe");
            link.unsubscribe(&route);
            link.send(ServerFrame::Status {
                status: StatusKind::Unsubscribed,
                id: None,
                data: Some(json!({ "route": route })),
            });
        }
        ClientFrame::Ping { .. } => {
            link.send(ServerFrame::Pong);
        }
    }
}

/// Why an unparseable frame was rejected: an unrecognized `type` gets
/// its own wording, anything else is malformed.
fn reject_reason(text: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(value) => match value.get("type").and_then(|t| t.as_str()) {
            Some(kind) if matches!(kind, "log" | "trace" | "subscribe" | "unsubscribe" | "ping") => {
                format!("Malformed {kind} frame")
            }
            Some(_) | None => "Unknown message type".to_string(),
        },
        Err(_) => "Malformed frame".to_string(),
    }
}

/// Resolve the event's route, persist, broadcast, and ack.
async fn dispatch_event(
    ctx: &SharedContext,
    link: &Arc<LinkHandle>,
    id: String,
    route: Option<String>,
    event: Event,
) {
    let route = route
        .or_else(|| link.current_route())
        .unwrap_or_else(|| "/".to_string());

    let Some(route_config) = ctx.routes.resolve(&route) else {
        warn!(link_id = link.id, %route, "No route configured");
        link.send(ServerFrame::Error {
            error: format!("No route configured for {route}"),
        });
        return;
    };

    sink::persist(
        route_config,
        &DispatchRecord {
            client_id: link.id,
            route: &route,
            event: &event,
        },
    );
    ctx.stats.record_message();
    ctx.broadcast(&route, &event).await;

    link.send(ServerFrame::Status {
        status: StatusKind::Ok,
        id: Some(id),
        data: None,
    });
}
