//! The producer side of a link: a reconnecting WebSocket transport.
//!
//! Frames offered while the socket is down accumulate in an unbounded
//! FIFO and drain in order once a connection is established. Reconnects
//! back off exponentially and give up after a configured number of
//! consecutive failures; an explicit close cancels everything.

use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracelink_schema::{ClientFrame, ServerFrame};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// First reconnect delay; doubles per failure.
const BASE_BACKOFF: Duration = Duration::from_secs(1);

/// Cap on the reconnect backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Connection lifecycle states observable through [`Link::state`].
///
/// `GaveUp` and `Closed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    GaveUp,
    Closed,
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub url: String,

    /// Consecutive failed reconnects tolerated before giving up.
    pub max_retries: u32,

    /// First reconnect delay. The default follows the documented
    /// `min(1s * 2^attempts, 30s)` schedule.
    pub base_backoff: Duration,
}

impl LinkConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_retries: 10,
            base_backoff: BASE_BACKOFF,
        }
    }
}

/// Delay before reconnect attempt number `attempts` (zero-based).
pub(crate) fn backoff_delay(base: Duration, attempts: u32) -> Duration {
    let factor = 1u32.checked_shl(attempts).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(MAX_BACKOFF)
}

/// Handle to the background driver task that owns the socket.
pub struct Link {
    frame_tx: mpsc::UnboundedSender<ClientFrame>,
    state_rx: watch::Receiver<LinkState>,
    shutdown: CancellationToken,
}

impl Link {
    /// Open a link. The returned receiver carries inbound broadcasts and
    /// acknowledgements from the broker.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(config: LinkConfig) -> (Self, mpsc::UnboundedReceiver<ServerFrame>) {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(LinkState::Disconnected);
        let shutdown = CancellationToken::new();
        tokio::spawn(drive(
            config,
            frame_rx,
            inbound_tx,
            state_tx,
            shutdown.clone(),
        ));
        (
            Self {
                frame_tx,
                state_rx,
                shutdown,
            },
            inbound_rx,
        )
    }

    /// Queue a frame for delivery. Frames offered after close are dropped.
    pub fn offer(&self, frame: ClientFrame) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let _ = self.frame_tx.send(frame);
    }

    pub fn state(&self) -> LinkState {
        *self.state_rx.borrow()
    }

    /// A watch receiver for observing state transitions.
    pub fn state_watch(&self) -> watch::Receiver<LinkState> {
        self.state_rx.clone()
    }

    /// Cancel the reconnect timer and any pending send. Frames still
    /// queued are lost.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

enum SessionEnd {
    /// Explicitly closed; the driver exits.
    Closed,
    /// Connection dropped; the driver schedules a reconnect.
    Lost,
}

async fn drive(
    config: LinkConfig,
    mut frame_rx: mpsc::UnboundedReceiver<ClientFrame>,
    inbound_tx: mpsc::UnboundedSender<ServerFrame>,
    state_tx: watch::Sender<LinkState>,
    shutdown: CancellationToken,
) {
    let mut attempts: u32 = 0;
    let mut pending: Option<ClientFrame> = None;

    loop {
        let _ = state_tx.send(LinkState::Connecting);
        let connect = tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = state_tx.send(LinkState::Closed);
                return;
            }
            connect = connect_async(config.url.as_str()) => connect,
        };

        match connect {
            Ok((stream, _response)) => {
                info!(url = %config.url, "Link connected");
                attempts = 0;
                let _ = state_tx.send(LinkState::Connected);
                let end =
                    run_session(stream, &mut frame_rx, &mut pending, &inbound_tx, &shutdown).await;
                if matches!(end, SessionEnd::Closed) {
                    let _ = state_tx.send(LinkState::Closed);
                    return;
                }
                warn!(url = %config.url, "Link lost, scheduling reconnect");
                let _ = state_tx.send(LinkState::Disconnected);
            }
            Err(error) => {
                warn!(url = %config.url, %error, "Link connect failed");
                let _ = state_tx.send(LinkState::Disconnected);
                if attempts >= config.max_retries {
                    warn!(url = %config.url, attempts, "Giving up on link");
                    let _ = state_tx.send(LinkState::GaveUp);
                    return;
                }
            }
        }

        let delay = backoff_delay(config.base_backoff, attempts);
        attempts += 1;
        debug!(delay_ms = delay.as_millis() as u64, "Waiting before reconnect");
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = state_tx.send(LinkState::Closed);
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn run_session(
    stream: WsStream,
    frame_rx: &mut mpsc::UnboundedReceiver<ClientFrame>,
    pending: &mut Option<ClientFrame>,
    inbound_tx: &mpsc::UnboundedSender<ServerFrame>,
    shutdown: &CancellationToken,
) -> SessionEnd {
    let (mut ws_tx, mut ws_rx) = stream.split();

    // Retry the frame that was in flight when the previous session died.
    if let Some(frame) = pending.take() {
        if let Some(failed) = send_frame(&mut ws_tx, frame).await {
            *pending = Some(failed);
            return SessionEnd::Lost;
        }
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                return SessionEnd::Closed;
            }
            maybe_frame = frame_rx.recv() => {
                let Some(frame) = maybe_frame else {
                    return SessionEnd::Closed;
                };
                if let Some(failed) = send_frame(&mut ws_tx, frame).await {
                    *pending = Some(failed);
                    return SessionEnd::Lost;
                }
            }
            maybe_msg = ws_rx.next() => {
                match read_inbound(maybe_msg, inbound_tx) {
                    ReadOutcome::Continue => {}
                    ReadOutcome::Lost => return SessionEnd::Lost,
                }
            }
        }
    }
}

enum ReadOutcome {
    Continue,
    Lost,
}

fn read_inbound(
    maybe_msg: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
    inbound_tx: &mpsc::UnboundedSender<ServerFrame>,
) -> ReadOutcome {
    match maybe_msg {
        Some(Ok(Message::Text(text))) => {
            match serde_json::from_str::<ServerFrame>(text.as_str()) {
                Ok(frame) => {
                    let _ = inbound_tx.send(frame);
                }
                Err(error) => debug!(%error, "Discarding unparseable inbound frame"),
            }
            ReadOutcome::Continue
        }
        // Ping/pong are answered by the protocol layer; binary is not
        // part of the wire schema.
        Some(Ok(Message::Close(_))) | None => ReadOutcome::Lost,
        Some(Ok(_)) => ReadOutcome::Continue,
        Some(Err(error)) => {
            debug!(%error, "Link read error");
            ReadOutcome::Lost
        }
    }
}

/// Send one frame; hands the frame back if the socket died mid-send so it
/// can be retried on the next session.
async fn send_frame(
    ws_tx: &mut SplitSink<WsStream, Message>,
    frame: ClientFrame,
) -> Option<ClientFrame> {
    let json = match serde_json::to_string(&frame) {
        Ok(json) => json,
        Err(error) => {
            warn!(%error, "Dropping unserializable frame");
            return None;
        }
    };
    match ws_tx.send(Message::Text(json.into())).await {
        Ok(()) => None,
        Err(error) => {
            debug!(%error, "Link send failed");
            Some(frame)
        }
    }
}
