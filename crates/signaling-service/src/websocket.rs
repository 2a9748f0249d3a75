//! WebSocket transport for the signaling protocol.
//!
//! Each connection is split into:
//! - a reader loop that feeds text frames to its [`Session`] one at a time
//!   and queues the reply before reading the next frame
//! - a writer task that drains the connection's outbound queue (replies and
//!   room events share it) and sends a Ping every heartbeat interval
//!
//! A connection that sends nothing (not even a Pong) for `idle_timeout` is
//! closed and runs the normal disconnect path.

use crate::actors::{ActorMetrics, ActorType, MailboxMonitor, RoomRegistryHandle};
use crate::config::{
    Config, DEFAULT_HEARTBEAT_INTERVAL_SECONDS, DEFAULT_IDLE_TIMEOUT_SECONDS,
    DEFAULT_OUTBOUND_QUEUE_SIZE,
};
use crate::dispatch::{outbound_channel, OutboundFrame};
use crate::errors::SignalingError;
use crate::gateway::Session;
use crate::observability::metrics::record_connection_duration;
use crate::protocol::{error_frame, UNKNOWN_ACTION};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures_util::{Sink, SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Per-connection settings.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    pub outbound_queue_size: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECONDS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECONDS),
            outbound_queue_size: DEFAULT_OUTBOUND_QUEUE_SIZE,
        }
    }
}

impl ConnectionSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval,
            idle_timeout: config.idle_timeout,
            outbound_queue_size: config.outbound_queue_size,
        }
    }
}

/// Shared state for the signaling router.
#[derive(Clone)]
pub struct SignalingState {
    pub registry: RoomRegistryHandle,
    pub settings: ConnectionSettings,
    pub metrics: Arc<ActorMetrics>,
}

/// Router serving the signaling WebSocket at `/ws`.
pub fn signaling_router(state: SignalingState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<SignalingState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

#[instrument(skip_all, name = "sig.ws.connection", fields(connection_id))]
async fn handle_socket(socket: WebSocket, state: SignalingState) {
    let connection_id = Uuid::new_v4().to_string();
    tracing::Span::current().record("connection_id", connection_id.as_str());
    let opened_at = Instant::now();
    let settings = state.settings;

    state.metrics.connection_opened();
    info!(target: "sig.ws", connection_id = %connection_id, "Connection opened");

    let (sink, mut stream) = socket.split();
    let (outbound, outbound_rx) =
        outbound_channel(connection_id.clone(), settings.outbound_queue_size);
    let writer_token = CancellationToken::new();
    let writer = tokio::spawn(write_loop(
        sink,
        outbound_rx,
        settings.heartbeat_interval,
        writer_token.clone(),
        connection_id.clone(),
    ));

    let mut session = Session::new(state.registry.clone(), outbound.clone());
    let mailbox = MailboxMonitor::new(ActorType::Connection, &connection_id);

    loop {
        let message = match tokio::time::timeout(settings.idle_timeout, stream.next()).await {
            Err(_) => {
                info!(
                    target: "sig.ws",
                    connection_id = %connection_id,
                    idle_timeout_ms = u64::try_from(settings.idle_timeout.as_millis()).unwrap_or(u64::MAX),
                    "Connection idle, closing"
                );
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(
                    target: "sig.ws",
                    connection_id = %connection_id,
                    error = %e,
                    "WebSocket receive error"
                );
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        let reply = match message {
            Message::Text(text) => {
                mailbox.record_received(outbound.queued());
                let reply = session.handle_text(&text).await;
                mailbox.record_handled();
                reply
            }
            Message::Binary(_) => error_frame(
                UNKNOWN_ACTION,
                &Value::Null,
                &SignalingError::Validation("binary frames are not supported".to_string()),
            ),
            Message::Close(_) => break,
            // Pings are answered by axum; any frame resets the idle timer
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        if !outbound.send_reply(reply).await {
            debug!(
                target: "sig.ws",
                connection_id = %connection_id,
                "Writer gone, closing connection"
            );
            break;
        }
    }

    session.close().await;
    writer_token.cancel();
    if let Err(e) = writer.await {
        debug!(
            target: "sig.ws",
            connection_id = %connection_id,
            error = ?e,
            "Writer task ended abnormally"
        );
    }

    state.metrics.connection_closed();
    record_connection_duration(opened_at.elapsed());
    info!(
        target: "sig.ws",
        connection_id = %connection_id,
        frames_handled = mailbox.messages_processed(),
        duration_ms = u64::try_from(opened_at.elapsed().as_millis()).unwrap_or(u64::MAX),
        "Connection closed"
    );
}

async fn write_loop<S>(
    mut sink: S,
    mut frames: mpsc::Receiver<OutboundFrame>,
    heartbeat_interval: Duration,
    token: CancellationToken,
    connection_id: String,
) where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    // First tick completes immediately
    heartbeat.tick().await;

    loop {
        tokio::select! {
            () = token.cancelled() => {
                // Flush whatever is already queued (e.g. the last reply)
                while let Ok(frame) = frames.try_recv() {
                    if sink.send(Message::Text(frame.to_string())).await.is_err() {
                        break;
                    }
                }
                break;
            }
            frame = frames.recv() => {
                let Some(frame) = frame else {
                    break;
                };
                if let Err(e) = sink.send(Message::Text(frame.to_string())).await {
                    debug!(
                        target: "sig.ws",
                        connection_id = %connection_id,
                        error = %e,
                        "WebSocket send failed"
                    );
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tokio_util::sync::PollSender;

    fn spawn_writer(
        heartbeat: Duration,
    ) -> (
        mpsc::Sender<OutboundFrame>,
        mpsc::Receiver<Message>,
        CancellationToken,
        tokio::task::JoinHandle<()>,
    ) {
        let (sink_tx, sink_rx) = mpsc::channel(16);
        let (frames_tx, frames_rx) = mpsc::channel(4);
        let token = CancellationToken::new();
        let writer = tokio::spawn(write_loop(
            PollSender::new(sink_tx),
            frames_rx,
            heartbeat,
            token.clone(),
            "conn-1".to_string(),
        ));
        (frames_tx, sink_rx, token, writer)
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_loop_pings_on_heartbeat() {
        let (frames, mut sink, token, writer) = spawn_writer(Duration::from_secs(20));

        frames.send(Arc::from("hello")).await.unwrap();
        assert!(matches!(sink.recv().await, Some(Message::Text(text)) if text == "hello"));

        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(matches!(sink.recv().await, Some(Message::Ping(_))));

        token.cancel();
        writer.await.unwrap();
        assert!(sink.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_loop_flushes_queue_on_cancel() {
        let (frames, mut sink, token, writer) = spawn_writer(Duration::from_secs(20));

        frames.send(Arc::from("reply-1")).await.unwrap();
        frames.send(Arc::from("reply-2")).await.unwrap();
        token.cancel();
        writer.await.unwrap();

        let mut texts = Vec::new();
        while let Some(message) = sink.recv().await {
            if let Message::Text(text) = message {
                texts.push(text);
            }
        }
        assert_eq!(texts, vec!["reply-1".to_string(), "reply-2".to_string()]);
    }

    #[test]
    fn test_connection_settings_from_config() {
        let config = Config::from_vars(&std::collections::HashMap::from([
            ("SIGNALING_HEARTBEAT_INTERVAL_SECONDS".to_string(), "5".to_string()),
            ("SIGNALING_IDLE_TIMEOUT_SECONDS".to_string(), "15".to_string()),
        ]))
        .unwrap();

        let settings = ConnectionSettings::from_config(&config);
        assert_eq!(settings.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(settings.idle_timeout, Duration::from_secs(15));
        assert_eq!(settings.outbound_queue_size, DEFAULT_OUTBOUND_QUEUE_SIZE);
    }
}
