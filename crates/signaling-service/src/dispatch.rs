//! Notification dispatcher.
//!
//! Each connection owns a bounded outbound queue of pre-serialized frames,
//! drained by its WebSocket writer. Room events are serialized once and
//! enqueued with `try_send` on every recipient's queue, so a slow or dead
//! client loses its own events instead of stalling the room actor.
//!
//! Request replies go through the same queue with an awaited send, so one
//! writer task owns the socket. Events a room emits while handling a request
//! are queued before that request's reply.

use crate::observability::metrics::{record_event_dropped, record_event_sent};
use crate::protocol::ServerEvent;

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// A frame ready to be written to the socket.
pub type OutboundFrame = Arc<str>;

/// Create the outbound queue for one connection.
#[must_use]
pub fn outbound_channel(
    connection_id: impl Into<String>,
    capacity: usize,
) -> (PeerSender, mpsc::Receiver<OutboundFrame>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        PeerSender {
            connection_id: connection_id.into(),
            tx,
        },
        rx,
    )
}

/// Handle to one connection's outbound queue.
#[derive(Clone, Debug)]
pub struct PeerSender {
    connection_id: String,
    tx: mpsc::Sender<OutboundFrame>,
}

impl PeerSender {
    /// Connection this queue belongs to.
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Frames waiting to be written.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.tx.max_capacity().saturating_sub(self.tx.capacity())
    }

    /// Whether the connection's writer has gone away.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Enqueue an event frame without waiting.
    ///
    /// Returns `false` if the queue is full or closed; the frame is dropped.
    pub fn try_deliver(&self, frame: &OutboundFrame) -> bool {
        match self.tx.try_send(Arc::clone(frame)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    target: "sig.dispatch",
                    connection_id = %self.connection_id,
                    "Outbound queue full, event dropped"
                );
                record_event_dropped("queue_full");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(
                    target: "sig.dispatch",
                    connection_id = %self.connection_id,
                    "Outbound queue closed (client disconnected)"
                );
                record_event_dropped("closed");
                false
            }
        }
    }

    /// Enqueue a reply frame, waiting for queue space.
    ///
    /// Returns `false` if the connection's writer is gone.
    pub async fn send_reply(&self, frame: String) -> bool {
        self.tx.send(Arc::from(frame)).await.is_ok()
    }
}

/// Serialize an event once for fan-out.
#[must_use]
pub fn encode_event(event: &ServerEvent) -> Option<OutboundFrame> {
    match serde_json::to_string(event) {
        Ok(text) => Some(Arc::from(text)),
        Err(e) => {
            error!(
                target: "sig.dispatch",
                event = event.name(),
                error = %e,
                "Failed to serialize event"
            );
            None
        }
    }
}

/// Deliver `event` to every recipient except `except`.
///
/// Returns the number of queues the event was placed on.
pub fn broadcast<'a, I>(room_id: &str, recipients: I, except: Option<&str>, event: &ServerEvent) -> usize
where
    I: IntoIterator<Item = (&'a str, &'a PeerSender)>,
{
    let Some(frame) = encode_event(event) else {
        return 0;
    };

    let mut delivered = 0;
    for (peer_id, sender) in recipients {
        if except == Some(peer_id) {
            continue;
        }
        if sender.try_deliver(&frame) {
            delivered += 1;
        }
    }

    record_event_sent(event.name(), delivered);
    debug!(
        target: "sig.dispatch",
        room_id = %room_id,
        event = event.name(),
        delivered,
        "Event broadcast"
    );
    delivered
}

/// Deliver `event` to a single peer.
pub fn send_to(peer_id: &str, sender: &PeerSender, event: &ServerEvent) -> bool {
    let Some(frame) = encode_event(event) else {
        return false;
    };
    let delivered = sender.try_deliver(&frame);
    if delivered {
        record_event_sent(event.name(), 1);
    }
    debug!(
        target: "sig.dispatch",
        peer_id = %peer_id,
        event = event.name(),
        delivered,
        "Event sent"
    );
    delivered
}
