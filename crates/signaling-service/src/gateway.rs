//! Signaling gateway: per-connection protocol handler.
//!
//! A [`Session`] turns one inbound text frame into exactly one reply frame.
//! It tracks which room (if any) the connection has joined and routes every
//! peer request to that room's actor. Errors never end the session; each one
//! becomes an `<action>:error` reply.

use crate::actors::{RoomActorHandle, RoomRegistryHandle};
use crate::dispatch::PeerSender;
use crate::errors::SignalingError;
use crate::observability::metrics::{record_error, record_request};
use crate::protocol::{
    actions, error_frame, response_frame, Envelope, EnvelopeError, JoinRequest, LeftResponse,
    PeerRequest, Request, Response,
};

use std::time::Instant;
use tracing::{debug, error, info};

/// Attempts made when a join lands on a room that is tearing down.
const JOIN_RETRIES: usize = 3;

#[derive(Debug)]
struct JoinedRoom {
    room: RoomActorHandle,
    peer_id: String,
}

/// Protocol state of one connection.
#[derive(Debug)]
pub struct Session {
    connection_id: String,
    registry: RoomRegistryHandle,
    outbound: PeerSender,
    joined: Option<JoinedRoom>,
}

impl Session {
    /// `outbound` is the connection's event queue; rooms broadcast into it.
    #[must_use]
    pub fn new(registry: RoomRegistryHandle, outbound: PeerSender) -> Self {
        Self {
            connection_id: outbound.connection_id().to_string(),
            registry,
            outbound,
            joined: None,
        }
    }

    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Peer id and room id of the current membership.
    #[must_use]
    pub fn membership(&self) -> Option<(&str, &str)> {
        self.joined
            .as_ref()
            .map(|j| (j.peer_id.as_str(), j.room.room_id()))
    }

    /// Handle one text frame and produce the reply frame.
    pub async fn handle_text(&mut self, text: &str) -> String {
        let started = Instant::now();

        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(EnvelopeError {
                action,
                request_id,
                error,
            }) => {
                self.observe(&action, started, Some(&error));
                return error_frame(&action, &request_id, &error);
            }
        };

        let Envelope {
            action,
            request_id,
            data,
        } = envelope;

        let result = match Request::parse(&action, data) {
            Ok(request) => self.handle(request).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(response) => {
                self.observe(&action, started, None);
                response_frame(&action, &request_id, &response)
            }
            Err(e) => {
                self.observe(&action, started, Some(&e));
                error_frame(&action, &request_id, &e)
            }
        }
    }

    /// Dispatch a decoded request.
    pub async fn handle(&mut self, request: Request) -> Result<Response, SignalingError> {
        match request {
            Request::Join(join) => self.join(join).await,
            Request::Leave => self.leave().await,
            Request::Peer(request) => self.peer_request(request).await,
        }
    }

    async fn join(&mut self, join: JoinRequest) -> Result<Response, SignalingError> {
        let JoinRequest { room_id, peer_id } = join;

        if let Some(previous) = self.joined.take() {
            debug!(
                target: "sig.gateway",
                connection_id = %self.connection_id,
                room_id = %previous.room.room_id(),
                peer_id = %previous.peer_id,
                "Leaving current room before joining another"
            );
            if let Err(e) = previous
                .room
                .leave(previous.peer_id, self.connection_id.clone())
                .await
            {
                debug!(
                    target: "sig.gateway",
                    connection_id = %self.connection_id,
                    error = %e,
                    "Implicit leave failed"
                );
            }
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .registry
                .join_room(
                    room_id.clone(),
                    self.connection_id.clone(),
                    peer_id.clone(),
                    self.outbound.clone(),
                )
                .await
            {
                Ok(outcome) => {
                    info!(
                        target: "sig.gateway",
                        connection_id = %self.connection_id,
                        room_id = %room_id,
                        peer_id = %outcome.response.peer_id,
                        "Joined room"
                    );
                    self.joined = Some(JoinedRoom {
                        room: outcome.room,
                        peer_id: outcome.response.peer_id.clone(),
                    });
                    return Ok(Response::Join(outcome.response));
                }
                Err(SignalingError::RoomClosed) if attempt < JOIN_RETRIES => {
                    debug!(
                        target: "sig.gateway",
                        connection_id = %self.connection_id,
                        room_id = %room_id,
                        attempt,
                        "Room closed during join, retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn leave(&mut self) -> Result<Response, SignalingError> {
        let joined = self
            .joined
            .take()
            .ok_or_else(|| SignalingError::ProtocolState("not joined to a room".to_string()))?;

        match joined
            .room
            .leave(joined.peer_id.clone(), self.connection_id.clone())
            .await
        {
            Ok(left) => Ok(Response::Leave(left)),
            // Room already gone; the peer is gone with it
            Err(SignalingError::RoomClosed) => Ok(Response::Leave(LeftResponse { left: true })),
            Err(e) => Err(e),
        }
    }

    async fn peer_request(&mut self, request: PeerRequest) -> Result<Response, SignalingError> {
        let joined = self
            .joined
            .as_ref()
            .ok_or_else(|| SignalingError::ProtocolState("must join a room first".to_string()))?;

        let result = joined
            .room
            .request(joined.peer_id.clone(), self.connection_id.clone(), request)
            .await;

        if matches!(result, Err(SignalingError::RoomClosed)) {
            self.joined = None;
        }
        result
    }

    /// Connection closed: detach from the room, if joined.
    pub async fn close(&mut self) {
        let Some(joined) = self.joined.take() else {
            return;
        };
        if joined
            .room
            .disconnected(joined.peer_id.clone(), self.connection_id.clone())
            .await
            .is_err()
        {
            debug!(
                target: "sig.gateway",
                connection_id = %self.connection_id,
                peer_id = %joined.peer_id,
                "Room already closed at disconnect"
            );
        }
    }

    fn observe(&self, action: &str, started: Instant, error: Option<&SignalingError>) {
        let label = actions::metric_label(action);
        let elapsed = started.elapsed();

        match error {
            None => {
                record_request(label, "success", elapsed);
                debug!(
                    target: "sig.gateway",
                    connection_id = %self.connection_id,
                    action = label,
                    duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                    "Request handled"
                );
            }
            Some(e) => {
                record_request(label, "error", elapsed);
                record_error(label, e.error_type_label());
                if let SignalingError::Internal(detail) = e {
                    error!(
                        target: "sig.gateway",
                        connection_id = %self.connection_id,
                        action = label,
                        error = %detail,
                        "Request failed with internal error"
                    );
                } else {
                    debug!(
                        target: "sig.gateway",
                        connection_id = %self.connection_id,
                        action = label,
                        error_type = e.error_type_label(),
                        error = %e,
                        "Request rejected"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::actors::{ActorMetrics, RoomSettings};
    use crate::dispatch::{outbound_channel, OutboundFrame};
    use crate::engine::LocalEngine;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn registry() -> RoomRegistryHandle {
        RoomRegistryHandle::new(
            Arc::new(LocalEngine::new()),
            RoomSettings::default(),
            ActorMetrics::new(),
        )
    }

    fn session(
        registry: &RoomRegistryHandle,
        connection_id: &str,
    ) -> (Session, mpsc::Receiver<OutboundFrame>) {
        let (outbound, rx) = outbound_channel(connection_id, 64);
        (Session::new(registry.clone(), outbound), rx)
    }

    async fn call(session: &mut Session, frame: Value) -> Value {
        serde_json::from_str(&session.handle_text(&frame.to_string()).await).unwrap()
    }

    #[tokio::test]
    async fn test_request_id_is_echoed() {
        let registry = registry();
        let (mut s, _rx) = session(&registry, "conn-1");

        let reply = call(
            &mut s,
            json!({ "action": "join", "requestId": 42, "data": { "roomId": "r1", "peerId": "A" } }),
        )
        .await;
        assert_eq!(reply["action"], json!("join:response"));
        assert_eq!(reply["requestId"], json!(42));
        assert_eq!(reply["data"]["peerId"], json!("A"));
        assert_eq!(s.membership(), Some(("A", "r1")));

        registry.cancel();
    }

    #[tokio::test]
    async fn test_peer_requests_require_join() {
        let registry = registry();
        let (mut s, _rx) = session(&registry, "conn-1");

        for action in ["room:sync", "leave"] {
            let reply = call(&mut s, json!({ "action": action, "requestId": "x" })).await;
            assert_eq!(reply["action"], json!(format!("{action}:error")));
            assert!(reply["error"].is_string());
        }
        let reply = call(
            &mut s,
            json!({ "action": "createTransport", "requestId": "y", "data": { "direction": "send" } }),
        )
        .await;
        assert_eq!(reply["action"], json!("createTransport:error"));
        assert_eq!(reply["error"], json!("must join a room first"));

        registry.cancel();
    }

    #[tokio::test]
    async fn test_malformed_frames_get_error_replies() {
        let registry = registry();
        let (mut s, _rx) = session(&registry, "conn-1");

        let reply: Value = serde_json::from_str(&s.handle_text("not json").await).unwrap();
        assert_eq!(reply["action"], json!("unknown:error"));

        let reply = call(&mut s, json!({ "action": "teleport", "requestId": 1 })).await;
        assert_eq!(reply["action"], json!("teleport:error"));
        assert_eq!(reply["requestId"], json!(1));

        let reply = call(&mut s, json!({ "action": "join", "requestId": 2, "data": {} })).await;
        assert_eq!(reply["action"], json!("join:error"));

        // Session still usable
        let reply = call(
            &mut s,
            json!({ "action": "join", "requestId": 3, "data": { "roomId": "r1" } }),
        )
        .await;
        assert_eq!(reply["action"], json!("join:response"));

        registry.cancel();
    }

    #[tokio::test]
    async fn test_join_another_room_leaves_the_first() {
        let registry = registry();
        let (mut a, _a_rx) = session(&registry, "conn-a");
        let (mut b, mut b_rx) = session(&registry, "conn-b");

        call(&mut a, json!({ "action": "join", "data": { "roomId": "r1", "peerId": "A" } })).await;
        call(&mut b, json!({ "action": "join", "data": { "roomId": "r1", "peerId": "B" } })).await;
        while b_rx.try_recv().is_ok() {}

        let reply = call(
            &mut a,
            json!({ "action": "join", "data": { "roomId": "r2", "peerId": "A" } }),
        )
        .await;
        assert_eq!(reply["data"]["roomId"], json!("r2"));

        let left: Value = serde_json::from_str(&b_rx.recv().await.unwrap()).unwrap();
        assert_eq!(left["action"], json!("peerLeft"));
        assert_eq!(left["data"]["peerId"], json!("A"));

        let info = registry.get_room("r1".to_string()).await.unwrap();
        assert_eq!(info.peer_count, 1);

        registry.cancel();
    }

    #[tokio::test]
    async fn test_leave_then_rejoin() {
        let registry = registry();
        let (mut s, _rx) = session(&registry, "conn-1");

        call(&mut s, json!({ "action": "join", "data": { "roomId": "r1", "peerId": "A" } })).await;
        let reply = call(&mut s, json!({ "action": "leave", "requestId": "l" })).await;
        assert_eq!(reply["action"], json!("leave:response"));
        assert_eq!(reply["data"], json!({ "left": true }));
        assert!(s.membership().is_none());

        let reply = call(
            &mut s,
            json!({ "action": "join", "data": { "roomId": "r1", "peerId": "A" } }),
        )
        .await;
        assert_eq!(reply["action"], json!("join:response"));

        registry.cancel();
    }

    #[tokio::test]
    async fn test_close_disconnects_peer() {
        let registry = registry();
        let (mut s, _rx) = session(&registry, "conn-1");
        call(&mut s, json!({ "action": "join", "data": { "roomId": "r1" } })).await;

        s.close().await;
        assert!(s.membership().is_none());

        for _ in 0..50 {
            if registry.get_status().await.unwrap().room_count == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(registry.get_status().await.unwrap().room_count, 0);

        registry.cancel();
    }
}
