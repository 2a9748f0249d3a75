//! Message types for actor communication.
//!
//! All inter-actor communication uses strongly-typed message passing via `tokio::sync::mpsc`.
//! Response patterns use `tokio::sync::oneshot` for request-reply semantics.

use super::room::RoomActorHandle;
use crate::dispatch::PeerSender;
use crate::engine::{MediaKind, TransportDirection};
use crate::errors::SignalingError;
use crate::protocol::{JoinResponse, LeftResponse, PeerRequest, Response};

use serde_json::Value;
use std::time::Duration;
use tokio::sync::oneshot;

/// A join travelling from a connection, through the registry, to a room.
#[derive(Debug)]
pub struct PendingJoin {
    pub connection_id: String,
    /// `None` asks the room to assign a fresh id.
    pub peer_id: Option<String>,
    pub outbound: PeerSender,
    pub respond_to: oneshot::Sender<Result<JoinOutcome, SignalingError>>,
}

/// Successful join: the room to talk to from now on and the reply payload.
#[derive(Debug)]
pub struct JoinOutcome {
    pub room: RoomActorHandle,
    pub response: JoinResponse,
}

/// Messages sent to `RoomRegistryActor`.
#[derive(Debug)]
pub enum RegistryMessage {
    /// Resolve (or create) `room_id` and hand the join to its actor.
    JoinRoom { room_id: String, join: PendingJoin },

    /// A room emptied and stopped. Sent by the room itself.
    RoomClosed { room_id: String, instance_id: u64 },

    /// Introspect one room.
    GetRoom {
        room_id: String,
        respond_to: oneshot::Sender<Result<RoomInfo, SignalingError>>,
    },

    /// Get current registry status (for health checks).
    GetStatus {
        respond_to: oneshot::Sender<RegistryStatus>,
    },

    /// Stop accepting joins and drain every room.
    Shutdown {
        /// How long rooms get to finish cleanup.
        deadline: Duration,
        respond_to: oneshot::Sender<Result<(), SignalingError>>,
    },
}

/// Messages sent to `RoomActor`.
#[derive(Debug)]
pub enum RoomMessage {
    /// Register a peer. `room` is the handle returned to the caller on success.
    Join {
        join: PendingJoin,
        room: RoomActorHandle,
    },

    /// Any request from an already-joined peer.
    Request {
        peer_id: String,
        connection_id: String,
        request: PeerRequest,
        respond_to: oneshot::Sender<Result<Response, SignalingError>>,
    },

    /// Explicit `leave`; the connection stays open.
    Leave {
        peer_id: String,
        connection_id: String,
        respond_to: oneshot::Sender<Result<LeftResponse, SignalingError>>,
    },

    /// The connection bound to `peer_id` went away.
    Disconnected {
        peer_id: String,
        connection_id: String,
    },

    /// Engine reported the transport closed (DTLS closed or transport close).
    TransportClosed {
        peer_id: String,
        transport_id: String,
    },

    /// Engine reported the producer closed.
    ProducerClosed {
        peer_id: String,
        producer_id: String,
    },

    /// Engine reported the consumer closed.
    ConsumerClosed {
        peer_id: String,
        consumer_id: String,
    },

    /// Snapshot of the room (introspection and tests).
    GetState {
        respond_to: oneshot::Sender<RoomState>,
    },
}

/// Registry status.
#[derive(Debug, Clone)]
pub struct RegistryStatus {
    pub room_count: usize,
    pub is_draining: bool,
    pub mailbox_depth: usize,
}

/// Summary of one live room.
#[derive(Debug, Clone)]
pub struct RoomInfo {
    pub room_id: String,
    /// Distinguishes successive rooms that reused the same id.
    pub instance_id: u64,
    pub router_id: String,
    pub peer_count: usize,
    /// Unix timestamp (seconds).
    pub created_at: i64,
}

/// Full snapshot of a room's state.
#[derive(Debug, Clone)]
pub struct RoomState {
    pub room_id: String,
    pub instance_id: u64,
    pub router_id: String,
    pub peers: Vec<PeerSnapshot>,
}

impl RoomState {
    #[must_use]
    pub fn peer(&self, peer_id: &str) -> Option<&PeerSnapshot> {
        self.peers.iter().find(|p| p.peer_id == peer_id)
    }
}

#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub peer_id: String,
    pub connection_id: String,
    pub transports: Vec<TransportSnapshot>,
    pub producers: Vec<ProducerSnapshot>,
    pub consumers: Vec<ConsumerSnapshot>,
}

#[derive(Debug, Clone)]
pub struct TransportSnapshot {
    pub transport_id: String,
    pub direction: TransportDirection,
}

#[derive(Debug, Clone)]
pub struct ProducerSnapshot {
    pub producer_id: String,
    pub transport_id: String,
    pub kind: MediaKind,
    pub app_data: Value,
}

#[derive(Debug, Clone)]
pub struct ConsumerSnapshot {
    pub consumer_id: String,
    pub transport_id: String,
    pub producer_id: String,
    pub producer_peer_id: String,
    pub paused: bool,
}
