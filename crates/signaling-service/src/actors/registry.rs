//! `RoomRegistryActor` - singleton actor that maps room ids to live rooms.
//!
//! The registry:
//! - Creates a router and a `RoomActor` on the first join for a room id
//! - Forwards every join to the room that owns it
//! - Forgets a room when it reports itself empty (matching instance only)
//! - Drains all rooms on shutdown
//!
//! Joins travel registry -> room so that a room which is closing can never
//! swallow a join: a join handed to a stopped room comes back and the
//! registry retries on a fresh instance.

use super::messages::{
    JoinOutcome, PendingJoin, RegistryMessage, RegistryStatus, RoomInfo,
};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::room::{RoomActor, RoomActorHandle, RoomSettings};
use crate::config::DEFAULT_SHUTDOWN_TIMEOUT_SECONDS;
use crate::dispatch::PeerSender;
use crate::engine::MediaEngine;
use crate::errors::SignalingError;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Registry mailbox capacity.
const REGISTRY_CHANNEL_BUFFER: usize = 1000;

/// How many room instances a single join may be offered to.
const JOIN_ATTEMPTS: usize = 2;

/// Time a replaced or closed room task gets to finish in the background.
const ROOM_REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to the `RoomRegistryActor`.
#[derive(Clone, Debug)]
pub struct RoomRegistryHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
}

impl RoomRegistryHandle {
    /// Spawn the registry actor.
    #[must_use]
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        settings: RoomSettings,
        metrics: Arc<ActorMetrics>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(REGISTRY_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();

        let actor = RoomRegistryActor {
            receiver,
            self_sender: sender.clone(),
            cancel_token: cancel_token.clone(),
            engine,
            settings,
            rooms: HashMap::new(),
            next_instance: 1,
            accepting_new: true,
            shutdown_timeout: Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECONDS),
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Registry, "registry"),
        };

        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
        }
    }

    /// Join `room_id`, creating the room if needed.
    ///
    /// `peer_id` of `None` lets the room assign one.
    pub async fn join_room(
        &self,
        room_id: String,
        connection_id: String,
        peer_id: Option<String>,
        outbound: PeerSender,
    ) -> Result<JoinOutcome, SignalingError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::JoinRoom {
                room_id,
                join: PendingJoin {
                    connection_id,
                    peer_id,
                    outbound,
                    respond_to: tx,
                },
            })
            .await
            .map_err(|e| SignalingError::Internal(format!("channel send failed: {e}")))?;

        // A dropped reply means the join reached a room that stopped first
        rx.await.map_err(|_| SignalingError::RoomClosed)?
    }

    pub async fn get_room(&self, room_id: String) -> Result<RoomInfo, SignalingError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::GetRoom {
                room_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| SignalingError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SignalingError::Internal(format!("response receive failed: {e}")))?
    }

    pub async fn get_status(&self) -> Result<RegistryStatus, SignalingError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::GetStatus { respond_to: tx })
            .await
            .map_err(|e| SignalingError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SignalingError::Internal(format!("response receive failed: {e}")))
    }

    /// Stop accepting joins and drain every room, waiting at most `deadline`.
    ///
    /// The registry keeps answering (joins get [`SignalingError::Draining`])
    /// until it is cancelled.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), SignalingError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::Shutdown {
                deadline,
                respond_to: tx,
            })
            .await
            .map_err(|e| SignalingError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SignalingError::Internal(format!("response receive failed: {e}")))?
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Token cancelled together with the registry.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

struct ManagedRoom {
    handle: RoomActorHandle,
    task_handle: JoinHandle<()>,
    instance_id: u64,
    created_at: i64,
}

/// Await a room task that is already stopping, off the registry loop.
fn reap_in_background(room_id: String, instance_id: u64, task_handle: JoinHandle<()>) {
    tokio::spawn(async move {
        match tokio::time::timeout(ROOM_REAP_TIMEOUT, task_handle).await {
            Ok(Ok(())) => {
                debug!(
                    target: "sig.actor.registry",
                    room_id = %room_id,
                    instance_id,
                    "Room actor task completed cleanly"
                );
            }
            Ok(Err(e)) => {
                warn!(
                    target: "sig.actor.registry",
                    room_id = %room_id,
                    instance_id,
                    error = ?e,
                    "Room actor task panicked during removal"
                );
            }
            Err(_) => {
                warn!(
                    target: "sig.actor.registry",
                    room_id = %room_id,
                    instance_id,
                    "Room actor task cleanup timed out"
                );
            }
        }
    });
}

/// The `RoomRegistryActor` implementation.
pub struct RoomRegistryActor {
    receiver: mpsc::Receiver<RegistryMessage>,
    /// Handed to rooms so they can report closure.
    self_sender: mpsc::Sender<RegistryMessage>,
    /// Root token; every room token is a child.
    cancel_token: CancellationToken,
    engine: Arc<dyn MediaEngine>,
    settings: RoomSettings,
    rooms: HashMap<String, ManagedRoom>,
    next_instance: u64,
    accepting_new: bool,
    /// Drain budget used when cancelled without an explicit shutdown.
    shutdown_timeout: Duration,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl RoomRegistryActor {
    #[instrument(skip_all, name = "sig.actor.registry")]
    async fn run(mut self) {
        info!(target: "sig.actor.registry", "RoomRegistryActor started");

        loop {
            self.check_room_health().await;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "sig.actor.registry",
                        "RoomRegistryActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                msg = self.receiver.recv() => {
                    let Some(message) = msg else {
                        break;
                    };
                    self.mailbox.record_received(self.receiver.len());
                    self.handle_message(message).await;
                    self.mailbox.record_handled();
                    self.metrics.record_message_processed();
                }
            }
        }

        info!(
            target: "sig.actor.registry",
            rooms_remaining = self.rooms.len(),
            messages_processed = self.mailbox.messages_processed(),
            "RoomRegistryActor stopped"
        );
    }

    async fn handle_message(&mut self, message: RegistryMessage) {
        match message {
            RegistryMessage::JoinRoom { room_id, join } => self.join_room(room_id, join).await,

            RegistryMessage::RoomClosed {
                room_id,
                instance_id,
            } => self.room_closed(&room_id, instance_id),

            RegistryMessage::GetRoom {
                room_id,
                respond_to,
            } => {
                let result = self.get_room(&room_id).await;
                let _ = respond_to.send(result);
            }

            RegistryMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(RegistryStatus {
                    room_count: self.rooms.len(),
                    is_draining: !self.accepting_new,
                    mailbox_depth: self.mailbox.current_depth(),
                });
            }

            RegistryMessage::Shutdown {
                deadline,
                respond_to,
            } => {
                self.shutdown_timeout = deadline;
                self.graceful_shutdown().await;
                let _ = respond_to.send(Ok(()));
            }
        }
    }

    async fn join_room(&mut self, room_id: String, join: PendingJoin) {
        let mut join = join;
        for attempt in 1..=JOIN_ATTEMPTS {
            let room = match self.get_or_create(&room_id).await {
                Ok(room) => room,
                Err(e) => {
                    let _ = join.respond_to.send(Err(e));
                    return;
                }
            };

            match room.send_join(join).await {
                Ok(()) => return,
                Err(returned) => {
                    debug!(
                        target: "sig.actor.registry",
                        room_id = %room_id,
                        instance_id = room.instance_id(),
                        attempt,
                        "Room stopped before accepting join, retrying"
                    );
                    room.cancel();
                    join = returned;
                }
            }
        }

        let _ = join.respond_to.send(Err(SignalingError::RoomClosed));
    }

    /// Live room for `room_id`, creating one if absent or stopping.
    async fn get_or_create(&mut self, room_id: &str) -> Result<RoomActorHandle, SignalingError> {
        if !self.accepting_new {
            return Err(SignalingError::Draining);
        }

        if let Some(managed) = self.rooms.get(room_id) {
            if !managed.handle.is_cancelled() && !managed.task_handle.is_finished() {
                return Ok(managed.handle.clone());
            }
        }

        if let Some(stale) = self.rooms.remove(room_id) {
            debug!(
                target: "sig.actor.registry",
                room_id = %room_id,
                instance_id = stale.instance_id,
                "Replacing stopping room"
            );
            stale.handle.cancel();
            reap_in_background(room_id.to_string(), stale.instance_id, stale.task_handle);
            self.metrics.room_removed();
        }

        let router = self.engine.create_router().await.map_err(|e| {
            warn!(
                target: "sig.actor.registry",
                room_id = %room_id,
                error = %e,
                "Router creation failed"
            );
            SignalingError::from(e)
        })?;

        let instance_id = self.next_instance;
        self.next_instance += 1;

        let (handle, task_handle) = RoomActor::spawn(
            room_id.to_string(),
            instance_id,
            router,
            self.self_sender.clone(),
            self.settings.clone(),
            self.cancel_token.child_token(),
            Arc::clone(&self.metrics),
        );

        self.rooms.insert(
            room_id.to_string(),
            ManagedRoom {
                handle: handle.clone(),
                task_handle,
                instance_id,
                created_at: chrono::Utc::now().timestamp(),
            },
        );
        self.metrics.room_created();

        info!(
            target: "sig.actor.registry",
            room_id = %room_id,
            instance_id,
            total_rooms = self.rooms.len(),
            "Room created"
        );

        Ok(handle)
    }

    fn room_closed(&mut self, room_id: &str, instance_id: u64) {
        let matches = self
            .rooms
            .get(room_id)
            .is_some_and(|managed| managed.instance_id == instance_id);
        if !matches {
            debug!(
                target: "sig.actor.registry",
                room_id = %room_id,
                instance_id,
                "Ignoring closure of an already replaced room"
            );
            return;
        }

        if let Some(managed) = self.rooms.remove(room_id) {
            reap_in_background(room_id.to_string(), instance_id, managed.task_handle);
            self.metrics.room_removed();
            info!(
                target: "sig.actor.registry",
                room_id = %room_id,
                instance_id,
                total_rooms = self.rooms.len(),
                "Room removed"
            );
        }
    }

    async fn get_room(&self, room_id: &str) -> Result<RoomInfo, SignalingError> {
        let managed = self
            .rooms
            .get(room_id)
            .ok_or_else(|| SignalingError::NotFound(format!("room {room_id} not found")))?;

        let state = managed
            .handle
            .get_state()
            .await
            .map_err(|_| SignalingError::NotFound(format!("room {room_id} not found")))?;

        Ok(RoomInfo {
            room_id: state.room_id,
            instance_id: state.instance_id,
            router_id: state.router_id,
            peer_count: state.peers.len(),
            created_at: managed.created_at,
        })
    }

    /// Cancel every room and wait for them up to the shutdown budget.
    async fn graceful_shutdown(&mut self) {
        self.accepting_new = false;
        if self.rooms.is_empty() {
            return;
        }

        info!(
            target: "sig.actor.registry",
            room_count = self.rooms.len(),
            deadline_ms = u64::try_from(self.shutdown_timeout.as_millis()).unwrap_or(u64::MAX),
            "Draining rooms"
        );

        for managed in self.rooms.values() {
            managed.handle.cancel();
        }

        let deadline = Instant::now() + self.shutdown_timeout;
        for (room_id, managed) in self.rooms.drain() {
            match tokio::time::timeout_at(deadline, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "sig.actor.registry",
                        room_id = %room_id,
                        "Room actor completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "sig.actor.registry",
                        room_id = %room_id,
                        error = ?e,
                        "Room actor task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "sig.actor.registry",
                        room_id = %room_id,
                        "Room actor shutdown timed out"
                    );
                }
            }
            self.metrics.room_removed();
        }

        info!(target: "sig.actor.registry", "Graceful shutdown complete");
    }

    /// Drop rooms whose task ended without reporting closure.
    async fn check_room_health(&mut self) {
        let finished: Vec<String> = self
            .rooms
            .iter()
            .filter(|(_, managed)| managed.task_handle.is_finished())
            .map(|(room_id, _)| room_id.clone())
            .collect();

        for room_id in finished {
            let Some(managed) = self.rooms.remove(&room_id) else {
                continue;
            };
            match managed.task_handle.await {
                Ok(()) => {
                    debug!(
                        target: "sig.actor.registry",
                        room_id = %room_id,
                        instance_id = managed.instance_id,
                        "Room actor exited"
                    );
                }
                Err(join_error) if join_error.is_panic() => {
                    error!(
                        target: "sig.actor.registry",
                        room_id = %room_id,
                        instance_id = managed.instance_id,
                        error = ?join_error,
                        "Room actor panicked"
                    );
                    self.metrics.record_panic(ActorType::Room);
                }
                Err(join_error) => {
                    warn!(
                        target: "sig.actor.registry",
                        room_id = %room_id,
                        error = ?join_error,
                        "Room actor task cancelled"
                    );
                }
            }
            self.metrics.room_removed();
        }
    }
}
