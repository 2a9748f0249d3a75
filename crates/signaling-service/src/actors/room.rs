//! `RoomActor` - per-room actor that owns the router and every joined peer.
//!
//! Each `RoomActor`:
//! - Owns the room's media router exclusively
//! - Owns all peers, and through them every transport, producer and consumer
//! - Serializes joins, peer requests, disconnects and engine notifications
//! - Closes its router and reports to the registry once the last peer is gone
//!
//! # Peer Cleanup
//!
//! Removing a peer (leave, disconnect, supersession, shutdown) runs:
//! 1. cancel the peer token (stops its engine event forwarders)
//! 2. close consumers
//! 3. close producers; each one broadcasts `producerClosed` and closes the
//!    other peers' consumers of it
//! 4. close transports
//!
//! A failure closing one object is logged and counted, and the cascade goes on.

use super::messages::{
    ConsumerSnapshot, JoinOutcome, PeerSnapshot, PendingJoin, ProducerSnapshot, RegistryMessage,
    RoomMessage, RoomState, TransportSnapshot,
};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use crate::config::DEFAULT_ROOM_MAILBOX_SIZE;
use crate::dispatch::{self, PeerSender};
use crate::engine::{
    ConsumerEvent, ConsumerHandle, EngineError, MediaKind, ProducerEvent, ProducerHandle,
    RouterHandle, TransportConfig, TransportDirection, TransportEvent, TransportHandle,
};
use crate::errors::SignalingError;
use crate::observability::metrics::record_cleanup_failure;
use crate::protocol::{
    ConsumeResponse, ConsumerResumedResponse, JoinResponse, LeftResponse, PeerMediaState,
    PeerRequest, ProducedResponse, ProducerClosedResponse, ProducerInfo, Response, ServerEvent,
    SyncResponse, TransportConnectedResponse, TransportCreatedResponse,
};

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Settings every room is created with.
#[derive(Debug, Clone)]
pub struct RoomSettings {
    pub mailbox_size: usize,
    pub transport_config: TransportConfig,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            mailbox_size: DEFAULT_ROOM_MAILBOX_SIZE,
            transport_config: TransportConfig::default(),
        }
    }
}

/// Handle to a `RoomActor`.
///
/// Send or receive failures mean the room has already torn down and map to
/// [`SignalingError::RoomClosed`].
#[derive(Clone, Debug)]
pub struct RoomActorHandle {
    sender: mpsc::Sender<RoomMessage>,
    cancel_token: CancellationToken,
    room_id: String,
    instance_id: u64,
}

impl RoomActorHandle {
    #[must_use]
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    #[must_use]
    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    /// Hand a join to the room. Gives the join back if the room is gone.
    pub(super) async fn send_join(&self, join: PendingJoin) -> Result<(), PendingJoin> {
        match self.sender.reserve().await {
            Ok(permit) => {
                permit.send(RoomMessage::Join {
                    join,
                    room: self.clone(),
                });
                Ok(())
            }
            Err(_) => Err(join),
        }
    }

    /// Run a request on behalf of a joined peer.
    pub async fn request(
        &self,
        peer_id: String,
        connection_id: String,
        request: PeerRequest,
    ) -> Result<Response, SignalingError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::Request {
                peer_id,
                connection_id,
                request,
                respond_to: tx,
            })
            .await
            .map_err(|_| SignalingError::RoomClosed)?;

        rx.await.map_err(|_| SignalingError::RoomClosed)?
    }

    /// Explicit leave.
    pub async fn leave(
        &self,
        peer_id: String,
        connection_id: String,
    ) -> Result<LeftResponse, SignalingError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::Leave {
                peer_id,
                connection_id,
                respond_to: tx,
            })
            .await
            .map_err(|_| SignalingError::RoomClosed)?;

        rx.await.map_err(|_| SignalingError::RoomClosed)?
    }

    /// Notify the room that a peer's connection closed.
    pub async fn disconnected(
        &self,
        peer_id: String,
        connection_id: String,
    ) -> Result<(), SignalingError> {
        self.sender
            .send(RoomMessage::Disconnected {
                peer_id,
                connection_id,
            })
            .await
            .map_err(|_| SignalingError::RoomClosed)
    }

    pub async fn get_state(&self) -> Result<RoomState, SignalingError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::GetState { respond_to: tx })
            .await
            .map_err(|_| SignalingError::RoomClosed)?;

        rx.await.map_err(|_| SignalingError::RoomClosed)
    }

    /// Cancel the room; it cleans up every peer and closes its router.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// A cancelled room never accepts another join.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

struct PeerTransport {
    handle: Arc<dyn TransportHandle>,
    direction: TransportDirection,
}

struct PeerProducer {
    handle: Arc<dyn ProducerHandle>,
    transport_id: String,
    kind: MediaKind,
    app_data: Value,
}

struct PeerConsumer {
    handle: Arc<dyn ConsumerHandle>,
    transport_id: String,
    producer_id: String,
    producer_peer_id: String,
    paused: bool,
}

struct Peer {
    /// Connection currently bound to this peer id.
    connection_id: String,
    outbound: PeerSender,
    /// Child of the room token; bounds the engine event forwarders.
    token: CancellationToken,
    transports: HashMap<String, PeerTransport>,
    producers: HashMap<String, PeerProducer>,
    consumers: HashMap<String, PeerConsumer>,
}

impl Peer {
    fn new(connection_id: String, outbound: PeerSender, token: CancellationToken) -> Self {
        Self {
            connection_id,
            outbound,
            token,
            transports: HashMap::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
        }
    }

    fn media_state(&self, peer_id: &str) -> PeerMediaState {
        let mut state = PeerMediaState {
            peer_id: peer_id.to_string(),
            mic_on: false,
            camera_on: false,
            screen_on: false,
        };
        for producer in self.producers.values() {
            match producer.kind {
                MediaKind::Audio => state.mic_on = true,
                MediaKind::Video if is_screen(&producer.app_data) => state.screen_on = true,
                MediaKind::Video => state.camera_on = true,
            }
        }
        state
    }
}

/// `appData.screen === true` marks a screen-share producer.
fn is_screen(app_data: &Value) -> bool {
    matches!(app_data.get("screen"), Some(Value::Bool(true)))
}

fn recipients(peers: &HashMap<String, Peer>) -> impl Iterator<Item = (&str, &PeerSender)> {
    peers.iter().map(|(id, peer)| (id.as_str(), &peer.outbound))
}

fn peer_ref<'a>(
    peers: &'a HashMap<String, Peer>,
    peer_id: &str,
) -> Result<&'a Peer, SignalingError> {
    peers
        .get(peer_id)
        .ok_or_else(|| SignalingError::ProtocolState("not joined to this room".to_string()))
}

fn peer_mut<'a>(
    peers: &'a mut HashMap<String, Peer>,
    peer_id: &str,
) -> Result<&'a mut Peer, SignalingError> {
    peers
        .get_mut(peer_id)
        .ok_or_else(|| SignalingError::ProtocolState("not joined to this room".to_string()))
}

/// Log and count a failed close; never propagates.
fn note_close(room_id: &str, resource: &'static str, id: &str, result: Result<(), EngineError>) {
    if let Err(e) = result {
        warn!(
            target: "sig.actor.room",
            room_id = %room_id,
            resource,
            id = %id,
            error = %e,
            "Failed to close media object during cleanup"
        );
        record_cleanup_failure(resource);
    }
}

/// Forward engine notifications for one object into the room mailbox until
/// `on_event` yields a message, the token is cancelled, or the engine drops
/// the channel.
fn forward_engine_events<E, F>(
    mut events: broadcast::Receiver<E>,
    token: CancellationToken,
    room: mpsc::Sender<RoomMessage>,
    object_id: String,
    on_event: F,
) where
    E: Clone + fmt::Debug + Send + 'static,
    F: Fn(E) -> Option<RoomMessage> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => {
                        debug!(
                            target: "sig.actor.room",
                            object_id = %object_id,
                            event = ?event,
                            "Engine event"
                        );
                        if let Some(message) = on_event(event) {
                            // The room may already be gone; nothing left to notify
                            let _ = room.send(message).await;
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            target: "sig.actor.room",
                            object_id = %object_id,
                            skipped,
                            "Engine event subscription lagged"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    });
}

/// The `RoomActor` implementation.
pub struct RoomActor {
    room_id: String,
    instance_id: u64,
    router: Arc<dyn RouterHandle>,
    peers: HashMap<String, Peer>,
    receiver: mpsc::Receiver<RoomMessage>,
    /// Mailbox sender handed to engine event forwarders.
    events_tx: mpsc::Sender<RoomMessage>,
    registry: mpsc::Sender<RegistryMessage>,
    settings: RoomSettings,
    cancel_token: CancellationToken,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl RoomActor {
    /// Spawn a room actor around an already-created router.
    ///
    /// The room expects a join as its first message and stops as soon as it
    /// has no peers left.
    #[must_use]
    pub fn spawn(
        room_id: String,
        instance_id: u64,
        router: Arc<dyn RouterHandle>,
        registry: mpsc::Sender<RegistryMessage>,
        settings: RoomSettings,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (RoomActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(settings.mailbox_size.max(1));

        let handle = RoomActorHandle {
            sender: sender.clone(),
            cancel_token: cancel_token.clone(),
            room_id: room_id.clone(),
            instance_id,
        };

        let actor = Self {
            mailbox: MailboxMonitor::new(ActorType::Room, &room_id),
            room_id,
            instance_id,
            router,
            peers: HashMap::new(),
            receiver,
            events_tx: sender,
            registry,
            settings,
            cancel_token,
            metrics,
        };

        let task_handle = tokio::spawn(actor.run());

        (handle, task_handle)
    }

    #[instrument(
        skip_all,
        name = "sig.actor.room",
        fields(room_id = %self.room_id, instance_id = self.instance_id)
    )]
    async fn run(mut self) {
        info!(
            target: "sig.actor.room",
            room_id = %self.room_id,
            router_id = %self.router.id(),
            "RoomActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "sig.actor.room",
                        room_id = %self.room_id,
                        peer_count = self.peers.len(),
                        "RoomActor received cancellation signal"
                    );
                    self.close_all().await;
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

                    if self.peers.is_empty() {
                        self.close_empty().await;
                        break;
                    }
                }
            }
        }

        info!(
            target: "sig.actor.room",
            room_id = %self.room_id,
            messages_processed = self.mailbox.messages_processed(),
            "RoomActor stopped"
        );
    }

    async fn handle_message(&mut self, message: RoomMessage) {
        match message {
            RoomMessage::Join { join, room } => self.handle_join(join, room).await,

            RoomMessage::Request {
                peer_id,
                connection_id,
                request,
                respond_to,
            } => {
                let action = request.action();
                let result = self.handle_request(&peer_id, &connection_id, request).await;
                if let Err(e) = &result {
                    debug!(
                        target: "sig.actor.room",
                        room_id = %self.room_id,
                        peer_id = %peer_id,
                        action,
                        error = %e,
                        "Request failed"
                    );
                }
                let _ = respond_to.send(result);
            }

            RoomMessage::Leave {
                peer_id,
                connection_id,
                respond_to,
            } => {
                let result = match self.authorize(&peer_id, &connection_id) {
                    Ok(()) => {
                        self.remove_peer(&peer_id).await;
                        Ok(LeftResponse { left: true })
                    }
                    Err(e) => Err(e),
                };
                let _ = respond_to.send(result);
            }

            RoomMessage::Disconnected {
                peer_id,
                connection_id,
            } => {
                if self.authorize(&peer_id, &connection_id).is_ok() {
                    self.remove_peer(&peer_id).await;
                } else {
                    debug!(
                        target: "sig.actor.room",
                        room_id = %self.room_id,
                        peer_id = %peer_id,
                        connection_id = %connection_id,
                        "Ignoring disconnect from superseded connection"
                    );
                }
            }

            RoomMessage::TransportClosed {
                peer_id,
                transport_id,
            } => self.on_transport_closed(&peer_id, &transport_id).await,

            RoomMessage::ProducerClosed {
                peer_id,
                producer_id,
            } => {
                let producer = self
                    .peers
                    .get_mut(&peer_id)
                    .and_then(|peer| peer.producers.remove(&producer_id));
                if let Some(producer) = producer {
                    self.retire_producer(&peer_id, &producer_id, producer).await;
                }
            }

            RoomMessage::ConsumerClosed {
                peer_id,
                consumer_id,
            } => {
                let removed = self
                    .peers
                    .get_mut(&peer_id)
                    .and_then(|peer| peer.consumers.remove(&consumer_id));
                if removed.is_some() {
                    debug!(
                        target: "sig.actor.room",
                        room_id = %self.room_id,
                        peer_id = %peer_id,
                        consumer_id = %consumer_id,
                        "Consumer closed by engine"
                    );
                }
            }

            RoomMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }
        }
    }

    /// The peer must exist and be bound to this connection.
    fn authorize(&self, peer_id: &str, connection_id: &str) -> Result<(), SignalingError> {
        let peer = peer_ref(&self.peers, peer_id)?;
        if peer.connection_id == connection_id {
            Ok(())
        } else {
            Err(SignalingError::ProtocolState(
                "session superseded by a newer connection for this peer".to_string(),
            ))
        }
    }

    async fn handle_join(&mut self, join: PendingJoin, room: RoomActorHandle) {
        let PendingJoin {
            connection_id,
            peer_id,
            outbound,
            respond_to,
        } = join;
        let peer_id = peer_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        if let Some(stale) = self.peers.remove(&peer_id) {
            info!(
                target: "sig.actor.room",
                room_id = %self.room_id,
                peer_id = %peer_id,
                stale_connection_id = %stale.connection_id,
                connection_id = %connection_id,
                "Peer rejoined, superseding previous session"
            );
            self.cleanup_peer(&peer_id, stale).await;
        }

        let token = self.cancel_token.child_token();
        self.peers.insert(
            peer_id.clone(),
            Peer::new(connection_id.clone(), outbound, token),
        );
        self.metrics.peer_joined();

        let response = JoinResponse {
            room_id: self.room_id.clone(),
            peer_id: peer_id.clone(),
            rtp_capabilities: self.router.rtp_capabilities(),
            existing_producers: self.producer_infos(Some(&peer_id)),
        };

        if respond_to.send(Ok(JoinOutcome { room, response })).is_err() {
            debug!(
                target: "sig.actor.room",
                room_id = %self.room_id,
                peer_id = %peer_id,
                "Joining connection went away before the reply, rolling back"
            );
            if let Some(peer) = self.peers.remove(&peer_id) {
                self.cleanup_peer(&peer_id, peer).await;
            }
            self.broadcast_peer_count();
            return;
        }

        info!(
            target: "sig.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            connection_id = %connection_id,
            peer_count = self.peers.len(),
            "Peer joined"
        );
        self.broadcast_peer_count();
    }

    async fn handle_request(
        &mut self,
        peer_id: &str,
        connection_id: &str,
        request: PeerRequest,
    ) -> Result<Response, SignalingError> {
        self.authorize(peer_id, connection_id)?;

        match request {
            PeerRequest::Sync => Ok(Response::Sync(self.sync(peer_id))),
            PeerRequest::CreateTransport { direction } => self
                .create_transport(peer_id, &direction)
                .await
                .map(Response::CreateTransport),
            PeerRequest::ConnectTransport {
                transport_id,
                dtls_parameters,
            } => self
                .connect_transport(peer_id, transport_id, dtls_parameters)
                .await
                .map(Response::ConnectTransport),
            PeerRequest::Produce {
                transport_id,
                kind,
                rtp_parameters,
                app_data,
            } => self
                .produce(peer_id, &transport_id, kind, rtp_parameters, app_data)
                .await
                .map(Response::Produce),
            PeerRequest::Consume {
                transport_id,
                producer_id,
                rtp_capabilities,
            } => self
                .consume(peer_id, &transport_id, producer_id, rtp_capabilities)
                .await
                .map(Response::Consume),
            PeerRequest::ResumeConsumer { consumer_id } => self
                .resume_consumer(peer_id, consumer_id)
                .await
                .map(Response::ResumeConsumer),
            PeerRequest::CloseProducer { producer_id } => self
                .close_producer(peer_id, producer_id)
                .await
                .map(Response::CloseProducer),
        }
    }

    fn sync(&self, peer_id: &str) -> SyncResponse {
        SyncResponse {
            room_id: self.room_id.clone(),
            peers: self
                .peers
                .iter()
                .map(|(id, peer)| peer.media_state(id))
                .collect(),
            existing_producers: self.producer_infos(Some(peer_id)),
        }
    }

    /// Every producer in the room, optionally skipping one peer's.
    fn producer_infos(&self, except: Option<&str>) -> Vec<ProducerInfo> {
        self.peers
            .iter()
            .filter(|(id, _)| except != Some(id.as_str()))
            .flat_map(|(id, peer)| {
                peer.producers.iter().map(move |(producer_id, producer)| ProducerInfo {
                    producer_id: producer_id.clone(),
                    peer_id: id.clone(),
                    kind: producer.kind,
                    app_data: producer.app_data.clone(),
                })
            })
            .collect()
    }

    fn transport_of(
        &self,
        peer_id: &str,
        transport_id: &str,
    ) -> Result<(Arc<dyn TransportHandle>, TransportDirection), SignalingError> {
        peer_ref(&self.peers, peer_id)?
            .transports
            .get(transport_id)
            .map(|t| (Arc::clone(&t.handle), t.direction))
            .ok_or_else(|| SignalingError::NotFound(format!("transport {transport_id} not found")))
    }

    async fn create_transport(
        &mut self,
        peer_id: &str,
        direction: &str,
    ) -> Result<TransportCreatedResponse, SignalingError> {
        let direction = TransportDirection::parse(direction).ok_or_else(|| {
            SignalingError::ProtocolState(format!("invalid transport direction: {direction}"))
        })?;

        let transport = self
            .router
            .create_transport(&self.settings.transport_config)
            .await?;
        let transport_id = transport.id().to_string();

        let peer = peer_mut(&mut self.peers, peer_id)?;
        let (owner, id) = (peer_id.to_string(), transport_id.clone());
        forward_engine_events(
            transport.subscribe(),
            peer.token.clone(),
            self.events_tx.clone(),
            transport_id.clone(),
            move |event: TransportEvent| {
                event.is_terminal().then(|| RoomMessage::TransportClosed {
                    peer_id: owner.clone(),
                    transport_id: id.clone(),
                })
            },
        );
        peer.transports.insert(
            transport_id.clone(),
            PeerTransport {
                handle: Arc::clone(&transport),
                direction,
            },
        );

        debug!(
            target: "sig.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            transport_id = %transport_id,
            direction = direction.as_str(),
            "Transport created"
        );

        Ok(TransportCreatedResponse {
            id: transport_id,
            direction,
            ice_parameters: transport.ice_parameters(),
            ice_candidates: transport.ice_candidates(),
            dtls_parameters: transport.dtls_parameters(),
        })
    }

    async fn connect_transport(
        &mut self,
        peer_id: &str,
        transport_id: String,
        dtls_parameters: Value,
    ) -> Result<TransportConnectedResponse, SignalingError> {
        let (transport, _) = self.transport_of(peer_id, &transport_id)?;
        transport.connect(dtls_parameters).await?;

        Ok(TransportConnectedResponse {
            transport_id,
            connected: true,
        })
    }

    async fn produce(
        &mut self,
        peer_id: &str,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: Value,
        app_data: Value,
    ) -> Result<ProducedResponse, SignalingError> {
        let (transport, direction) = self.transport_of(peer_id, transport_id)?;
        if direction != TransportDirection::Send {
            return Err(SignalingError::ProtocolState(format!(
                "transport {transport_id} is not a send transport"
            )));
        }

        let producer = transport
            .produce(kind, rtp_parameters, app_data.clone())
            .await?;
        let producer_id = producer.id().to_string();

        let peer = peer_mut(&mut self.peers, peer_id)?;
        let (owner, id) = (peer_id.to_string(), producer_id.clone());
        forward_engine_events(
            producer.subscribe(),
            peer.token.clone(),
            self.events_tx.clone(),
            producer_id.clone(),
            move |event| match event {
                ProducerEvent::Closed => Some(RoomMessage::ProducerClosed {
                    peer_id: owner.clone(),
                    producer_id: id.clone(),
                }),
            },
        );
        peer.producers.insert(
            producer_id.clone(),
            PeerProducer {
                handle: producer,
                transport_id: transport_id.to_string(),
                kind,
                app_data: app_data.clone(),
            },
        );

        dispatch::broadcast(
            &self.room_id,
            recipients(&self.peers),
            Some(peer_id),
            &ServerEvent::NewProducer {
                peer_id: peer_id.to_string(),
                producer_id: producer_id.clone(),
                kind,
                app_data,
            },
        );

        info!(
            target: "sig.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            producer_id = %producer_id,
            kind = kind.as_str(),
            "Producer created"
        );

        Ok(ProducedResponse { producer_id })
    }

    async fn consume(
        &mut self,
        peer_id: &str,
        transport_id: &str,
        producer_id: String,
        rtp_capabilities: Value,
    ) -> Result<ConsumeResponse, SignalingError> {
        let (transport, direction) = self.transport_of(peer_id, transport_id)?;
        if direction != TransportDirection::Recv {
            return Err(SignalingError::ProtocolState(format!(
                "transport {transport_id} is not a recv transport"
            )));
        }

        let (owner_id, app_data) = self
            .peers
            .iter()
            .find_map(|(id, peer)| {
                peer.producers
                    .get(&producer_id)
                    .map(|p| (id.clone(), p.app_data.clone()))
            })
            .ok_or_else(|| SignalingError::NotFound(format!("producer {producer_id} not found")))?;

        if !self.router.can_consume(&producer_id, &rtp_capabilities) {
            return Err(SignalingError::Engine(format!(
                "cannot consume producer {producer_id} with the given rtpCapabilities"
            )));
        }

        let consumer = transport
            .consume(&producer_id, rtp_capabilities, true)
            .await?;
        let consumer_id = consumer.id().to_string();
        let kind = consumer.kind();

        if kind == MediaKind::Video {
            if let Err(e) = consumer.request_key_frame().await {
                warn!(
                    target: "sig.actor.room",
                    room_id = %self.room_id,
                    consumer_id = %consumer_id,
                    error = %e,
                    "Key frame request failed"
                );
            }
        }

        let peer = peer_mut(&mut self.peers, peer_id)?;
        let (subscriber, id) = (peer_id.to_string(), consumer_id.clone());
        forward_engine_events(
            consumer.subscribe(),
            peer.token.clone(),
            self.events_tx.clone(),
            consumer_id.clone(),
            move |event| match event {
                ConsumerEvent::ProducerClosed | ConsumerEvent::Closed => {
                    Some(RoomMessage::ConsumerClosed {
                        peer_id: subscriber.clone(),
                        consumer_id: id.clone(),
                    })
                }
            },
        );
        let rtp_parameters = consumer.rtp_parameters();
        peer.consumers.insert(
            consumer_id.clone(),
            PeerConsumer {
                handle: consumer,
                transport_id: transport_id.to_string(),
                producer_id: producer_id.clone(),
                producer_peer_id: owner_id.clone(),
                paused: true,
            },
        );

        debug!(
            target: "sig.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            consumer_id = %consumer_id,
            producer_id = %producer_id,
            "Consumer created (paused)"
        );

        Ok(ConsumeResponse {
            consumer_id,
            producer_id,
            kind,
            rtp_parameters,
            app_data,
            peer_id: owner_id,
        })
    }

    async fn resume_consumer(
        &mut self,
        peer_id: &str,
        consumer_id: String,
    ) -> Result<ConsumerResumedResponse, SignalingError> {
        let peer = peer_mut(&mut self.peers, peer_id)?;
        let consumer = peer
            .consumers
            .get_mut(&consumer_id)
            .ok_or_else(|| SignalingError::NotFound(format!("consumer {consumer_id} not found")))?;

        if consumer.paused {
            consumer.handle.resume().await?;
            consumer.paused = false;
        }

        Ok(ConsumerResumedResponse {
            consumer_id,
            resumed: true,
        })
    }

    async fn close_producer(
        &mut self,
        peer_id: &str,
        producer_id: String,
    ) -> Result<ProducerClosedResponse, SignalingError> {
        let removed = peer_mut(&mut self.peers, peer_id)?
            .producers
            .remove(&producer_id);

        let closed = match removed {
            Some(producer) => {
                self.retire_producer(peer_id, &producer_id, producer).await;
                true
            }
            None => false,
        };

        Ok(ProducerClosedResponse {
            producer_id,
            closed,
        })
    }

    /// Close an already-detached producer, drop every consumer of it and tell
    /// the rest of the room. One `producerClosed` per other member, plus one to
    /// the owner when it was consuming its own producer.
    async fn retire_producer(&mut self, owner_id: &str, producer_id: &str, producer: PeerProducer) {
        note_close(
            &self.room_id,
            "producer",
            producer_id,
            producer.handle.close().await,
        );

        let orphaned: Vec<(String, String, PeerConsumer)> = self
            .peers
            .iter_mut()
            .flat_map(|(peer_id, peer)| {
                let ids: Vec<String> = peer
                    .consumers
                    .iter()
                    .filter(|(_, c)| c.producer_id == producer_id)
                    .map(|(id, _)| id.clone())
                    .collect();
                ids.into_iter()
                    .filter_map(|id| peer.consumers.remove_entry(&id))
                    .map(|(id, consumer)| (peer_id.clone(), id, consumer))
                    .collect::<Vec<_>>()
            })
            .collect();
        let mut owner_was_consuming = false;
        for (consumer_peer, consumer_id, consumer) in orphaned {
            owner_was_consuming |= consumer_peer == owner_id;
            note_close(
                &self.room_id,
                "consumer",
                &consumer_id,
                consumer.handle.close().await,
            );
        }

        let event = ServerEvent::ProducerClosed {
            peer_id: owner_id.to_string(),
            producer_id: producer_id.to_string(),
            app_data: producer.app_data,
        };
        dispatch::broadcast(&self.room_id, recipients(&self.peers), Some(owner_id), &event);
        if owner_was_consuming {
            if let Some(owner) = self.peers.get(owner_id) {
                dispatch::send_to(owner_id, &owner.outbound, &event);
            }
        }

        info!(
            target: "sig.actor.room",
            room_id = %self.room_id,
            peer_id = %owner_id,
            producer_id = %producer_id,
            "Producer closed"
        );
    }

    async fn on_transport_closed(&mut self, peer_id: &str, transport_id: &str) {
        let Some(peer) = self.peers.get_mut(peer_id) else {
            return;
        };
        let Some(transport) = peer.transports.remove(transport_id) else {
            return;
        };

        let producer_ids: Vec<String> = peer
            .producers
            .iter()
            .filter(|(_, p)| p.transport_id == transport_id)
            .map(|(id, _)| id.clone())
            .collect();
        let producers: Vec<(String, PeerProducer)> = producer_ids
            .iter()
            .filter_map(|id| peer.producers.remove_entry(id))
            .collect();

        let consumer_ids: Vec<String> = peer
            .consumers
            .iter()
            .filter(|(_, c)| c.transport_id == transport_id)
            .map(|(id, _)| id.clone())
            .collect();
        let consumers: Vec<(String, PeerConsumer)> = consumer_ids
            .iter()
            .filter_map(|id| peer.consumers.remove_entry(id))
            .collect();

        info!(
            target: "sig.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            transport_id = %transport_id,
            producers = producers.len(),
            consumers = consumers.len(),
            "Transport closed"
        );

        note_close(
            &self.room_id,
            "transport",
            transport_id,
            transport.handle.close().await,
        );
        for (consumer_id, consumer) in consumers {
            note_close(
                &self.room_id,
                "consumer",
                &consumer_id,
                consumer.handle.close().await,
            );
        }
        for (producer_id, producer) in producers {
            self.retire_producer(peer_id, &producer_id, producer).await;
        }
    }

    /// Remove a peer that left or disconnected: `peerLeft`, cleanup, `peerCount`.
    async fn remove_peer(&mut self, peer_id: &str) {
        let Some(peer) = self.peers.remove(peer_id) else {
            return;
        };

        dispatch::broadcast(
            &self.room_id,
            recipients(&self.peers),
            None,
            &ServerEvent::PeerLeft {
                peer_id: peer_id.to_string(),
            },
        );
        self.cleanup_peer(peer_id, peer).await;
        self.broadcast_peer_count();

        info!(
            target: "sig.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            peer_count = self.peers.len(),
            "Peer left"
        );
    }

    /// Close everything a detached peer owns.
    async fn cleanup_peer(&mut self, peer_id: &str, peer: Peer) {
        peer.token.cancel();
        let Peer {
            transports,
            producers,
            consumers,
            ..
        } = peer;

        for (consumer_id, consumer) in consumers {
            note_close(
                &self.room_id,
                "consumer",
                &consumer_id,
                consumer.handle.close().await,
            );
        }
        for (producer_id, producer) in producers {
            self.retire_producer(peer_id, &producer_id, producer).await;
        }
        for (transport_id, transport) in transports {
            note_close(
                &self.room_id,
                "transport",
                &transport_id,
                transport.handle.close().await,
            );
        }

        self.metrics.peer_left();
        debug!(
            target: "sig.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            "Peer cleaned up"
        );
    }

    fn broadcast_peer_count(&self) {
        if self.peers.is_empty() {
            return;
        }
        dispatch::broadcast(
            &self.room_id,
            recipients(&self.peers),
            None,
            &ServerEvent::PeerCount {
                count: self.peers.len(),
            },
        );
    }

    fn snapshot(&self) -> RoomState {
        RoomState {
            room_id: self.room_id.clone(),
            instance_id: self.instance_id,
            router_id: self.router.id().to_string(),
            peers: self
                .peers
                .iter()
                .map(|(peer_id, peer)| PeerSnapshot {
                    peer_id: peer_id.clone(),
                    connection_id: peer.connection_id.clone(),
                    transports: peer
                        .transports
                        .iter()
                        .map(|(id, t)| TransportSnapshot {
                            transport_id: id.clone(),
                            direction: t.direction,
                        })
                        .collect(),
                    producers: peer
                        .producers
                        .iter()
                        .map(|(id, p)| ProducerSnapshot {
                            producer_id: id.clone(),
                            transport_id: p.transport_id.clone(),
                            kind: p.kind,
                            app_data: p.app_data.clone(),
                        })
                        .collect(),
                    consumers: peer
                        .consumers
                        .iter()
                        .map(|(id, c)| ConsumerSnapshot {
                            consumer_id: id.clone(),
                            transport_id: c.transport_id.clone(),
                            producer_id: c.producer_id.clone(),
                            producer_peer_id: c.producer_peer_id.clone(),
                            paused: c.paused,
                        })
                        .collect(),
                })
                .collect(),
        }
    }

    /// Last peer gone: close the router and report to the registry.
    async fn close_empty(&mut self) {
        note_close(&self.room_id, "router", self.router.id(), self.router.close().await);
        self.cancel_token.cancel();

        let registry = self.registry.clone();
        let room_id = self.room_id.clone();
        let instance_id = self.instance_id;
        // Spawned so a busy registry never blocks this room's exit
        tokio::spawn(async move {
            if registry
                .send(RegistryMessage::RoomClosed {
                    room_id,
                    instance_id,
                })
                .await
                .is_err()
            {
                debug!(target: "sig.actor.room", "Registry gone, room closure not reported");
            }
        });

        info!(
            target: "sig.actor.room",
            room_id = %self.room_id,
            "Room empty, router closed"
        );
    }

    /// Cancellation (registry shutdown): clean up every peer, close the router.
    async fn close_all(&mut self) {
        let peers: Vec<(String, Peer)> = self.peers.drain().collect();
        for (peer_id, peer) in peers {
            self.cleanup_peer(&peer_id, peer).await;
        }
        note_close(&self.room_id, "router", self.router.id(), self.router.close().await);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::dispatch::{outbound_channel, OutboundFrame};
    use crate::engine::{LocalEngine, MediaEngine};
    use serde_json::json;
    use std::time::Duration;

    struct TestRoom {
        handle: RoomActorHandle,
        task: JoinHandle<()>,
        router: Arc<dyn RouterHandle>,
        registry_rx: mpsc::Receiver<RegistryMessage>,
    }

    async fn spawn_room(room_id: &str) -> TestRoom {
        let router = LocalEngine::new().create_router().await.unwrap();
        let (registry_tx, registry_rx) = mpsc::channel(8);
        let (handle, task) = RoomActor::spawn(
            room_id.to_string(),
            1,
            Arc::clone(&router),
            registry_tx,
            RoomSettings::default(),
            CancellationToken::new(),
            ActorMetrics::new(),
        );
        TestRoom {
            handle,
            task,
            router,
            registry_rx,
        }
    }

    async fn join(
        room: &RoomActorHandle,
        peer_id: &str,
        connection_id: &str,
    ) -> (JoinResponse, mpsc::Receiver<OutboundFrame>) {
        let (outbound, rx) = outbound_channel(connection_id, 64);
        let (tx, reply) = oneshot::channel();
        room.send_join(PendingJoin {
            connection_id: connection_id.to_string(),
            peer_id: Some(peer_id.to_string()),
            outbound,
            respond_to: tx,
        })
        .await
        .unwrap();
        let outcome = reply.await.unwrap().unwrap();
        (outcome.response, rx)
    }

    async fn request(
        room: &RoomActorHandle,
        peer_id: &str,
        connection_id: &str,
        request: PeerRequest,
    ) -> Result<Response, SignalingError> {
        room.request(peer_id.to_string(), connection_id.to_string(), request)
            .await
    }

    async fn create_transport(
        room: &RoomActorHandle,
        peer_id: &str,
        connection_id: &str,
        direction: &str,
    ) -> String {
        match request(
            room,
            peer_id,
            connection_id,
            PeerRequest::CreateTransport {
                direction: direction.to_string(),
            },
        )
        .await
        .unwrap()
        {
            Response::CreateTransport(t) => t.id,
            other => unreachable!("unexpected response {other:?}"),
        }
    }

    async fn produce(
        room: &RoomActorHandle,
        peer_id: &str,
        connection_id: &str,
        transport_id: &str,
        kind: MediaKind,
        app_data: Value,
    ) -> String {
        let mime = match kind {
            MediaKind::Audio => "audio/opus",
            MediaKind::Video => "video/VP8",
        };
        match request(
            room,
            peer_id,
            connection_id,
            PeerRequest::Produce {
                transport_id: transport_id.to_string(),
                kind,
                rtp_parameters: json!({ "codecs": [{ "mimeType": mime }] }),
                app_data,
            },
        )
        .await
        .unwrap()
        {
            Response::Produce(p) => p.producer_id,
            other => unreachable!("unexpected response {other:?}"),
        }
    }

    /// Actions of every frame currently queued.
    fn drain(rx: &mut mpsc::Receiver<OutboundFrame>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(serde_json::from_str(&frame).unwrap());
        }
        frames
    }

    fn actions(frames: &[Value]) -> Vec<String> {
        frames
            .iter()
            .map(|f| f["action"].as_str().unwrap().to_string())
            .collect()
    }

    async fn next_frame(rx: &mut mpsc::Receiver<OutboundFrame>) -> Value {
        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("outbound queue closed");
        serde_json::from_str(&frame).unwrap()
    }

    #[tokio::test]
    async fn test_join_broadcasts_peer_count_to_everyone() {
        let room = spawn_room("r1").await;
        let (response, mut a_rx) = join(&room.handle, "A", "conn-a").await;
        assert_eq!(response.room_id, "r1");
        assert_eq!(response.peer_id, "A");
        assert!(response.existing_producers.is_empty());
        assert!(response.rtp_capabilities["codecs"].is_array());
        assert_eq!(
            drain(&mut a_rx),
            vec![json!({ "action": "peerCount", "data": { "count": 1 } })]
        );

        let (_, mut b_rx) = join(&room.handle, "B", "conn-b").await;
        let expected = json!({ "action": "peerCount", "data": { "count": 2 } });
        assert_eq!(drain(&mut a_rx), vec![expected.clone()]);
        assert_eq!(drain(&mut b_rx), vec![expected]);

        room.handle.cancel();
    }

    #[tokio::test]
    async fn test_join_without_peer_id_assigns_one() {
        let room = spawn_room("r1").await;
        let (outbound, _rx) = outbound_channel("conn-x", 8);
        let (tx, reply) = oneshot::channel();
        room.handle
            .send_join(PendingJoin {
                connection_id: "conn-x".to_string(),
                peer_id: None,
                outbound,
                respond_to: tx,
            })
            .await
            .unwrap();
        let outcome = reply.await.unwrap().unwrap();
        assert!(Uuid::parse_str(&outcome.response.peer_id).is_ok());
        assert_eq!(outcome.room.room_id(), "r1");

        room.handle.cancel();
    }

    #[tokio::test]
    async fn test_produce_notifies_others_and_sync_reports_flags() {
        let room = spawn_room("r1").await;
        let (_, mut a_rx) = join(&room.handle, "A", "conn-a").await;
        let (_, mut b_rx) = join(&room.handle, "B", "conn-b").await;
        drain(&mut a_rx);
        drain(&mut b_rx);

        let send = create_transport(&room.handle, "A", "conn-a", "send").await;
        let mic = produce(&room.handle, "A", "conn-a", &send, MediaKind::Audio, json!({})).await;
        let screen = produce(
            &room.handle,
            "A",
            "conn-a",
            &send,
            MediaKind::Video,
            json!({ "screen": true }),
        )
        .await;

        assert!(drain(&mut a_rx).is_empty(), "Producer owner is not notified");
        let events = drain(&mut b_rx);
        assert_eq!(actions(&events), vec!["newProducer", "newProducer"]);
        assert_eq!(events[0]["data"]["producerId"], json!(mic));
        assert_eq!(events[1]["data"]["appData"], json!({ "screen": true }));

        let Response::Sync(sync) = request(&room.handle, "B", "conn-b", PeerRequest::Sync)
            .await
            .unwrap()
        else {
            unreachable!("expected sync response");
        };
        let a_state = sync.peers.iter().find(|p| p.peer_id == "A").unwrap();
        assert!(a_state.mic_on);
        assert!(!a_state.camera_on, "screen share is not a camera");
        assert!(a_state.screen_on);
        assert_eq!(sync.existing_producers.len(), 2);
        assert!(sync
            .existing_producers
            .iter()
            .any(|p| p.producer_id == screen && p.peer_id == "A"));

        room.handle.cancel();
    }

    #[tokio::test]
    async fn test_request_validation() {
        let room = spawn_room("r1").await;
        let _a = join(&room.handle, "A", "conn-a").await;

        let err = request(
            &room.handle,
            "A",
            "conn-a",
            PeerRequest::CreateTransport {
                direction: "both".to_string(),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SignalingError::ProtocolState(_)));

        let err = request(
            &room.handle,
            "A",
            "conn-a",
            PeerRequest::ConnectTransport {
                transport_id: "missing".to_string(),
                dtls_parameters: json!({}),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SignalingError::NotFound(_)));

        let recv = create_transport(&room.handle, "A", "conn-a", "recv").await;
        let err = request(
            &room.handle,
            "A",
            "conn-a",
            PeerRequest::Produce {
                transport_id: recv,
                kind: MediaKind::Audio,
                rtp_parameters: json!({}),
                app_data: json!({}),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SignalingError::ProtocolState(_)));

        let err = request(&room.handle, "Z", "conn-z", PeerRequest::Sync)
            .await
            .unwrap_err();
        assert!(matches!(err, SignalingError::ProtocolState(_)));

        room.handle.cancel();
    }

    #[tokio::test]
    async fn test_consume_rules() {
        let room = spawn_room("r1").await;
        let _a = join(&room.handle, "A", "conn-a").await;
        let _b = join(&room.handle, "B", "conn-b").await;

        let send = create_transport(&room.handle, "A", "conn-a", "send").await;
        let camera = produce(&room.handle, "A", "conn-a", &send, MediaKind::Video, json!({})).await;
        let b_send = create_transport(&room.handle, "B", "conn-b", "send").await;
        let b_recv = create_transport(&room.handle, "B", "conn-b", "recv").await;
        let caps = json!({ "codecs": [{ "kind": "video", "mimeType": "video/VP8" }] });

        // Wrong direction
        let err = request(
            &room.handle,
            "B",
            "conn-b",
            PeerRequest::Consume {
                transport_id: b_send,
                producer_id: camera.clone(),
                rtp_capabilities: caps.clone(),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SignalingError::ProtocolState(_)));

        // Unknown producer
        let err = request(
            &room.handle,
            "B",
            "conn-b",
            PeerRequest::Consume {
                transport_id: b_recv.clone(),
                producer_id: "nope".to_string(),
                rtp_capabilities: caps.clone(),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SignalingError::NotFound(_)));

        // Incompatible capabilities
        let err = request(
            &room.handle,
            "B",
            "conn-b",
            PeerRequest::Consume {
                transport_id: b_recv.clone(),
                producer_id: camera.clone(),
                rtp_capabilities: json!({ "codecs": [{ "kind": "audio", "mimeType": "audio/opus" }] }),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SignalingError::Engine(_)));

        let Response::Consume(consumed) = request(
            &room.handle,
            "B",
            "conn-b",
            PeerRequest::Consume {
                transport_id: b_recv,
                producer_id: camera.clone(),
                rtp_capabilities: caps,
            },
        )
        .await
        .unwrap() else {
            unreachable!("expected consume response");
        };
        assert_eq!(consumed.peer_id, "A");
        assert_eq!(consumed.producer_id, camera);
        assert_eq!(consumed.kind, MediaKind::Video);

        let state = room.handle.get_state().await.unwrap();
        let b = state.peer("B").unwrap();
        assert_eq!(b.consumers.len(), 1);
        assert!(b.consumers[0].paused);
        assert_eq!(b.consumers[0].producer_peer_id, "A");

        for _ in 0..2 {
            let response = request(
                &room.handle,
                "B",
                "conn-b",
                PeerRequest::ResumeConsumer {
                    consumer_id: consumed.consumer_id.clone(),
                },
            )
            .await
            .unwrap();
            assert!(matches!(response, Response::ResumeConsumer(r) if r.resumed));
        }
        let state = room.handle.get_state().await.unwrap();
        assert!(!state.peer("B").unwrap().consumers[0].paused);

        let err = request(
            &room.handle,
            "B",
            "conn-b",
            PeerRequest::ResumeConsumer {
                consumer_id: "missing".to_string(),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SignalingError::NotFound(_)));

        room.handle.cancel();
    }

    #[tokio::test]
    async fn test_close_producer_notifies_each_member_once() {
        let room = spawn_room("r1").await;
        let (_, mut a_rx) = join(&room.handle, "A", "conn-a").await;
        let (_, mut b_rx) = join(&room.handle, "B", "conn-b").await;
        let (_, mut c_rx) = join(&room.handle, "C", "conn-c").await;

        let send = create_transport(&room.handle, "A", "conn-a", "send").await;
        let mic = produce(&room.handle, "A", "conn-a", &send, MediaKind::Audio, json!({})).await;
        let b_recv = create_transport(&room.handle, "B", "conn-b", "recv").await;
        request(
            &room.handle,
            "B",
            "conn-b",
            PeerRequest::Consume {
                transport_id: b_recv,
                producer_id: mic.clone(),
                rtp_capabilities: json!({ "codecs": [{ "kind": "audio", "mimeType": "audio/opus" }] }),
            },
        )
        .await
        .unwrap();
        drain(&mut a_rx);
        drain(&mut b_rx);
        drain(&mut c_rx);

        let response = request(
            &room.handle,
            "A",
            "conn-a",
            PeerRequest::CloseProducer {
                producer_id: mic.clone(),
            },
        )
        .await
        .unwrap();
        assert!(matches!(response, Response::CloseProducer(ref r) if r.closed));

        // Let the engine close events reach the room; they must not re-notify
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = room.handle.get_state().await.unwrap();

        assert!(drain(&mut a_rx).is_empty());
        assert_eq!(actions(&drain(&mut b_rx)), vec!["producerClosed"]);
        assert_eq!(actions(&drain(&mut c_rx)), vec!["producerClosed"]);

        let state = room.handle.get_state().await.unwrap();
        assert!(state.peer("B").unwrap().consumers.is_empty());

        let response = request(
            &room.handle,
            "A",
            "conn-a",
            PeerRequest::CloseProducer { producer_id: mic },
        )
        .await
        .unwrap();
        assert!(matches!(response, Response::CloseProducer(ref r) if !r.closed));

        room.handle.cancel();
    }

    #[tokio::test]
    async fn test_disconnect_order_and_room_close() {
        let mut room = spawn_room("r1").await;
        let (_, mut a_rx) = join(&room.handle, "A", "conn-a").await;
        let (_, mut b_rx) = join(&room.handle, "B", "conn-b").await;
        let send = create_transport(&room.handle, "B", "conn-b", "send").await;
        produce(&room.handle, "B", "conn-b", &send, MediaKind::Audio, json!({})).await;
        drain(&mut a_rx);
        drain(&mut b_rx);

        room.handle
            .disconnected("B".to_string(), "conn-b".to_string())
            .await
            .unwrap();
        let _ = room.handle.get_state().await.unwrap();

        let events = drain(&mut a_rx);
        assert_eq!(
            actions(&events),
            vec!["peerLeft", "producerClosed", "peerCount"]
        );
        assert_eq!(events[2]["data"]["count"], json!(1));

        room.handle
            .disconnected("A".to_string(), "conn-a".to_string())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), &mut room.task)
            .await
            .unwrap()
            .unwrap();

        assert!(room.router.is_closed());
        assert!(room.handle.is_cancelled());
        match room.registry_rx.recv().await.unwrap() {
            RegistryMessage::RoomClosed {
                room_id,
                instance_id,
            } => {
                assert_eq!(room_id, "r1");
                assert_eq!(instance_id, 1);
            }
            other => unreachable!("unexpected registry message {other:?}"),
        }

        let err = room
            .handle
            .request("A".to_string(), "conn-a".to_string(), PeerRequest::Sync)
            .await
            .unwrap_err();
        assert!(matches!(err, SignalingError::RoomClosed));
    }

    #[tokio::test]
    async fn test_rejoin_supersedes_previous_session() {
        let room = spawn_room("r1").await;
        let (_, _old_rx) = join(&room.handle, "A", "conn-old").await;
        let (_, mut b_rx) = join(&room.handle, "B", "conn-b").await;
        let send = create_transport(&room.handle, "A", "conn-old", "send").await;
        produce(&room.handle, "A", "conn-old", &send, MediaKind::Video, json!({})).await;
        drain(&mut b_rx);

        let (_, mut new_rx) = join(&room.handle, "A", "conn-new").await;
        assert_eq!(
            actions(&drain(&mut b_rx)),
            vec!["producerClosed", "peerCount"]
        );
        assert_eq!(actions(&drain(&mut new_rx)), vec!["peerCount"]);

        let err = request(&room.handle, "A", "conn-old", PeerRequest::Sync)
            .await
            .unwrap_err();
        assert!(matches!(err, SignalingError::ProtocolState(_)));

        // The stale connection's disconnect must not remove the new session
        room.handle
            .disconnected("A".to_string(), "conn-old".to_string())
            .await
            .unwrap();
        let state = room.handle.get_state().await.unwrap();
        let a = state.peer("A").unwrap();
        assert_eq!(a.connection_id, "conn-new");
        assert!(a.producers.is_empty());
        assert!(a.transports.is_empty());

        room.handle.cancel();
    }

    #[tokio::test]
    async fn test_leave_requires_matching_session() {
        let room = spawn_room("r1").await;
        let _a = join(&room.handle, "A", "conn-a").await;
        let (_, mut b_rx) = join(&room.handle, "B", "conn-b").await;
        drain(&mut b_rx);

        let err = room
            .handle
            .leave("A".to_string(), "conn-other".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, SignalingError::ProtocolState(_)));

        let left = room
            .handle
            .leave("A".to_string(), "conn-a".to_string())
            .await
            .unwrap();
        assert!(left.left);
        assert_eq!(actions(&drain(&mut b_rx)), vec!["peerLeft", "peerCount"]);

        room.handle.cancel();
    }

    #[tokio::test]
    async fn test_engine_transport_close_retires_producers() {
        let room = spawn_room("r1").await;
        let _a = join(&room.handle, "A", "conn-a").await;
        let (_, mut b_rx) = join(&room.handle, "B", "conn-b").await;
        let send = create_transport(&room.handle, "A", "conn-a", "send").await;
        let mic = produce(&room.handle, "A", "conn-a", &send, MediaKind::Audio, json!({})).await;
        drain(&mut b_rx);

        // Closing the router closes every transport engine-side
        room.router.close().await.unwrap();

        let event = next_frame(&mut b_rx).await;
        assert_eq!(event["action"], json!("producerClosed"));
        assert_eq!(event["data"]["producerId"], json!(mic));
        assert_eq!(event["data"]["peerId"], json!("A"));

        let state = room.handle.get_state().await.unwrap();
        let a = state.peer("A").unwrap();
        assert!(a.transports.is_empty());
        assert!(a.producers.is_empty());
        assert!(
            drain(&mut b_rx).is_empty(),
            "Exactly one producerClosed per closure"
        );

        room.handle.cancel();
    }

    #[tokio::test]
    async fn test_join_rolls_back_when_caller_is_gone() {
        let mut room = spawn_room("r1").await;
        let (outbound, _rx) = outbound_channel("conn-a", 8);
        let (tx, reply) = oneshot::channel();
        drop(reply);
        room.handle
            .send_join(PendingJoin {
                connection_id: "conn-a".to_string(),
                peer_id: Some("A".to_string()),
                outbound,
                respond_to: tx,
            })
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), &mut room.task)
            .await
            .unwrap()
            .unwrap();
        assert!(room.router.is_closed(), "Empty room closes its router");
    }

    #[tokio::test]
    async fn test_cancel_cleans_up_and_closes_router() {
        let mut room = spawn_room("r1").await;
        let _a = join(&room.handle, "A", "conn-a").await;
        create_transport(&room.handle, "A", "conn-a", "send").await;

        room.handle.cancel();
        tokio::time::timeout(Duration::from_secs(1), &mut room.task)
            .await
            .unwrap()
            .unwrap();
        assert!(room.router.is_closed());

        let (outbound, _rx) = outbound_channel("conn-b", 8);
        let (tx, _reply) = oneshot::channel();
        let returned = room
            .handle
            .send_join(PendingJoin {
                connection_id: "conn-b".to_string(),
                peer_id: None,
                outbound,
                respond_to: tx,
            })
            .await;
        assert!(returned.is_err(), "A stopped room hands the join back");
    }
}
