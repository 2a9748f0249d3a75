//! In-process media engine.
//!
//! `LocalEngine` performs the bookkeeping side of an SFU engine (object ids,
//! ICE/DTLS parameter generation, capability matching, close propagation)
//! without forwarding any packets. The binary uses it when no external media
//! worker is attached, and the unit tests drive the room actor through it.
//!
//! Close propagation follows the usual SFU rules:
//! - closing a router closes its transports
//! - closing a transport closes the producers and consumers created on it
//! - closing a producer closes every consumer of it (`ConsumerEvent::ProducerClosed`)

use super::{
    ConsumerEvent, ConsumerHandle, DtlsState, EngineError, MediaEngine, MediaKind, ProducerEvent,
    ProducerHandle, RouterHandle, TransportConfig, TransportEvent, TransportHandle,
};

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// Capacity of every per-object event channel.
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// First port handed out for local ICE candidates.
const FIRST_RTC_PORT: u16 = 40000;

/// Number of ports in the local candidate range.
const RTC_PORT_RANGE: u16 = 10000;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Router capabilities used when none are configured: Opus, VP8 and H264.
#[must_use]
pub fn default_rtp_capabilities() -> Value {
    json!({
        "codecs": [
            {
                "kind": "audio",
                "mimeType": "audio/opus",
                "preferredPayloadType": 100,
                "clockRate": 48000,
                "channels": 2
            },
            {
                "kind": "video",
                "mimeType": "video/VP8",
                "preferredPayloadType": 101,
                "clockRate": 90000
            },
            {
                "kind": "video",
                "mimeType": "video/H264",
                "preferredPayloadType": 102,
                "clockRate": 90000,
                "parameters": {
                    "packetization-mode": 1,
                    "profile-level-id": "42e01f"
                }
            }
        ],
        "headerExtensions": []
    })
}

/// Lower-cased `mimeType` of every entry in `value.codecs`.
fn mime_types(value: &Value) -> HashSet<String> {
    value
        .get("codecs")
        .and_then(Value::as_array)
        .map(|codecs| {
            codecs
                .iter()
                .filter_map(|codec| codec.get("mimeType").and_then(Value::as_str))
                .map(str::to_ascii_lowercase)
                .collect()
        })
        .unwrap_or_default()
}

/// Kinds advertised by `value.codecs[].kind`.
fn codec_kinds(value: &Value) -> HashSet<String> {
    value
        .get("codecs")
        .and_then(Value::as_array)
        .map(|codecs| {
            codecs
                .iter()
                .filter_map(|codec| codec.get("kind").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn fingerprint() -> String {
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();
    first
        .as_bytes()
        .iter()
        .chain(second.as_bytes().iter())
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// In-process [`MediaEngine`].
#[derive(Debug)]
pub struct LocalEngine {
    rtp_capabilities: Value,
    next_port: Arc<AtomicU16>,
    routers_created: AtomicU64,
}

impl Default for LocalEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capabilities(default_rtp_capabilities())
    }

    /// Create an engine whose routers advertise `rtp_capabilities`.
    #[must_use]
    pub fn with_capabilities(rtp_capabilities: Value) -> Self {
        Self {
            rtp_capabilities,
            next_port: Arc::new(AtomicU16::new(0)),
            routers_created: AtomicU64::new(0),
        }
    }

    /// Number of routers created so far.
    #[must_use]
    pub fn routers_created(&self) -> u64 {
        self.routers_created.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MediaEngine for LocalEngine {
    async fn create_router(&self) -> Result<Arc<dyn RouterHandle>, EngineError> {
        self.routers_created.fetch_add(1, Ordering::Relaxed);
        let router = LocalRouter::new(self.rtp_capabilities.clone(), Arc::clone(&self.next_port));
        debug!(target: "sig.engine.local", router_id = %router.id, "Router created");
        Ok(Arc::new(router))
    }
}

/// State shared between a router and the objects created through it.
#[derive(Debug)]
struct RouterShared {
    producers: Mutex<HashMap<String, Arc<LocalProducer>>>,
    transports: Mutex<Vec<Arc<LocalTransport>>>,
    next_port: Arc<AtomicU16>,
}

impl RouterShared {
    fn allocate_port(&self) -> u16 {
        let offset = self.next_port.fetch_add(1, Ordering::Relaxed) % RTC_PORT_RANGE;
        FIRST_RTC_PORT + offset
    }
}

/// Router created by [`LocalEngine`].
#[derive(Debug)]
pub struct LocalRouter {
    id: String,
    rtp_capabilities: Value,
    shared: Arc<RouterShared>,
    closed: AtomicBool,
}

impl LocalRouter {
    fn new(rtp_capabilities: Value, next_port: Arc<AtomicU16>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            rtp_capabilities,
            shared: Arc::new(RouterShared {
                producers: Mutex::new(HashMap::new()),
                transports: Mutex::new(Vec::new()),
                next_port,
            }),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of live producers on this router.
    #[must_use]
    pub fn producer_count(&self) -> usize {
        lock(&self.shared.producers).len()
    }

    /// Number of live transports on this router.
    #[must_use]
    pub fn transport_count(&self) -> usize {
        lock(&self.shared.transports).len()
    }
}

#[async_trait]
impl RouterHandle for LocalRouter {
    fn id(&self) -> &str {
        &self.id
    }

    fn rtp_capabilities(&self) -> Value {
        self.rtp_capabilities.clone()
    }

    fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> bool {
        if self.is_closed() {
            return false;
        }
        let Some(producer) = lock(&self.shared.producers).get(producer_id).cloned() else {
            return false;
        };

        let producer_mimes = mime_types(&producer.rtp_parameters);
        if producer_mimes.is_empty() {
            // Producer did not declare codecs, match on kind only
            return codec_kinds(rtp_capabilities).contains(producer.kind.as_str());
        }
        let consumer_mimes = mime_types(rtp_capabilities);
        !producer_mimes.is_disjoint(&consumer_mimes)
    }

    async fn create_transport(
        &self,
        config: &TransportConfig,
    ) -> Result<Arc<dyn TransportHandle>, EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed("router"));
        }
        let transport =
            Arc::new_cyclic(|this| LocalTransport::new(config, &self.shared, this.clone()));
        lock(&self.shared.transports).push(Arc::clone(&transport));
        Ok(transport)
    }

    async fn close(&self) -> Result<(), EngineError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let transports: Vec<_> = lock(&self.shared.transports).drain(..).collect();
        for transport in transports {
            transport.close_internal();
        }
        lock(&self.shared.producers).clear();
        debug!(target: "sig.engine.local", router_id = %self.id, "Router closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct TransportState {
    dtls: DtlsState,
    producers: Vec<Arc<LocalProducer>>,
    consumers: Vec<Arc<LocalConsumer>>,
}

/// Transport created by [`LocalRouter`].
#[derive(Debug)]
pub struct LocalTransport {
    id: String,
    ice_parameters: Value,
    ice_candidates: Value,
    dtls_parameters: Value,
    router: Weak<RouterShared>,
    this: Weak<LocalTransport>,
    state: Mutex<TransportState>,
    closed: AtomicBool,
    events: broadcast::Sender<TransportEvent>,
}

impl LocalTransport {
    fn new(
        config: &TransportConfig,
        router: &Arc<RouterShared>,
        this: Weak<LocalTransport>,
    ) -> Self {
        let address = config
            .announced_ip
            .clone()
            .unwrap_or_else(|| config.listen_ip.clone());
        let port = router.allocate_port();

        let (udp_priority, tcp_priority) = if config.prefer_udp {
            (1_076_302_079_u32, 1_076_276_479_u32)
        } else {
            (1_076_302_078_u32, 1_076_302_079_u32)
        };

        let mut candidates = Vec::new();
        if config.enable_udp {
            candidates.push(json!({
                "foundation": "udpcandidate",
                "priority": udp_priority,
                "ip": address,
                "address": address,
                "protocol": "udp",
                "port": port,
                "type": "host"
            }));
        }
        if config.enable_tcp {
            candidates.push(json!({
                "foundation": "tcpcandidate",
                "priority": tcp_priority,
                "ip": address,
                "address": address,
                "protocol": "tcp",
                "port": port,
                "type": "host",
                "tcpType": "passive"
            }));
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let ufrag = Uuid::new_v4().simple().to_string();
        let ufrag = ufrag.get(..16).unwrap_or(&ufrag).to_string();

        Self {
            id: Uuid::new_v4().to_string(),
            ice_parameters: json!({
                "usernameFragment": ufrag,
                "password": Uuid::new_v4().simple().to_string(),
                "iceLite": true
            }),
            ice_candidates: Value::Array(candidates),
            dtls_parameters: json!({
                "role": "auto",
                "fingerprints": [{ "algorithm": "sha-256", "value": fingerprint() }]
            }),
            router: Arc::downgrade(router),
            this,
            state: Mutex::new(TransportState {
                dtls: DtlsState::New,
                producers: Vec::new(),
                consumers: Vec::new(),
            }),
            closed: AtomicBool::new(false),
            events,
        }
    }

    /// Number of open producers and consumers on this transport.
    #[must_use]
    pub fn object_counts(&self) -> (usize, usize) {
        let state = lock(&self.state);
        (state.producers.len(), state.consumers.len())
    }

    /// Current DTLS state.
    #[must_use]
    pub fn dtls_state(&self) -> DtlsState {
        lock(&self.state).dtls
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(EngineError::Closed("transport"))
        } else {
            Ok(())
        }
    }

    fn forget_producer(&self, producer_id: &str) {
        lock(&self.state).producers.retain(|p| p.id != producer_id);
    }

    fn forget_consumer(&self, consumer_id: &str) {
        lock(&self.state).consumers.retain(|c| c.id != consumer_id);
    }

    fn close_internal(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let (producers, consumers) = {
            let mut state = lock(&self.state);
            state.dtls = DtlsState::Closed;
            (
                std::mem::take(&mut state.producers),
                std::mem::take(&mut state.consumers),
            )
        };
        for consumer in consumers {
            consumer.close_with(ConsumerEvent::Closed);
        }
        for producer in producers {
            producer.close_internal();
        }
        if let Some(router) = self.router.upgrade() {
            lock(&router.transports).retain(|t| t.id != self.id);
        }
        let _ = self
            .events
            .send(TransportEvent::DtlsStateChanged(DtlsState::Closed));
        let _ = self.events.send(TransportEvent::Closed);
    }
}

#[async_trait]
impl TransportHandle for LocalTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn ice_parameters(&self) -> Value {
        self.ice_parameters.clone()
    }

    fn ice_candidates(&self) -> Value {
        self.ice_candidates.clone()
    }

    fn dtls_parameters(&self) -> Value {
        self.dtls_parameters.clone()
    }

    async fn connect(&self, dtls_parameters: Value) -> Result<(), EngineError> {
        self.ensure_open()?;
        if !dtls_parameters.is_object() {
            return Err(EngineError::Rejected(
                "dtlsParameters must be an object".to_string(),
            ));
        }
        {
            let mut state = lock(&self.state);
            if state.dtls != DtlsState::New {
                return Err(EngineError::Rejected("connect() already called".to_string()));
            }
            state.dtls = DtlsState::Connected;
        }
        let _ = self
            .events
            .send(TransportEvent::DtlsStateChanged(DtlsState::Connecting));
        let _ = self
            .events
            .send(TransportEvent::DtlsStateChanged(DtlsState::Connected));
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: Value,
        _app_data: Value,
    ) -> Result<Arc<dyn ProducerHandle>, EngineError> {
        self.ensure_open()?;
        if !rtp_parameters.is_object() {
            return Err(EngineError::Rejected(
                "rtpParameters must be an object".to_string(),
            ));
        }
        let router = self
            .router
            .upgrade()
            .ok_or(EngineError::Closed("router"))?;

        let producer = Arc::new(LocalProducer::new(
            kind,
            rtp_parameters,
            &router,
            self.this.clone(),
        ));
        lock(&router.producers).insert(producer.id.clone(), Arc::clone(&producer));
        lock(&self.state).producers.push(Arc::clone(&producer));
        Ok(producer)
    }

    async fn consume(
        &self,
        producer_id: &str,
        _rtp_capabilities: Value,
        paused: bool,
    ) -> Result<Arc<dyn ConsumerHandle>, EngineError> {
        self.ensure_open()?;
        let router = self
            .router
            .upgrade()
            .ok_or(EngineError::Closed("router"))?;
        let producer = lock(&router.producers)
            .get(producer_id)
            .cloned()
            .ok_or_else(|| {
                EngineError::Rejected(format!("Producer with id \"{producer_id}\" not found"))
            })?;

        let consumer = Arc::new(LocalConsumer::new(&producer, self.this.clone(), paused));
        lock(&producer.consumers).push(Arc::clone(&consumer));
        lock(&self.state).consumers.push(Arc::clone(&consumer));
        Ok(consumer)
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.close_internal();
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

/// Producer created by [`LocalTransport`].
#[derive(Debug)]
pub struct LocalProducer {
    id: String,
    kind: MediaKind,
    rtp_parameters: Value,
    router: Weak<RouterShared>,
    transport: Weak<LocalTransport>,
    consumers: Mutex<Vec<Arc<LocalConsumer>>>,
    closed: AtomicBool,
    events: broadcast::Sender<ProducerEvent>,
}

impl LocalProducer {
    fn new(
        kind: MediaKind,
        rtp_parameters: Value,
        router: &Arc<RouterShared>,
        transport: Weak<LocalTransport>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            rtp_parameters,
            router: Arc::downgrade(router),
            transport,
            consumers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            events,
        }
    }

    fn close_internal(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(router) = self.router.upgrade() {
            lock(&router.producers).remove(&self.id);
        }
        if let Some(transport) = self.transport.upgrade() {
            transport.forget_producer(&self.id);
        }
        let consumers: Vec<_> = lock(&self.consumers).drain(..).collect();
        for consumer in consumers {
            consumer.close_with(ConsumerEvent::ProducerClosed);
        }
        let _ = self.events.send(ProducerEvent::Closed);
    }

    fn forget_consumer(&self, consumer_id: &str) {
        lock(&self.consumers).retain(|c| c.id != consumer_id);
    }

    /// Number of open consumers of this producer.
    #[must_use]
    pub fn consumer_count(&self) -> usize {
        lock(&self.consumers).len()
    }
}

#[async_trait]
impl ProducerHandle for LocalProducer {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.close_internal();
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ProducerEvent> {
        self.events.subscribe()
    }
}

/// Consumer created by [`LocalTransport`].
#[derive(Debug)]
pub struct LocalConsumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    rtp_parameters: Value,
    producer: Weak<LocalProducer>,
    transport: Weak<LocalTransport>,
    paused: AtomicBool,
    closed: AtomicBool,
    key_frame_requests: AtomicU64,
    events: broadcast::Sender<ConsumerEvent>,
}

impl LocalConsumer {
    fn new(producer: &Arc<LocalProducer>, transport: Weak<LocalTransport>, paused: bool) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            id: Uuid::new_v4().to_string(),
            producer_id: producer.id.clone(),
            kind: producer.kind,
            rtp_parameters: producer.rtp_parameters.clone(),
            producer: Arc::downgrade(producer),
            transport,
            paused: AtomicBool::new(paused),
            closed: AtomicBool::new(false),
            key_frame_requests: AtomicU64::new(0),
            events,
        }
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn key_frame_requests(&self) -> u64 {
        self.key_frame_requests.load(Ordering::Relaxed)
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(EngineError::Closed("consumer"))
        } else {
            Ok(())
        }
    }

    fn close_with(&self, event: ConsumerEvent) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(producer) = self.producer.upgrade() {
            producer.forget_consumer(&self.id);
        }
        if let Some(transport) = self.transport.upgrade() {
            transport.forget_consumer(&self.id);
        }
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl ConsumerHandle for LocalConsumer {
    fn id(&self) -> &str {
        &self.id
    }

    fn producer_id(&self) -> &str {
        &self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> Value {
        self.rtp_parameters.clone()
    }

    async fn resume(&self) -> Result<(), EngineError> {
        self.ensure_open()?;
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn request_key_frame(&self) -> Result<(), EngineError> {
        self.ensure_open()?;
        self.key_frame_requests.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.close_with(ConsumerEvent::Closed);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ConsumerEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn vp8_parameters() -> Value {
        json!({ "codecs": [{ "mimeType": "video/VP8", "payloadType": 101, "clockRate": 90000 }] })
    }

    async fn router() -> Arc<dyn RouterHandle> {
        LocalEngine::new().create_router().await.unwrap()
    }

    #[tokio::test]
    async fn test_transport_parameters_use_announced_ip() {
        let router = router().await;
        let config = TransportConfig {
            announced_ip: Some("203.0.113.7".to_string()),
            ..TransportConfig::default()
        };
        let transport = router.create_transport(&config).await.unwrap();

        let candidates = transport.ice_candidates();
        let candidates = candidates.as_array().unwrap();
        assert_eq!(candidates.len(), 2);
        assert!(candidates.iter().all(|c| c["address"] == "203.0.113.7"));
        assert_eq!(transport.dtls_parameters()["role"], "auto");
        assert!(transport.ice_parameters()["usernameFragment"].is_string());
    }

    #[tokio::test]
    async fn test_connect_twice_is_rejected() {
        let router = router().await;
        let transport = router
            .create_transport(&TransportConfig::default())
            .await
            .unwrap();

        transport.connect(json!({ "fingerprints": [] })).await.unwrap();
        let err = transport.connect(json!({})).await.unwrap_err();
        assert_eq!(err, EngineError::Rejected("connect() already called".to_string()));
    }

    #[tokio::test]
    async fn test_can_consume_matches_codecs() {
        let router = router().await;
        let transport = router
            .create_transport(&TransportConfig::default())
            .await
            .unwrap();
        let producer = transport
            .produce(MediaKind::Video, vp8_parameters(), json!({}))
            .await
            .unwrap();

        assert!(router.can_consume(producer.id(), &default_rtp_capabilities()));
        let audio_only = json!({ "codecs": [{ "kind": "audio", "mimeType": "audio/opus" }] });
        assert!(!router.can_consume(producer.id(), &audio_only));
        assert!(!router.can_consume("missing", &default_rtp_capabilities()));
    }

    #[tokio::test]
    async fn test_can_consume_falls_back_to_kind() {
        let router = router().await;
        let transport = router
            .create_transport(&TransportConfig::default())
            .await
            .unwrap();
        let producer = transport
            .produce(MediaKind::Audio, json!({}), json!({}))
            .await
            .unwrap();

        assert!(router.can_consume(producer.id(), &default_rtp_capabilities()));
        let video_only = json!({ "codecs": [{ "kind": "video", "mimeType": "video/VP8" }] });
        assert!(!router.can_consume(producer.id(), &video_only));
    }

    #[tokio::test]
    async fn test_producer_close_closes_consumers() {
        let router = router().await;
        let send = router
            .create_transport(&TransportConfig::default())
            .await
            .unwrap();
        let recv = router
            .create_transport(&TransportConfig::default())
            .await
            .unwrap();
        let producer = send
            .produce(MediaKind::Video, vp8_parameters(), json!({}))
            .await
            .unwrap();
        let consumer = recv
            .consume(producer.id(), default_rtp_capabilities(), true)
            .await
            .unwrap();
        let mut consumer_events = consumer.subscribe();
        let mut producer_events = producer.subscribe();

        producer.close().await.unwrap();

        assert_eq!(producer_events.recv().await.unwrap(), ProducerEvent::Closed);
        assert_eq!(
            consumer_events.recv().await.unwrap(),
            ConsumerEvent::ProducerClosed
        );
        assert!(consumer.resume().await.is_err());
    }

    #[tokio::test]
    async fn test_router_close_cascades_to_transports() {
        let engine = LocalEngine::new();
        let router = engine.create_router().await.unwrap();
        let transport = router
            .create_transport(&TransportConfig::default())
            .await
            .unwrap();
        let producer = transport
            .produce(MediaKind::Audio, json!({}), json!({}))
            .await
            .unwrap();
        let mut transport_events = transport.subscribe();
        let mut producer_events = producer.subscribe();

        router.close().await.unwrap();

        assert!(router.is_closed());
        assert_eq!(
            transport_events.recv().await.unwrap(),
            TransportEvent::DtlsStateChanged(DtlsState::Closed)
        );
        assert_eq!(transport_events.recv().await.unwrap(), TransportEvent::Closed);
        assert_eq!(producer_events.recv().await.unwrap(), ProducerEvent::Closed);
        assert!(router
            .create_transport(&TransportConfig::default())
            .await
            .is_err());
        assert_eq!(engine.routers_created(), 1);
    }

    #[tokio::test]
    async fn test_consume_unknown_producer_is_rejected() {
        let router = router().await;
        let transport = router
            .create_transport(&TransportConfig::default())
            .await
            .unwrap();

        let err = transport
            .consume("nope", default_rtp_capabilities(), true)
            .await
            .err()
            .expect("consume should fail");
        assert_eq!(
            err,
            EngineError::Rejected("Producer with id \"nope\" not found".to_string())
        );
    }

    #[tokio::test]
    async fn test_local_object_state_tracking() {
        let router = LocalRouter::new(default_rtp_capabilities(), Arc::new(AtomicU16::new(0)));
        let send = router
            .create_transport(&TransportConfig::default())
            .await
            .unwrap();
        let recv = router
            .create_transport(&TransportConfig::default())
            .await
            .unwrap();
        assert_eq!(router.transport_count(), 2);

        let local_send = lock(&router.shared.transports).first().cloned().unwrap();
        assert_eq!(local_send.dtls_state(), DtlsState::New);
        send.connect(json!({ "fingerprints": [] })).await.unwrap();
        assert_eq!(local_send.dtls_state(), DtlsState::Connected);

        let producer = send
            .produce(MediaKind::Video, vp8_parameters(), json!({}))
            .await
            .unwrap();
        assert_eq!(router.producer_count(), 1);

        let consumer = recv
            .consume(producer.id(), default_rtp_capabilities(), true)
            .await
            .unwrap();
        let local_recv = lock(&router.shared.transports).get(1).cloned().unwrap();
        let local_consumer = lock(&local_recv.state).consumers.first().cloned().unwrap();
        assert!(local_consumer.is_paused());

        consumer.request_key_frame().await.unwrap();
        consumer.resume().await.unwrap();
        assert!(!local_consumer.is_paused());
        assert_eq!(local_consumer.key_frame_requests(), 1);

        send.close().await.unwrap();
        assert_eq!(local_send.dtls_state(), DtlsState::Closed);
        assert_eq!(router.producer_count(), 0);
        assert_eq!(router.transport_count(), 1);
    }

    #[tokio::test]
    async fn test_closed_objects_are_released() {
        let router = LocalRouter::new(default_rtp_capabilities(), Arc::new(AtomicU16::new(0)));
        let send = router
            .create_transport(&TransportConfig::default())
            .await
            .unwrap();
        let recv = router
            .create_transport(&TransportConfig::default())
            .await
            .unwrap();
        let local_send = lock(&router.shared.transports).first().cloned().unwrap();
        let local_recv = lock(&router.shared.transports).get(1).cloned().unwrap();

        let producer = send
            .produce(MediaKind::Video, vp8_parameters(), json!({}))
            .await
            .unwrap();
        let local_producer = lock(&router.shared.producers)
            .get(producer.id())
            .cloned()
            .unwrap();

        for _ in 0..50 {
            let consumer = recv
                .consume(producer.id(), default_rtp_capabilities(), true)
                .await
                .unwrap();
            consumer.close().await.unwrap();
        }
        assert_eq!(local_producer.consumer_count(), 0);
        assert_eq!(local_recv.object_counts(), (0, 0));

        for _ in 0..20 {
            let extra = send
                .produce(MediaKind::Audio, json!({}), json!({}))
                .await
                .unwrap();
            extra.close().await.unwrap();
        }
        assert_eq!(local_send.object_counts(), (1, 0));
        assert_eq!(router.producer_count(), 1);

        // Producer close releases its consumers from the receiving transport
        recv.consume(producer.id(), default_rtp_capabilities(), true)
            .await
            .unwrap();
        assert_eq!(local_recv.object_counts(), (0, 1));
        producer.close().await.unwrap();
        assert_eq!(local_recv.object_counts(), (0, 0));
        assert_eq!(local_send.object_counts(), (0, 0));
    }
}
