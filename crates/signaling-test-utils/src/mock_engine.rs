//! Mock media engine for signaling tests.
//!
//! Wraps the in-process [`LocalEngine`] so media objects behave realistically,
//! and layers failure injection and close bookkeeping on top:
//! - Reject every `consume` compatibility check
//! - Fail router creation
//! - Fail consumer, producer or transport `close()`
//! - Close a transport engine-side, as if DTLS went away
//!
//! # Example
//!
//! ```rust,ignore
//! use signaling_test_utils::MockMediaEngine;
//!
//! let engine = MockMediaEngine::builder()
//!     .fail_consumer_close()
//!     .fail_producer_close()
//!     .build();
//!
//! let server = TestServer::start(Arc::new(engine.clone())).await;
//! // ...
//! assert_eq!(engine.close_attempts(MediaObject::Transport), 2);
//! ```

use async_trait::async_trait;
use serde_json::Value;
use signaling_service::engine::{
    ConsumerEvent, ConsumerHandle, EngineError, LocalEngine, MediaEngine, MediaKind,
    ProducerEvent, ProducerHandle, RouterHandle, TransportConfig, TransportEvent,
    TransportHandle,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Kind of media object, for close bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaObject {
    Router,
    Transport,
    Producer,
    Consumer,
}

#[derive(Default)]
struct MockState {
    reject_consume: AtomicBool,
    fail_router_creation: AtomicBool,
    fail_transport_close: AtomicBool,
    fail_producer_close: AtomicBool,
    fail_consumer_close: AtomicBool,
    close_attempts: Mutex<Vec<(MediaObject, String)>>,
    transports: Mutex<HashMap<String, Arc<dyn TransportHandle>>>,
    /// Consumer id -> paused.
    consumers: Mutex<HashMap<String, bool>>,
    /// Consumer id -> key frame requests.
    key_frames: Mutex<HashMap<String, u64>>,
}

impl std::fmt::Debug for MockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockState")
            .field("reject_consume", &self.reject_consume)
            .field("fail_router_creation", &self.fail_router_creation)
            .field("close_attempts", &self.close_attempts)
            .finish_non_exhaustive()
    }
}

impl MockState {
    fn record_close(&self, object: MediaObject, id: &str) {
        self.close_attempts
            .lock()
            .unwrap()
            .push((object, id.to_string()));
    }

    fn injected(object: MediaObject) -> EngineError {
        EngineError::Rejected(format!("injected {object:?} close failure"))
    }
}

/// Failure-injecting media engine. Clones share state.
#[derive(Debug, Clone)]
pub struct MockMediaEngine {
    inner: Arc<LocalEngine>,
    state: Arc<MockState>,
}

impl Default for MockMediaEngine {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl MockMediaEngine {
    #[must_use]
    pub fn builder() -> MockMediaEngineBuilder {
        MockMediaEngineBuilder::default()
    }

    /// Number of `close()` calls made on objects of `object` kind.
    #[must_use]
    pub fn close_attempts(&self, object: MediaObject) -> usize {
        self.state
            .close_attempts
            .lock()
            .unwrap()
            .iter()
            .filter(|(kind, _)| *kind == object)
            .count()
    }

    /// Whether `close()` was called on the object with `id`.
    #[must_use]
    pub fn was_closed(&self, id: &str) -> bool {
        self.state
            .close_attempts
            .lock()
            .unwrap()
            .iter()
            .any(|(_, closed)| closed == id)
    }

    /// Number of routers created so far.
    #[must_use]
    pub fn routers_created(&self) -> u64 {
        self.inner.routers_created()
    }

    /// Whether consumer `consumer_id` is paused, `None` if never created.
    #[must_use]
    pub fn is_consumer_paused(&self, consumer_id: &str) -> Option<bool> {
        self.state.consumers.lock().unwrap().get(consumer_id).copied()
    }

    /// Key frames requested on consumer `consumer_id`.
    #[must_use]
    pub fn key_frame_requests(&self, consumer_id: &str) -> u64 {
        self.state
            .key_frames
            .lock()
            .unwrap()
            .get(consumer_id)
            .copied()
            .unwrap_or(0)
    }

    /// Ids of every transport created so far.
    #[must_use]
    pub fn transport_ids(&self) -> Vec<String> {
        self.state.transports.lock().unwrap().keys().cloned().collect()
    }

    /// Close a transport from the engine side (DTLS closed).
    ///
    /// Returns `false` if no transport has this id.
    pub async fn close_transport_remotely(&self, transport_id: &str) -> bool {
        let transport = self.state.transports.lock().unwrap().get(transport_id).cloned();
        match transport {
            Some(transport) => {
                transport.close().await.unwrap();
                true
            }
            None => false,
        }
    }

    pub fn set_reject_consume(&self, reject: bool) {
        self.state.reject_consume.store(reject, Ordering::SeqCst);
    }

    pub fn set_fail_router_creation(&self, fail: bool) {
        self.state.fail_router_creation.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl MediaEngine for MockMediaEngine {
    async fn create_router(&self) -> Result<Arc<dyn RouterHandle>, EngineError> {
        if self.state.fail_router_creation.load(Ordering::SeqCst) {
            return Err(EngineError::Rejected("no media workers available".to_string()));
        }
        let inner = self.inner.create_router().await?;
        Ok(Arc::new(MockRouter {
            inner,
            state: Arc::clone(&self.state),
        }))
    }
}

/// Builder for [`MockMediaEngine`].
#[derive(Debug, Default)]
pub struct MockMediaEngineBuilder {
    reject_consume: bool,
    fail_router_creation: bool,
    fail_transport_close: bool,
    fail_producer_close: bool,
    fail_consumer_close: bool,
}

impl MockMediaEngineBuilder {
    /// `can_consume` always answers `false`.
    #[must_use]
    pub fn reject_consume(mut self) -> Self {
        self.reject_consume = true;
        self
    }

    #[must_use]
    pub fn fail_router_creation(mut self) -> Self {
        self.fail_router_creation = true;
        self
    }

    /// Transport `close()` returns an error and leaves the transport open.
    #[must_use]
    pub fn fail_transport_close(mut self) -> Self {
        self.fail_transport_close = true;
        self
    }

    /// Producer `close()` returns an error and leaves the producer open.
    #[must_use]
    pub fn fail_producer_close(mut self) -> Self {
        self.fail_producer_close = true;
        self
    }

    /// Consumer `close()` returns an error and leaves the consumer open.
    #[must_use]
    pub fn fail_consumer_close(mut self) -> Self {
        self.fail_consumer_close = true;
        self
    }

    #[must_use]
    pub fn build(self) -> MockMediaEngine {
        let state = MockState::default();
        state.reject_consume.store(self.reject_consume, Ordering::SeqCst);
        state
            .fail_router_creation
            .store(self.fail_router_creation, Ordering::SeqCst);
        state
            .fail_transport_close
            .store(self.fail_transport_close, Ordering::SeqCst);
        state
            .fail_producer_close
            .store(self.fail_producer_close, Ordering::SeqCst);
        state
            .fail_consumer_close
            .store(self.fail_consumer_close, Ordering::SeqCst);

        MockMediaEngine {
            inner: Arc::new(LocalEngine::new()),
            state: Arc::new(state),
        }
    }
}

struct MockRouter {
    inner: Arc<dyn RouterHandle>,
    state: Arc<MockState>,
}

#[async_trait]
impl RouterHandle for MockRouter {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn rtp_capabilities(&self) -> Value {
        self.inner.rtp_capabilities()
    }

    fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> bool {
        !self.state.reject_consume.load(Ordering::SeqCst)
            && self.inner.can_consume(producer_id, rtp_capabilities)
    }

    async fn create_transport(
        &self,
        config: &TransportConfig,
    ) -> Result<Arc<dyn TransportHandle>, EngineError> {
        let inner = self.inner.create_transport(config).await?;
        self.state
            .transports
            .lock()
            .unwrap()
            .insert(inner.id().to_string(), Arc::clone(&inner));
        Ok(Arc::new(MockTransport {
            inner,
            state: Arc::clone(&self.state),
        }))
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.state.record_close(MediaObject::Router, self.inner.id());
        self.inner.close().await
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

struct MockTransport {
    inner: Arc<dyn TransportHandle>,
    state: Arc<MockState>,
}

#[async_trait]
impl TransportHandle for MockTransport {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn ice_parameters(&self) -> Value {
        self.inner.ice_parameters()
    }

    fn ice_candidates(&self) -> Value {
        self.inner.ice_candidates()
    }

    fn dtls_parameters(&self) -> Value {
        self.inner.dtls_parameters()
    }

    async fn connect(&self, dtls_parameters: Value) -> Result<(), EngineError> {
        self.inner.connect(dtls_parameters).await
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: Value,
        app_data: Value,
    ) -> Result<Arc<dyn ProducerHandle>, EngineError> {
        let inner = self.inner.produce(kind, rtp_parameters, app_data).await?;
        Ok(Arc::new(MockProducer {
            inner,
            state: Arc::clone(&self.state),
        }))
    }

    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: Value,
        paused: bool,
    ) -> Result<Arc<dyn ConsumerHandle>, EngineError> {
        let inner = self
            .inner
            .consume(producer_id, rtp_capabilities, paused)
            .await?;
        self.state
            .consumers
            .lock()
            .unwrap()
            .insert(inner.id().to_string(), paused);
        Ok(Arc::new(MockConsumer {
            inner,
            state: Arc::clone(&self.state),
        }))
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.state.record_close(MediaObject::Transport, self.inner.id());
        if self.state.fail_transport_close.load(Ordering::SeqCst) {
            return Err(MockState::injected(MediaObject::Transport));
        }
        self.inner.close().await
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.subscribe()
    }
}

struct MockProducer {
    inner: Arc<dyn ProducerHandle>,
    state: Arc<MockState>,
}

#[async_trait]
impl ProducerHandle for MockProducer {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn kind(&self) -> MediaKind {
        self.inner.kind()
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.state.record_close(MediaObject::Producer, self.inner.id());
        if self.state.fail_producer_close.load(Ordering::SeqCst) {
            return Err(MockState::injected(MediaObject::Producer));
        }
        self.inner.close().await
    }

    fn subscribe(&self) -> broadcast::Receiver<ProducerEvent> {
        self.inner.subscribe()
    }
}

struct MockConsumer {
    inner: Arc<dyn ConsumerHandle>,
    state: Arc<MockState>,
}

#[async_trait]
impl ConsumerHandle for MockConsumer {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn producer_id(&self) -> &str {
        self.inner.producer_id()
    }

    fn kind(&self) -> MediaKind {
        self.inner.kind()
    }

    fn rtp_parameters(&self) -> Value {
        self.inner.rtp_parameters()
    }

    async fn resume(&self) -> Result<(), EngineError> {
        self.inner.resume().await?;
        self.state
            .consumers
            .lock()
            .unwrap()
            .insert(self.inner.id().to_string(), false);
        Ok(())
    }

    async fn request_key_frame(&self) -> Result<(), EngineError> {
        self.inner.request_key_frame().await?;
        *self
            .state
            .key_frames
            .lock()
            .unwrap()
            .entry(self.inner.id().to_string())
            .or_default() += 1;
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.state.record_close(MediaObject::Consumer, self.inner.id());
        if self.state.fail_consumer_close.load(Ordering::SeqCst) {
            return Err(MockState::injected(MediaObject::Consumer));
        }
        self.inner.close().await
    }

    fn subscribe(&self) -> broadcast::Receiver<ConsumerEvent> {
        self.inner.subscribe()
    }
}
