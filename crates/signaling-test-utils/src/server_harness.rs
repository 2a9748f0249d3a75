//! Test server harness for end-to-end signaling tests.
//!
//! Provides `TestSignalingServer` for spawning the real `/ws` router in tests.

use signaling_service::actors::{ActorMetrics, RoomRegistryHandle, RoomSettings};
use signaling_service::engine::MediaEngine;
use signaling_service::websocket::{signaling_router, ConnectionSettings, SignalingState};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::mock_engine::MockMediaEngine;

/// Test harness for spawning the signaling server in end-to-end tests.
///
/// # Example
/// ```rust,ignore
/// #[tokio::test]
/// async fn test_join_flow() {
///     let server = TestSignalingServer::spawn(MockMediaEngine::default()).await;
///     let mut alice = TestClient::connect(&server.ws_url()).await;
///
///     let joined = alice.call("join", json!({ "roomId": "r1" })).await;
///     assert!(joined["peerId"].is_string());
/// }
/// ```
pub struct TestSignalingServer {
    addr: SocketAddr,
    registry: RoomRegistryHandle,
    metrics: Arc<ActorMetrics>,
    engine: MockMediaEngine,
    _handle: JoinHandle<()>,
}

impl TestSignalingServer {
    /// Spawn a server with default connection settings.
    pub async fn spawn(engine: MockMediaEngine) -> Self {
        Self::spawn_with(engine, ConnectionSettings::default()).await
    }

    /// Spawn a server with custom connection settings (short heartbeats, tiny queues).
    ///
    /// The server will:
    /// - Bind to a random available port (127.0.0.1:0)
    /// - Start the HTTP server in the background
    pub async fn spawn_with(engine: MockMediaEngine, settings: ConnectionSettings) -> Self {
        let metrics = ActorMetrics::new();
        let shared: Arc<dyn MediaEngine> = Arc::new(engine.clone());
        let registry =
            RoomRegistryHandle::new(shared, RoomSettings::default(), Arc::clone(&metrics));

        let app = signaling_router(SignalingState {
            registry: registry.clone(),
            settings,
            metrics: Arc::clone(&metrics),
        });

        // Bind to random port
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind test server");
        let addr = listener
            .local_addr()
            .expect("Failed to get local address");

        let token = registry.child_token();
        let handle = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                token.cancelled().await;
            });
            if let Err(e) = server.await {
                eprintln!("Test server error: {e}");
            }
        });

        Self {
            addr,
            registry,
            metrics,
            engine,
            _handle: handle,
        }
    }

    /// WebSocket URL of the signaling endpoint.
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn registry(&self) -> &RoomRegistryHandle {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<ActorMetrics> {
        &self.metrics
    }

    pub fn engine(&self) -> &MockMediaEngine {
        &self.engine
    }

    /// Poll until `room_id` is gone from the registry.
    pub async fn wait_for_room_closed(&self, room_id: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.registry.get_room(room_id.to_string()).await.is_ok() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "room {room_id} still open after 5s"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll until the registry tracks exactly `expected` rooms.
    pub async fn wait_for_room_count(&self, expected: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let status = self.registry.get_status().await.expect("registry is running");
            if status.room_count == expected {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "expected {expected} rooms, have {}",
                status.room_count
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll until the number of live connections equals `expected`.
    pub async fn wait_for_connections(&self, expected: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.metrics.connection_count() != expected {
            assert!(
                tokio::time::Instant::now() < deadline,
                "expected {expected} connections, have {}",
                self.metrics.connection_count()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for TestSignalingServer {
    fn drop(&mut self) {
        self.registry.cancel();
    }
}
