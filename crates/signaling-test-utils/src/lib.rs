//! # Signaling Test Utilities
//!
//! Shared test utilities for the room signaling service.
//!
//! ## Modules
//!
//! - `mock_engine` - Failure-injecting media engine built on `LocalEngine`
//! - `server_harness` - Spawns the real `/ws` router on a random port
//! - `ws_client` - JSON protocol client over tokio-tungstenite
//!
//! ## Usage
//!
//! ```rust,ignore
//! use signaling_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     // Engine whose consumers refuse to close
//!     let engine = MockMediaEngine::builder()
//!         .fail_consumer_close()
//!         .build();
//!
//!     let server = TestSignalingServer::spawn(engine).await;
//!     let mut alice = TestClient::connect(&server.ws_url()).await;
//!     let mut bob = TestClient::connect(&server.ws_url()).await;
//!
//!     alice.call("join", json!({ "roomId": "r1", "peerId": "alice" })).await;
//!     bob.call("join", json!({ "roomId": "r1", "peerId": "bob" })).await;
//!
//!     assert_eq!(alice.next_event("peerCount").await["count"], 2);
//! }
//! ```

pub mod mock_engine;
pub mod server_harness;
pub mod ws_client;

// Re-export commonly used items
pub use mock_engine::*;
pub use server_harness::*;
pub use ws_client::*;
