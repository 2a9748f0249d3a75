//! Room Signaling Service Library
//!
//! WebSocket control plane for a Selective Forwarding Unit. Clients join
//! rooms and negotiate WebRTC transports, producers and consumers; the media
//! itself is forwarded by an external engine driven through [`engine`].
//!
//! # Architecture
//!
//! ```text
//! websocket (axum /ws)
//! └── gateway::Session (one per connection)
//!     ├── RoomRegistryActor (singleton): room id -> RoomActor
//!     └── RoomActor (one per room): router, peers, media objects
//!         └── dispatch: non-blocking fan-out to per-connection queues
//! ```
//!
//! # Modules
//!
//! - [`actors`] - Registry and room actors
//! - [`config`] - Service configuration from environment
//! - [`dispatch`] - Room event fan-out
//! - [`engine`] - Media engine traits and the in-process engine
//! - [`errors`] - Error types with client-safe messages
//! - [`gateway`] - Per-connection protocol handling
//! - [`observability`] - Health probes and Prometheus metrics
//! - [`protocol`] - JSON wire format
//! - [`websocket`] - WebSocket transport

pub mod actors;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod errors;
pub mod gateway;
pub mod observability;
pub mod protocol;
pub mod websocket;
