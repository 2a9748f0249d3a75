//! Media engine adapter.
//!
//! The signaling core never touches ICE, DTLS or RTP itself. It orchestrates
//! an external media engine through the narrow set of traits in this module:
//!
//! ```text
//! MediaEngine
//! └── RouterHandle (one per room)
//!     └── TransportHandle (send or recv, one per createTransport)
//!         ├── ProducerHandle (send transports)
//!         └── ConsumerHandle (recv transports)
//! ```
//!
//! Lifecycle notifications are exposed as `tokio::sync::broadcast` receivers
//! via `subscribe()`. The room actor forwards them into its own mailbox and
//! turns them into resource removal and room broadcasts.
//!
//! Codec-level parameters (`rtpCapabilities`, `rtpParameters`, ICE and DTLS
//! parameters) are opaque JSON to the core and passed through unchanged.

pub mod local;

pub use local::LocalEngine;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// Errors reported by the media engine.
///
/// The `Display` output is forwarded verbatim to clients.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// The engine refused the operation (bad parameters, incompatible caps).
    #[error("{0}")]
    Rejected(String),

    /// The target object has already been closed.
    #[error("{0} closed")]
    Closed(&'static str),
}

/// Media kind of a producer or consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a WebRTC transport from the client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    /// Client sends media; hosts producers.
    Send,
    /// Client receives media; hosts consumers.
    Recv,
}

impl TransportDirection {
    /// Parse a wire value. Only `"send"` and `"recv"` are accepted.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "send" => Some(TransportDirection::Send),
            "recv" => Some(TransportDirection::Recv),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            TransportDirection::Send => "send",
            TransportDirection::Recv => "recv",
        }
    }
}

/// DTLS state reported by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtlsState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

/// Notifications emitted by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    DtlsStateChanged(DtlsState),
    /// The transport was closed (by the engine or through its router).
    Closed,
}

impl TransportEvent {
    /// Whether this event ends the transport's life.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransportEvent::Closed | TransportEvent::DtlsStateChanged(DtlsState::Closed)
        )
    }
}

/// Notifications emitted by a producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerEvent {
    Closed,
}

/// Notifications emitted by a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerEvent {
    /// The consumed producer went away.
    ProducerClosed,
    /// The consumer itself was closed (e.g. its transport closed).
    Closed,
}

/// Listen settings handed to the engine for every new transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub listen_ip: String,
    pub announced_ip: Option<String>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen_ip: "0.0.0.0".to_string(),
            announced_ip: None,
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
        }
    }
}

/// Entry point to the media engine.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Create a fresh routing context for a room.
    async fn create_router(&self) -> Result<Arc<dyn RouterHandle>, EngineError>;
}

/// Per-room routing context.
#[async_trait]
pub trait RouterHandle: Send + Sync {
    fn id(&self) -> &str;

    /// Codec capabilities clients load into their device before producing.
    fn rtp_capabilities(&self) -> Value;

    /// Whether a consumer with `rtp_capabilities` can receive `producer_id`.
    fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> bool;

    async fn create_transport(
        &self,
        config: &TransportConfig,
    ) -> Result<Arc<dyn TransportHandle>, EngineError>;

    /// Close the router and everything created through it.
    async fn close(&self) -> Result<(), EngineError>;

    fn is_closed(&self) -> bool;
}

/// A negotiated network path between one client and the engine.
#[async_trait]
pub trait TransportHandle: Send + Sync {
    fn id(&self) -> &str;
    fn ice_parameters(&self) -> Value;
    fn ice_candidates(&self) -> Value;
    fn dtls_parameters(&self) -> Value;

    /// Complete the DTLS handshake with the client's parameters.
    async fn connect(&self, dtls_parameters: Value) -> Result<(), EngineError>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: Value,
        app_data: Value,
    ) -> Result<Arc<dyn ProducerHandle>, EngineError>;

    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: Value,
        paused: bool,
    ) -> Result<Arc<dyn ConsumerHandle>, EngineError>;

    async fn close(&self) -> Result<(), EngineError>;

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}

/// Outbound media stream of one client.
#[async_trait]
pub trait ProducerHandle: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    async fn close(&self) -> Result<(), EngineError>;
    fn subscribe(&self) -> broadcast::Receiver<ProducerEvent>;
}

/// Inbound subscription of one client to another client's producer.
#[async_trait]
pub trait ConsumerHandle: Send + Sync {
    fn id(&self) -> &str;
    fn producer_id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    fn rtp_parameters(&self) -> Value;
    async fn resume(&self) -> Result<(), EngineError>;
    async fn request_key_frame(&self) -> Result<(), EngineError>;
    async fn close(&self) -> Result<(), EngineError>;
    fn subscribe(&self) -> broadcast::Receiver<ConsumerEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_direction_parse() {
        assert_eq!(
            TransportDirection::parse("send"),
            Some(TransportDirection::Send)
        );
        assert_eq!(
            TransportDirection::parse("recv"),
            Some(TransportDirection::Recv)
        );
        assert_eq!(TransportDirection::parse("both"), None);
        assert_eq!(TransportDirection::parse("SEND"), None);
    }

    #[test]
    fn test_media_kind_wire_format() {
        assert_eq!(
            serde_json::to_value(MediaKind::Video).ok(),
            Some(Value::from("video"))
        );
        let kind: Result<MediaKind, _> = serde_json::from_value(Value::from("audio"));
        assert!(matches!(kind, Ok(MediaKind::Audio)));
        let bad: Result<MediaKind, _> = serde_json::from_value(Value::from("data"));
        assert!(bad.is_err());
    }

    #[test]
    fn test_terminal_transport_events() {
        assert!(TransportEvent::Closed.is_terminal());
        assert!(TransportEvent::DtlsStateChanged(DtlsState::Closed).is_terminal());
        assert!(!TransportEvent::DtlsStateChanged(DtlsState::Connected).is_terminal());
        assert!(!TransportEvent::DtlsStateChanged(DtlsState::Failed).is_terminal());
    }

    #[test]
    fn test_engine_error_display() {
        assert_eq!(
            EngineError::Rejected("bad rtpParameters".to_string()).to_string(),
            "bad rtpParameters"
        );
        assert_eq!(
            EngineError::Closed("transport").to_string(),
            "transport closed"
        );
    }
}
