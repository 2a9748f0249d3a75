//! Signaling service error types.
//!
//! Every request handler returns `Result<_, SignalingError>`. The gateway turns
//! an error into a `<action>:error` reply carrying [`SignalingError::client_message`];
//! the connection itself always survives. Internal details are logged
//! server-side but not exposed to clients.

use crate::engine::EngineError;
use thiserror::Error;

/// Signaling service error type.
#[derive(Debug, Error)]
pub enum SignalingError {
    /// Missing or malformed field, unknown action, unparsable frame.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown room, peer, transport, producer or consumer id.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Action not valid in the current session state (not joined, wrong
    /// transport direction, superseded session).
    #[error("Protocol state error: {0}")]
    ProtocolState(String),

    /// The media engine rejected an operation. The message is forwarded verbatim.
    #[error("{0}")]
    Engine(String),

    /// The room actor has already torn down. The gateway retries joins on this.
    #[error("Room is closed")]
    RoomClosed,

    /// Registry is draining (graceful shutdown).
    #[error("Service is draining")]
    Draining,

    /// Internal error with context.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<EngineError> for SignalingError {
    fn from(err: EngineError) -> Self {
        SignalingError::Engine(err.to_string())
    }
}

impl SignalingError {
    /// Returns a bounded label string for the error variant (for metrics).
    ///
    /// Uses enum variant names, not error message content.
    pub fn error_type_label(&self) -> &'static str {
        match self {
            SignalingError::Validation(_) => "validation",
            SignalingError::NotFound(_) => "not_found",
            SignalingError::ProtocolState(_) => "protocol_state",
            SignalingError::Engine(_) => "engine",
            SignalingError::RoomClosed => "room_closed",
            SignalingError::Draining => "draining",
            SignalingError::Internal(_) => "internal",
        }
    }

    /// Returns a client-safe error message (no internal details).
    pub fn client_message(&self) -> String {
        match self {
            SignalingError::Validation(msg)
            | SignalingError::NotFound(msg)
            | SignalingError::ProtocolState(msg)
            | SignalingError::Engine(msg) => msg.clone(),
            SignalingError::RoomClosed => "Room is closed, please join again".to_string(),
            SignalingError::Draining => "Server is shutting down, please reconnect".to_string(),
            SignalingError::Internal(_) => "An internal error occurred".to_string(),
        }
    }
}
