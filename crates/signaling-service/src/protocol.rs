//! JSON signaling protocol.
//!
//! Wire shapes:
//!
//! | Direction | Frame |
//! |-----------|-------|
//! | client → server | `{ "action", "data", "requestId" }` |
//! | server → client (success) | `{ "action": "<action>:response", "requestId", "data" }` |
//! | server → client (failure) | `{ "action": "<action>:error", "requestId", "error" }` |
//! | server → client (event) | `{ "action": "peerCount" \| "newProducer" \| "producerClosed" \| "peerLeft", "data" }` |
//!
//! Requests are decoded into [`Request`] (one variant per action) and every
//! success payload is a [`Response`] variant, so each action's reply shape is
//! statically known.

use crate::engine::{MediaKind, TransportDirection};
use crate::errors::SignalingError;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Action names accepted from clients.
pub mod actions {
    pub const JOIN: &str = "join";
    pub const ROOM_SYNC: &str = "room:sync";
    pub const CREATE_TRANSPORT: &str = "createTransport";
    pub const CONNECT_TRANSPORT: &str = "connectTransport";
    pub const PRODUCE: &str = "produce";
    pub const CONSUME: &str = "consume";
    pub const RESUME_CONSUMER: &str = "resumeConsumer";
    pub const CLOSE_PRODUCER: &str = "closeProducer";
    pub const LEAVE: &str = "leave";

    /// Every known action, in protocol order.
    pub const ALL: [&str; 9] = [
        JOIN,
        ROOM_SYNC,
        CREATE_TRANSPORT,
        CONNECT_TRANSPORT,
        PRODUCE,
        CONSUME,
        RESUME_CONSUMER,
        CLOSE_PRODUCER,
        LEAVE,
    ];

    /// Map an arbitrary client-supplied action onto a bounded metrics label.
    #[must_use]
    pub fn metric_label(action: &str) -> &'static str {
        ALL.iter().copied().find(|a| *a == action).unwrap_or("unknown")
    }
}

/// Action name used when a frame is too broken to carry one.
pub const UNKNOWN_ACTION: &str = "unknown";

/// A decoded request frame before its `data` is interpreted.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub action: String,
    pub request_id: Value,
    pub data: Value,
}

/// A frame that could not be decoded, with whatever routing info survived.
#[derive(Debug)]
pub struct EnvelopeError {
    pub action: String,
    pub request_id: Value,
    pub error: SignalingError,
}

impl Envelope {
    /// Decode a text frame.
    ///
    /// `requestId` is echoed back as sent. A missing or null `data` is treated
    /// as an empty object.
    pub fn parse(text: &str) -> Result<Self, EnvelopeError> {
        let value: Value = serde_json::from_str(text).map_err(|e| EnvelopeError {
            action: UNKNOWN_ACTION.to_string(),
            request_id: Value::Null,
            error: SignalingError::Validation(format!("malformed JSON frame: {e}")),
        })?;

        let Value::Object(mut frame) = value else {
            return Err(EnvelopeError {
                action: UNKNOWN_ACTION.to_string(),
                request_id: Value::Null,
                error: SignalingError::Validation("frame must be a JSON object".to_string()),
            });
        };

        let request_id = frame.remove("requestId").unwrap_or(Value::Null);
        let action = match frame.remove("action") {
            Some(Value::String(action)) if !action.is_empty() => action,
            _ => {
                return Err(EnvelopeError {
                    action: UNKNOWN_ACTION.to_string(),
                    request_id,
                    error: SignalingError::Validation("action is required".to_string()),
                })
            }
        };
        let data = match frame.remove("data") {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(data) => data,
        };

        Ok(Envelope {
            action,
            request_id,
            data,
        })
    }
}

/// Client request, one variant per action.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Join(JoinRequest),
    Leave,
    /// Any action that operates on an already-joined peer.
    Peer(PeerRequest),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub room_id: String,
    #[serde(default)]
    pub peer_id: Option<String>,
}

/// Requests routed to the room actor that owns the caller's peer.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerRequest {
    Sync,
    CreateTransport {
        /// Raw wire value; validated by the room so a bad value is a protocol
        /// state error rather than a decode error.
        direction: String,
    },
    ConnectTransport {
        transport_id: String,
        dtls_parameters: Value,
    },
    Produce {
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: Value,
        app_data: Value,
    },
    Consume {
        transport_id: String,
        producer_id: String,
        rtp_capabilities: Value,
    },
    ResumeConsumer {
        consumer_id: String,
    },
    CloseProducer {
        producer_id: String,
    },
}

impl PeerRequest {
    #[must_use]
    pub fn action(&self) -> &'static str {
        match self {
            PeerRequest::Sync => actions::ROOM_SYNC,
            PeerRequest::CreateTransport { .. } => actions::CREATE_TRANSPORT,
            PeerRequest::ConnectTransport { .. } => actions::CONNECT_TRANSPORT,
            PeerRequest::Produce { .. } => actions::PRODUCE,
            PeerRequest::Consume { .. } => actions::CONSUME,
            PeerRequest::ResumeConsumer { .. } => actions::RESUME_CONSUMER,
            PeerRequest::CloseProducer { .. } => actions::CLOSE_PRODUCER,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTransportData {
    direction: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectTransportData {
    transport_id: String,
    dtls_parameters: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProduceData {
    transport_id: String,
    kind: MediaKind,
    rtp_parameters: Value,
    #[serde(default)]
    app_data: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConsumeData {
    transport_id: String,
    producer_id: String,
    rtp_capabilities: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResumeConsumerData {
    consumer_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CloseProducerData {
    producer_id: String,
}

fn decode<T: DeserializeOwned>(action: &str, data: Value) -> Result<T, SignalingError> {
    serde_json::from_value(data)
        .map_err(|e| SignalingError::Validation(format!("invalid {action} request: {e}")))
}

fn require_non_empty(field: &str, value: &str) -> Result<(), SignalingError> {
    if value.trim().is_empty() {
        Err(SignalingError::Validation(format!("{field} is required")))
    } else {
        Ok(())
    }
}

impl Request {
    /// Interpret `data` for `action`.
    pub fn parse(action: &str, data: Value) -> Result<Self, SignalingError> {
        let request = match action {
            actions::JOIN => {
                let mut join: JoinRequest = decode(action, data)?;
                require_non_empty("roomId", &join.room_id)?;
                // An empty peerId means "assign one for me"
                join.peer_id = join.peer_id.filter(|id| !id.trim().is_empty());
                Request::Join(join)
            }
            actions::LEAVE => Request::Leave,
            actions::ROOM_SYNC => Request::Peer(PeerRequest::Sync),
            actions::CREATE_TRANSPORT => {
                let data: CreateTransportData = decode(action, data)?;
                Request::Peer(PeerRequest::CreateTransport {
                    direction: data.direction,
                })
            }
            actions::CONNECT_TRANSPORT => {
                let data: ConnectTransportData = decode(action, data)?;
                require_non_empty("transportId", &data.transport_id)?;
                Request::Peer(PeerRequest::ConnectTransport {
                    transport_id: data.transport_id,
                    dtls_parameters: data.dtls_parameters,
                })
            }
            actions::PRODUCE => {
                let data: ProduceData = decode(action, data)?;
                require_non_empty("transportId", &data.transport_id)?;
                Request::Peer(PeerRequest::Produce {
                    transport_id: data.transport_id,
                    kind: data.kind,
                    rtp_parameters: data.rtp_parameters,
                    app_data: match data.app_data {
                        None | Some(Value::Null) => Value::Object(Map::new()),
                        Some(app_data) => app_data,
                    },
                })
            }
            actions::CONSUME => {
                let data: ConsumeData = decode(action, data)?;
                require_non_empty("transportId", &data.transport_id)?;
                require_non_empty("producerId", &data.producer_id)?;
                Request::Peer(PeerRequest::Consume {
                    transport_id: data.transport_id,
                    producer_id: data.producer_id,
                    rtp_capabilities: data.rtp_capabilities,
                })
            }
            actions::RESUME_CONSUMER => {
                let data: ResumeConsumerData = decode(action, data)?;
                Request::Peer(PeerRequest::ResumeConsumer {
                    consumer_id: data.consumer_id,
                })
            }
            actions::CLOSE_PRODUCER => {
                let data: CloseProducerData = decode(action, data)?;
                Request::Peer(PeerRequest::CloseProducer {
                    producer_id: data.producer_id,
                })
            }
            other => {
                return Err(SignalingError::Validation(format!(
                    "unknown action: {other}"
                )))
            }
        };
        Ok(request)
    }
}

/// A producer as advertised to other peers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerInfo {
    pub producer_id: String,
    pub peer_id: String,
    pub kind: MediaKind,
    pub app_data: Value,
}

/// Derived media flags of one peer (`room:sync`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerMediaState {
    pub peer_id: String,
    pub mic_on: bool,
    pub camera_on: bool,
    pub screen_on: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinResponse {
    pub room_id: String,
    pub peer_id: String,
    pub rtp_capabilities: Value,
    pub existing_producers: Vec<ProducerInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub room_id: String,
    pub peers: Vec<PeerMediaState>,
    pub existing_producers: Vec<ProducerInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportCreatedResponse {
    pub id: String,
    pub direction: TransportDirection,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportConnectedResponse {
    pub transport_id: String,
    pub connected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducedResponse {
    pub producer_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeResponse {
    pub consumer_id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
    pub app_data: Value,
    /// Owner of the consumed producer.
    pub peer_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerResumedResponse {
    pub consumer_id: String,
    pub resumed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerClosedResponse {
    pub producer_id: String,
    /// `false` when the producer was already gone.
    pub closed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeftResponse {
    pub left: bool,
}

/// Success payload, one variant per action.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Response {
    Join(JoinResponse),
    Sync(SyncResponse),
    CreateTransport(TransportCreatedResponse),
    ConnectTransport(TransportConnectedResponse),
    Produce(ProducedResponse),
    Consume(ConsumeResponse),
    ResumeConsumer(ConsumerResumedResponse),
    CloseProducer(ProducerClosedResponse),
    Leave(LeftResponse),
}

/// Unsolicited room events.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(
    tag = "action",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    PeerCount {
        count: usize,
    },
    NewProducer {
        peer_id: String,
        producer_id: String,
        kind: MediaKind,
        app_data: Value,
    },
    ProducerClosed {
        peer_id: String,
        producer_id: String,
        app_data: Value,
    },
    PeerLeft {
        peer_id: String,
    },
}

impl ServerEvent {
    /// Bounded label for metrics.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::PeerCount { .. } => "peerCount",
            ServerEvent::NewProducer { .. } => "newProducer",
            ServerEvent::ProducerClosed { .. } => "producerClosed",
            ServerEvent::PeerLeft { .. } => "peerLeft",
        }
    }
}

/// Encode a `<action>:error` frame.
#[must_use]
pub fn error_frame(action: &str, request_id: &Value, error: &SignalingError) -> String {
    json!({
        "action": format!("{action}:error"),
        "requestId": request_id,
        "error": error.client_message(),
    })
    .to_string()
}

/// Encode a `<action>:response` frame.
///
/// Falls back to an error frame if the payload cannot be serialized.
#[must_use]
pub fn response_frame(action: &str, request_id: &Value, response: &Response) -> String {
    match serde_json::to_value(response) {
        Ok(data) => json!({
            "action": format!("{action}:response"),
            "requestId": request_id,
            "data": data,
        })
        .to_string(),
        Err(e) => error_frame(
            action,
            request_id,
            &SignalingError::Internal(format!("response serialization failed: {e}")),
        ),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_parse_full_frame() {
        let envelope = Envelope::parse(
            r#"{"action":"join","requestId":"r-1","data":{"roomId":"r1"}}"#,
        )
        .unwrap();
        assert_eq!(envelope.action, "join");
        assert_eq!(envelope.request_id, json!("r-1"));
        assert_eq!(envelope.data, json!({ "roomId": "r1" }));
    }

    #[test]
    fn test_envelope_missing_data_defaults_to_empty_object() {
        let envelope = Envelope::parse(r#"{"action":"room:sync","requestId":"7"}"#).unwrap();
        assert_eq!(envelope.data, json!({}));
    }

    #[test]
    fn test_envelope_malformed_json() {
        let err = Envelope::parse("{not json").unwrap_err();
        assert_eq!(err.action, UNKNOWN_ACTION);
        assert_eq!(err.request_id, Value::Null);
        assert!(matches!(err.error, SignalingError::Validation(_)));
    }

    #[test]
    fn test_envelope_missing_action_keeps_request_id() {
        let err = Envelope::parse(r#"{"requestId":"r-9","data":{}}"#).unwrap_err();
        assert_eq!(err.action, UNKNOWN_ACTION);
        assert_eq!(err.request_id, json!("r-9"));
    }

    #[test]
    fn test_envelope_rejects_non_object() {
        let err = Envelope::parse("[1,2,3]").unwrap_err();
        assert!(matches!(err.error, SignalingError::Validation(_)));
    }

    #[test]
    fn test_parse_join_requires_room_id() {
        let err = Request::parse("join", json!({})).unwrap_err();
        assert!(matches!(err, SignalingError::Validation(_)));

        let err = Request::parse("join", json!({ "roomId": "  " })).unwrap_err();
        assert_eq!(err.client_message(), "roomId is required");
    }

    #[test]
    fn test_parse_join_empty_peer_id_is_absent() {
        let request = Request::parse("join", json!({ "roomId": "r1", "peerId": "" })).unwrap();
        assert_eq!(
            request,
            Request::Join(JoinRequest {
                room_id: "r1".to_string(),
                peer_id: None,
            })
        );
    }

    #[test]
    fn test_parse_produce_defaults_app_data() {
        let request = Request::parse(
            "produce",
            json!({ "transportId": "t1", "kind": "audio", "rtpParameters": {} }),
        )
        .unwrap();
        assert!(matches!(
            request,
            Request::Peer(PeerRequest::Produce { kind: MediaKind::Audio, ref app_data, .. })
                if *app_data == json!({})
        ));
    }

    #[test]
    fn test_parse_produce_rejects_unknown_kind() {
        let err = Request::parse(
            "produce",
            json!({ "transportId": "t1", "kind": "data", "rtpParameters": {} }),
        )
        .unwrap_err();
        assert!(matches!(err, SignalingError::Validation(_)));
    }

    #[test]
    fn test_parse_create_transport_keeps_raw_direction() {
        let request = Request::parse("createTransport", json!({ "direction": "sideways" })).unwrap();
        assert_eq!(
            request,
            Request::Peer(PeerRequest::CreateTransport {
                direction: "sideways".to_string()
            })
        );
    }

    #[test]
    fn test_parse_unknown_action() {
        let err = Request::parse("teleport", json!({})).unwrap_err();
        assert_eq!(err.client_message(), "unknown action: teleport");
    }

    #[test]
    fn test_server_event_wire_shape() {
        let event = ServerEvent::NewProducer {
            peer_id: "A".to_string(),
            producer_id: "P1".to_string(),
            kind: MediaKind::Video,
            app_data: json!({ "screen": true }),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "action": "newProducer",
                "data": {
                    "peerId": "A",
                    "producerId": "P1",
                    "kind": "video",
                    "appData": { "screen": true }
                }
            })
        );

        let count = serde_json::to_value(ServerEvent::PeerCount { count: 2 }).unwrap();
        assert_eq!(count, json!({ "action": "peerCount", "data": { "count": 2 } }));
    }

    #[test]
    fn test_response_frame_shape() {
        let frame = response_frame(
            "produce",
            &json!("r-3"),
            &Response::Produce(ProducedResponse {
                producer_id: "P1".to_string(),
            }),
        );
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(
            value,
            json!({
                "action": "produce:response",
                "requestId": "r-3",
                "data": { "producerId": "P1" }
            })
        );
    }

    #[test]
    fn test_error_frame_shape() {
        let frame = error_frame(
            "consume",
            &json!("r-4"),
            &SignalingError::NotFound("producer P9 not found".to_string()),
        );
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(
            value,
            json!({
                "action": "consume:error",
                "requestId": "r-4",
                "error": "producer P9 not found"
            })
        );
    }

    #[test]
    fn test_metric_label_is_bounded() {
        assert_eq!(actions::metric_label("produce"), "produce");
        assert_eq!(actions::metric_label("room:sync"), "room:sync");
        assert_eq!(actions::metric_label("anything-else"), "unknown");
    }
}
