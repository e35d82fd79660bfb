//! Wire protocol of the interactive signaling channel.
//!
//! Messages are JSON envelopes carrying either a notification or one half of
//! a request/response pair, in both directions:
//!
//! ```json
//! { "request": true, "id": 42, "method": "join", "data": { ... } }
//! { "response": true, "id": 42, "ok": true, "data": { ... } }
//! { "response": true, "id": 42, "ok": false, "errorCode": 404, "errorReason": "..." }
//! { "notification": true, "method": "newPeer", "data": { ... } }
//! ```
//!
//! Request and notification kinds are modeled as adjacently tagged enums so
//! every method is matched exhaustively; an unknown method or a malformed
//! payload surfaces as [`SignalingError::TypeError`].

use crate::error::SignalingError;
use crate::peer::PeerId;
use mediasoup::consumer::ConsumerType;
use mediasoup::prelude::*;
use mediasoup::sctp_parameters::NumSctpStreams;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum size of a single signaling message, both directions.
pub const MAX_MESSAGE_SIZE: usize = 960_000;

/// Direction of a transport relative to the client.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    /// Client → server (producing).
    Send,
    /// Server → client (consuming).
    Recv,
}

/// What a media producer captures.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaSource {
    Audio,
    Video,
    Screensharing,
}

/// Application-level channel of a data producer.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataChannel {
    Chat,
    Bot,
}

impl DataChannel {
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "chat" => Some(Self::Chat),
            "bot" => Some(Self::Bot),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Bot => "bot",
        }
    }
}

/// SCTP capabilities declared by a client.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SctpCapabilities {
    pub num_streams: NumSctpStreams,
}

/// App data attached to WebRTC transports.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportAppData {
    pub direction: TransportDirection,
}

/// App data sent by the client alongside `produce`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceAppData {
    pub source: MediaSource,
}

/// App data attached to producers and consumers inside the engine.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaAppData {
    pub peer_id: PeerId,
    pub source: MediaSource,
}

/// App data attached to data producers and data consumers. `peer_id` is
/// absent for bot-originated streams.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataAppData {
    pub peer_id: Option<PeerId>,
    pub channel: DataChannel,
}

/// Joined participant snapshot handed to a freshly joined peer.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub id: PeerId,
    pub display_name: String,
    pub device: Value,
}

/// Requests received from an interactive peer.
#[derive(Debug, Deserialize)]
#[serde(tag = "method", content = "data", rename_all = "camelCase")]
pub enum ClientRequest {
    GetRouterRtpCapabilities,
    #[serde(rename_all = "camelCase")]
    Join {
        display_name: String,
        #[serde(default)]
        device: Value,
        rtp_capabilities: Option<RtpCapabilities>,
        sctp_capabilities: Option<SctpCapabilities>,
    },
    #[serde(rename_all = "camelCase")]
    CreateWebRtcTransport {
        direction: TransportDirection,
        #[serde(default)]
        force_tcp: bool,
        sctp_capabilities: Option<SctpCapabilities>,
    },
    #[serde(rename_all = "camelCase")]
    ConnectWebRtcTransport {
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    },
    #[serde(rename_all = "camelCase")]
    RestartIce { transport_id: TransportId },
    #[serde(rename_all = "camelCase")]
    Produce {
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        app_data: ProduceAppData,
    },
    #[serde(rename_all = "camelCase")]
    ProduceData {
        transport_id: TransportId,
        label: String,
        #[serde(default)]
        protocol: String,
        sctp_stream_parameters: SctpStreamParameters,
    },
    #[serde(rename_all = "camelCase")]
    GetTransportStats { transport_id: TransportId },
    #[serde(rename_all = "camelCase")]
    GetProducerStats { producer_id: ProducerId },
    #[serde(rename_all = "camelCase")]
    GetConsumerStats { consumer_id: ConsumerId },
    #[serde(rename_all = "camelCase")]
    GetDataProducerStats { data_producer_id: DataProducerId },
    #[serde(rename_all = "camelCase")]
    GetDataConsumerStats { data_consumer_id: DataConsumerId },
    #[serde(rename_all = "camelCase")]
    ApplyNetworkThrottle {
        secret: Option<String>,
        uplink: Option<u32>,
        downlink: Option<u32>,
        rtt: Option<u32>,
        packet_loss: Option<u32>,
    },
    #[serde(rename_all = "camelCase")]
    StopNetworkThrottle { secret: Option<String> },
}

/// Fire-and-forget notifications received from an interactive peer.
#[derive(Debug, Deserialize)]
#[serde(tag = "method", content = "data", rename_all = "camelCase")]
pub enum ClientNotification {
    #[serde(rename_all = "camelCase")]
    CloseProducer { producer_id: ProducerId },
    #[serde(rename_all = "camelCase")]
    PauseProducer { producer_id: ProducerId },
    #[serde(rename_all = "camelCase")]
    ResumeProducer { producer_id: ProducerId },
    #[serde(rename_all = "camelCase")]
    PauseConsumer { consumer_id: ConsumerId },
    #[serde(rename_all = "camelCase")]
    ResumeConsumer { consumer_id: ConsumerId },
    #[serde(rename_all = "camelCase")]
    SetConsumerPreferredLayers {
        consumer_id: ConsumerId,
        spatial_layer: u8,
        temporal_layer: Option<u8>,
    },
    #[serde(rename_all = "camelCase")]
    SetConsumerPriority {
        consumer_id: ConsumerId,
        priority: u8,
    },
    #[serde(rename_all = "camelCase")]
    RequestConsumerKeyFrame { consumer_id: ConsumerId },
    #[serde(rename_all = "camelCase")]
    ChangeDisplayName { display_name: String },
}

/// Notifications sent to an interactive peer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "method", content = "data", rename_all = "camelCase")]
pub enum ServerNotification {
    #[serde(rename_all = "camelCase")]
    MediasoupVersion { version: String },
    #[serde(rename_all = "camelCase")]
    NewPeer {
        id: PeerId,
        display_name: String,
        device: Value,
    },
    #[serde(rename_all = "camelCase")]
    PeerDisplayNameChanged {
        peer_id: PeerId,
        display_name: String,
        old_display_name: String,
    },
    #[serde(rename_all = "camelCase")]
    PeerClosed { peer_id: PeerId },
    #[serde(rename_all = "camelCase")]
    ProducerScore {
        producer_id: ProducerId,
        score: Value,
    },
    #[serde(rename_all = "camelCase")]
    ConsumerPaused { consumer_id: ConsumerId },
    #[serde(rename_all = "camelCase")]
    ConsumerResumed { consumer_id: ConsumerId },
    #[serde(rename_all = "camelCase")]
    ConsumerScore {
        consumer_id: ConsumerId,
        score: Value,
    },
    #[serde(rename_all = "camelCase")]
    ConsumerLayersChanged {
        consumer_id: ConsumerId,
        layers: Value,
    },
    #[serde(rename_all = "camelCase")]
    ConsumerClosed { consumer_id: ConsumerId },
    #[serde(rename_all = "camelCase")]
    DataConsumerClosed { data_consumer_id: DataConsumerId },
    #[serde(rename_all = "camelCase")]
    SpeakingPeers { peer_volumes: Vec<PeerVolume> },
    #[serde(rename_all = "camelCase")]
    ActiveSpeaker { peer_id: Option<PeerId> },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerVolume {
    pub peer_id: PeerId,
    pub volume: i8,
}

/// Requests initiated by the room towards a peer. The acknowledgement gates
/// further server-side work (a consumer is resumed only after its
/// `newConsumer` request was acked).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "method", content = "data", rename_all = "camelCase")]
pub enum ServerRequest {
    #[serde(rename_all = "camelCase")]
    NewConsumer {
        peer_id: PeerId,
        producer_id: ProducerId,
        id: ConsumerId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        r#type: ConsumerType,
        app_data: MediaAppData,
        producer_paused: bool,
    },
    #[serde(rename_all = "camelCase")]
    NewDataConsumer {
        peer_id: Option<PeerId>,
        data_producer_id: DataProducerId,
        id: DataConsumerId,
        sctp_stream_parameters: Option<SctpStreamParameters>,
        label: String,
        protocol: String,
        app_data: DataAppData,
    },
}

/// A parsed inbound message.
#[derive(Debug)]
pub enum ClientMessage {
    Request { id: u32, request: ClientRequest },
    Notification(ClientNotification),
    Response { id: u32, result: Result<Value, SignalingError> },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    #[serde(default)]
    request: bool,
    #[serde(default)]
    response: bool,
    #[serde(default)]
    notification: bool,
    id: Option<u32>,
    method: Option<String>,
    data: Option<Value>,
    #[serde(default)]
    ok: bool,
    error_reason: Option<String>,
}

fn tagged_value(method: String, data: Option<Value>) -> Value {
    let mut object = serde_json::Map::new();
    object.insert("method".to_string(), Value::String(method));
    if let Some(data) = data {
        object.insert("data".to_string(), data);
    }
    Value::Object(object)
}

/// Parse one inbound text frame.
pub fn parse_client_message(text: &str) -> Result<ClientMessage, SignalingError> {
    let envelope: Envelope = serde_json::from_str(text)
        .map_err(|error| SignalingError::TypeError(format!("malformed message: {error}")))?;

    if envelope.request {
        let id = envelope
            .id
            .ok_or_else(|| SignalingError::TypeError("request without id".to_string()))?;
        let method = envelope
            .method
            .ok_or_else(|| SignalingError::TypeError("request without method".to_string()))?;
        let request = serde_json::from_value(tagged_value(method, envelope.data))
            .map_err(|error| SignalingError::TypeError(format!("bad request: {error}")))?;

        Ok(ClientMessage::Request { id, request })
    } else if envelope.notification {
        let method = envelope
            .method
            .ok_or_else(|| SignalingError::TypeError("notification without method".to_string()))?;
        let notification = serde_json::from_value(tagged_value(method, envelope.data))
            .map_err(|error| SignalingError::TypeError(format!("bad notification: {error}")))?;

        Ok(ClientMessage::Notification(notification))
    } else if envelope.response {
        let id = envelope
            .id
            .ok_or_else(|| SignalingError::TypeError("response without id".to_string()))?;
        let result = if envelope.ok {
            Ok(envelope.data.unwrap_or(Value::Null))
        } else {
            Err(SignalingError::Server(
                envelope
                    .error_reason
                    .unwrap_or_else(|| "request rejected by peer".to_string()),
            ))
        };

        Ok(ClientMessage::Response { id, result })
    } else {
        Err(SignalingError::TypeError(
            "message is neither request, response nor notification".to_string(),
        ))
    }
}

fn split_tagged(value: Value) -> (Value, Value) {
    match value {
        Value::Object(mut object) => {
            let method = object.remove("method").unwrap_or(Value::Null);
            let data = object.remove("data").unwrap_or_else(|| Value::Object(serde_json::Map::new()));
            (method, data)
        }
        _ => (Value::Null, Value::Null),
    }
}

/// Serialize an outbound notification envelope.
pub fn notification_envelope(notification: &ServerNotification) -> String {
    let (method, data) = split_tagged(
        serde_json::to_value(notification).expect("notification serialization never fails"),
    );

    serde_json::json!({
        "notification": true,
        "method": method,
        "data": data,
    })
    .to_string()
}

/// Serialize an outbound request envelope with the given correlation id.
pub fn request_envelope(id: u32, request: &ServerRequest) -> String {
    let (method, data) = split_tagged(
        serde_json::to_value(request).expect("request serialization never fails"),
    );

    serde_json::json!({
        "request": true,
        "id": id,
        "method": method,
        "data": data,
    })
    .to_string()
}

/// Serialize a success response envelope.
pub fn ok_response_envelope(id: u32, data: &Value) -> String {
    serde_json::json!({
        "response": true,
        "id": id,
        "ok": true,
        "data": data,
    })
    .to_string()
}

/// Serialize an error response envelope.
pub fn error_response_envelope(id: u32, error: &SignalingError) -> String {
    serde_json::json!({
        "response": true,
        "id": id,
        "ok": false,
        "errorCode": error.code(),
        "errorReason": error.to_string(),
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_join_request() {
        let text = r#"{
            "request": true,
            "id": 7,
            "method": "join",
            "data": {
                "displayName": "Alice",
                "device": { "name": "firefox" },
                "rtpCapabilities": { "codecs": [], "headerExtensions": [] }
            }
        }"#;

        match parse_client_message(text).unwrap() {
            ClientMessage::Request {
                id,
                request:
                    ClientRequest::Join {
                        display_name,
                        rtp_capabilities,
                        sctp_capabilities,
                        ..
                    },
            } => {
                assert_eq!(id, 7);
                assert_eq!(display_name, "Alice");
                assert!(rtp_capabilities.is_some());
                assert!(sctp_capabilities.is_none());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn parses_request_without_data() {
        let text = r#"{ "request": true, "id": 1, "method": "getRouterRtpCapabilities" }"#;

        match parse_client_message(text).unwrap() {
            ClientMessage::Request {
                request: ClientRequest::GetRouterRtpCapabilities,
                ..
            } => {}
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn unknown_method_is_a_type_error() {
        let text = r#"{ "request": true, "id": 1, "method": "fooBar", "data": {} }"#;

        match parse_client_message(text) {
            Err(SignalingError::TypeError(_)) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn parses_error_response() {
        let text =
            r#"{ "response": true, "id": 3, "ok": false, "errorCode": 500, "errorReason": "boom" }"#;

        match parse_client_message(text).unwrap() {
            ClientMessage::Response { id: 3, result: Err(_) } => {}
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn notification_envelope_shape() {
        let notification = ServerNotification::ActiveSpeaker { peer_id: None };
        let value: Value = serde_json::from_str(&notification_envelope(&notification)).unwrap();

        assert_eq!(value["notification"], Value::Bool(true));
        assert_eq!(value["method"], "activeSpeaker");
        assert!(value["data"]["peerId"].is_null());
    }

    #[test]
    fn notification_method_names_are_camel_case() {
        let notification = ServerNotification::PeerClosed {
            peer_id: PeerId::from("alice".to_string()),
        };
        let value: Value = serde_json::from_str(&notification_envelope(&notification)).unwrap();

        assert_eq!(value["method"], "peerClosed");
        assert_eq!(value["data"]["peerId"], "alice");
    }

    #[test]
    fn change_display_name_notification_parses() {
        let text = r#"{
            "notification": true,
            "method": "changeDisplayName",
            "data": { "displayName": "Bob" }
        }"#;

        match parse_client_message(text).unwrap() {
            ClientMessage::Notification(ClientNotification::ChangeDisplayName {
                display_name,
            }) => assert_eq!(display_name, "Bob"),
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
