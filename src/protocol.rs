//! Wire types for the relay's signaling contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ChannelError;
use crate::media::{MediaKind, TrackKind};
use crate::media_engine::{ConsumerParams, TransportParams};

/// One frame on the signaling socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    Request {
        id: u64,
        event: String,
        #[serde(default)]
        data: Value,
    },
    Response {
        id: u64,
        #[serde(default)]
        data: Value,
    },
    Notification {
        event: String,
        #[serde(default)]
        data: Value,
    },
}

/// Interpret a response payload. The relay reports failure either with
/// `success: false` or with an `error` field.
pub fn check_ack(data: Value) -> Result<Value, ChannelError> {
    let failed = data.get("success").and_then(Value::as_bool) == Some(false);
    let error = data.get("error").and_then(Value::as_str).map(str::to_string);
    match (failed, error) {
        (_, Some(reason)) => Err(ChannelError::Rejected(reason)),
        (true, None) => Err(ChannelError::Rejected("request failed".to_string())),
        (false, None) => Ok(data),
    }
}

/// Decode a typed response body.
pub fn decode<T: serde::de::DeserializeOwned>(event: &str, data: Value) -> Result<T, ChannelError> {
    serde_json::from_value(data)
        .map_err(|e| ChannelError::InvalidResponse(format!("{event}: {e}")))
}

/// A room member as reported by the relay.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PeerInfo {
    pub id: String,
    pub name: String,
    pub is_admin: bool,
    pub is_audio_on: bool,
    pub is_video_on: bool,
    pub sharing_screen: bool,
    pub hand_raise: bool,
    /// Absent for members listed in `users`, which are admitted by construction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_admitted: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerInfo {
    pub producer_id: String,
    pub peer_id: String,
    pub kind: TrackKind,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub app_data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_name: Option<String>,
}

impl ProducerInfo {
    /// Screen shares arrive as video and are told apart by `appData`.
    pub fn media_kind(&self) -> MediaKind {
        self.app_data
            .get("mediaType")
            .and_then(|v| MediaKind::deserialize(v).ok())
            .unwrap_or_else(|| self.kind.into())
    }
}

/// Response to `createRoom` / `joinRoom`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JoinResponse {
    pub users: Vec<PeerInfo>,
    pub peer_id: Option<String>,
    pub current_peer: Option<PeerInfo>,
    pub is_admin: bool,
    /// Open rooms admit immediately.
    pub admitted: Option<bool>,
}

impl JoinResponse {
    pub fn self_id(&self) -> Option<&str> {
        self.peer_id
            .as_deref()
            .or_else(|| self.current_peer.as_ref().map(|p| p.id.as_str()))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransportCreated {
    pub params: TransportParams,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Produced {
    #[serde(alias = "id")]
    pub producer_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Consumed {
    pub params: ConsumerParams,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterCapabilitiesResponse {
    #[serde(alias = "routerRtpCapabilities")]
    pub rtp_capabilities: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceRestarted {
    pub ice_parameters: Value,
}

/// Full room state returned by `reconnect`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectSnapshot {
    pub peer_id: Option<String>,
    pub users: Vec<PeerInfo>,
    pub producers: Vec<ProducerInfo>,
    pub messages: Option<Vec<ChatMessageEvent>>,
    /// Set when the relay still holds the peer in its waiting room.
    pub pending: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessageEvent {
    pub sender_id: String,
    #[serde(default)]
    pub sender_name: String,
    pub message: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerJoinedEvent {
    pub peer_id: String,
    #[serde(default)]
    pub peer_details: Option<PeerInfo>,
    #[serde(default)]
    pub users: Vec<PeerInfo>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerClosedEvent {
    pub peer_id: String,
    #[serde(default)]
    pub peer_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ParticipantsUpdatedEvent {
    #[serde(default)]
    pub users: Vec<PeerInfo>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaToggleEvent {
    pub peer_id: String,
    #[serde(rename = "type")]
    pub kind: TrackKind,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToggleEvent {
    pub peer_id: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerPropertiesEvent {
    pub peer_id: String,
    pub property: String,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerClosedEvent {
    pub consumer_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequestEvent {
    pub peer_id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdmittedEvent {
    pub room_id: Option<String>,
    pub rtp_capabilities: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReasonEvent {
    pub reason: Option<String>,
}

/// Server-pushed notifications.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum Notification {
    #[serde(rename = "newProducer")]
    NewProducer(ProducerInfo),
    #[serde(rename = "producerList")]
    ProducerList(Vec<ProducerInfo>),
    #[serde(rename = "peerJoined")]
    PeerJoined(PeerJoinedEvent),
    #[serde(rename = "peerClosed")]
    PeerClosed(PeerClosedEvent),
    #[serde(rename = "participants-updated")]
    ParticipantsUpdated(ParticipantsUpdatedEvent),
    #[serde(rename = "peer-media-toggle")]
    PeerMediaToggle(MediaToggleEvent),
    #[serde(rename = "screenshare-toggle")]
    ScreenshareToggle(ToggleEvent),
    #[serde(rename = "handraise-toggle")]
    HandraiseToggle(ToggleEvent),
    #[serde(rename = "peerPropertiesUpdated")]
    PeerPropertiesUpdated(PeerPropertiesEvent),
    #[serde(rename = "new-message")]
    NewMessage(ChatMessageEvent),
    #[serde(rename = "consumerClosed")]
    ConsumerClosed(ConsumerClosedEvent),
    #[serde(rename = "join-request")]
    JoinRequest(JoinRequestEvent),
    #[serde(rename = "admitted")]
    Admitted(AdmittedEvent),
    #[serde(rename = "rejected")]
    Rejected(ReasonEvent),
    #[serde(rename = "routerCapabilities")]
    RouterCapabilities(Value),
    #[serde(rename = "roomClosed")]
    RoomClosed(ReasonEvent),
}

impl Notification {
    pub const EVENTS: &'static [&'static str] = &[
        "newProducer",
        "producerList",
        "peerJoined",
        "peerClosed",
        "participants-updated",
        "peer-media-toggle",
        "screenshare-toggle",
        "handraise-toggle",
        "peerPropertiesUpdated",
        "new-message",
        "consumerClosed",
        "join-request",
        "admitted",
        "rejected",
        "routerCapabilities",
        "roomClosed",
    ];

    /// Decode a notification frame. Unknown events yield `Ok(None)`.
    pub fn from_parts(event: &str, data: Value) -> Result<Option<Self>, serde_json::Error> {
        if !Self::EVENTS.contains(&event) {
            return Ok(None);
        }
        let data = match (event, data) {
            ("producerList", Value::Null) => Value::Array(Vec::new()),
            (_, Value::Null) => Value::Object(Default::default()),
            (_, data) => data,
        };
        let tagged = serde_json::json!({ "event": event, "data": data });
        serde_json::from_value(tagged).map(Some)
    }
}

/// What a [`crate::signaling::RelayLink`] delivers to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Notification(Notification),
    /// The link dropped; in-flight requests have failed with `ChannelLost`.
    Disconnected { reason: String },
    /// The link is back. Server-side state may have diverged.
    Reconnected,
}
