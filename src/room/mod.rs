//! Room membership model and the typed peer-update reducer.

mod state;

pub use state::{Applied, RemoteProducer, Room};

use serde::Serialize;
use serde_json::Value;

use crate::media::TrackKind;
use crate::protocol::PeerInfo;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MediaFlags {
    pub audio_on: bool,
    pub video_on: bool,
    pub sharing_screen: bool,
    pub hand_raised: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Peer {
    pub id: String,
    pub display_name: String,
    pub is_admin: bool,
    pub admitted: bool,
    pub media: MediaFlags,
}

impl From<PeerInfo> for Peer {
    fn from(info: PeerInfo) -> Self {
        Self {
            id: info.id,
            display_name: info.name,
            is_admin: info.is_admin,
            admitted: info.is_admitted.unwrap_or(true),
            media: MediaFlags {
                audio_on: info.is_audio_on,
                video_on: info.is_video_on,
                sharing_screen: info.sharing_screen,
                hand_raised: info.hand_raise,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingJoinRequest {
    pub peer_id: String,
    pub name: String,
}

/// Peer attributes the relay may update by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerProperty {
    DisplayName(String),
    Admin(bool),
    AudioOn(bool),
    VideoOn(bool),
    SharingScreen(bool),
    HandRaised(bool),
}

impl PeerProperty {
    /// Map a `peerPropertiesUpdated` pair. Unknown names or mistyped values
    /// yield `None`.
    pub fn parse(property: &str, value: &Value) -> Option<Self> {
        let flag = || value.as_bool();
        match property {
            "name" => value.as_str().map(|s| PeerProperty::DisplayName(s.to_string())),
            "isAdmin" => flag().map(PeerProperty::Admin),
            "isAudioOn" => flag().map(PeerProperty::AudioOn),
            "isVideoOn" => flag().map(PeerProperty::VideoOn),
            "sharingScreen" => flag().map(PeerProperty::SharingScreen),
            "handRaise" => flag().map(PeerProperty::HandRaised),
            _ => None,
        }
    }

    /// Wire name and value, the inverse of [`PeerProperty::parse`].
    pub fn to_wire(&self) -> (&'static str, Value) {
        match self {
            PeerProperty::DisplayName(name) => ("name", Value::from(name.as_str())),
            PeerProperty::Admin(admin) => ("isAdmin", Value::from(*admin)),
            PeerProperty::AudioOn(on) => ("isAudioOn", Value::from(*on)),
            PeerProperty::VideoOn(on) => ("isVideoOn", Value::from(*on)),
            PeerProperty::SharingScreen(on) => ("sharingScreen", Value::from(*on)),
            PeerProperty::HandRaised(raised) => ("handRaise", Value::from(*raised)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerUpdate {
    MediaToggled { kind: TrackKind, enabled: bool },
    ScreenShareToggled(bool),
    HandRaiseToggled(bool),
    PropertyUpdated(PeerProperty),
}
