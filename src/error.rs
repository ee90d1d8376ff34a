//! Error taxonomy for the session coordinator.
//!
//! Each class maps to one failure domain: the signaling channel, admission,
//! local media acquisition, transports, and produce/consume negotiation.
//! Only channel and negotiation errors ever reach the session state machine
//! as fatal; toggle and chat failures are reported as notices.

use thiserror::Error;

use crate::config::ConfigError;
use crate::connection::TransportConnectionState;
use crate::media::MediaKind;
use crate::media_engine::TransportDirection;

/// Failure of a single signaling request or of the channel itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// No acknowledgement arrived within the request window.
    #[error("request '{event}' timed out")]
    Timeout { event: String },

    /// The connection dropped while the request was in flight.
    #[error("signaling channel lost")]
    ChannelLost,

    /// The relay answered with `success: false`.
    #[error("rejected by relay: {0}")]
    Rejected(String),

    /// The channel was closed locally; no further requests are issued.
    #[error("signaling channel closed")]
    Closed,

    #[error("failed to connect to relay: {0}")]
    Connect(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    /// Only a peer marked `isAdmin` may admit others.
    #[error("unauthorized: only the room admin can admit participants")]
    Unauthorized,

    #[error("room not found: {0}")]
    RoomNotFound(String),

    #[error("no pending join request for peer {0}")]
    NotPending(String),

    #[error("join request denied: {0}")]
    Denied(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaAcquisitionError {
    #[error("permission to access media devices was denied")]
    PermissionDenied,

    #[error("no media devices found")]
    DeviceNotFound,

    #[error("cannot satisfy requested media constraints: {0}")]
    ConstraintsUnsatisfiable(String),

    #[error("media acquisition failed: {0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("{0} transport is not ready")]
    NotReady(TransportDirection),

    #[error("{0} transport creation already in progress")]
    CreationPending(TransportDirection),

    #[error("{0} transport already exists")]
    AlreadyExists(TransportDirection),

    #[error("transport creation failed: {0}")]
    Creation(String),

    #[error("{direction} transport connection {state}")]
    Connection {
        direction: TransportDirection,
        state: TransportConnectionState,
    },

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiationError {
    #[error("{operation} rejected by relay: {reason}")]
    Rejected { operation: String, reason: String },

    #[error(transparent)]
    Channel(ChannelError),

    #[error("media engine error: {0}")]
    Engine(String),

    #[error("transport closed during negotiation")]
    TransportClosed,
}

impl NegotiationError {
    /// Lift a channel failure of `operation` into a negotiation failure,
    /// keeping explicit rejections distinguishable from transport loss.
    pub fn from_channel(operation: &str, err: ChannelError) -> Self {
        match err {
            ChannelError::Rejected(reason) => NegotiationError::Rejected {
                operation: operation.to_string(),
                reason,
            },
            other => NegotiationError::Channel(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProducerError {
    #[error("no send transport available")]
    NoSendTransport,

    #[error("already producing {0}")]
    AlreadyProducing(MediaKind),

    #[error("peer {peer_id} is already sharing their screen")]
    ScreenShareBusy { peer_id: String },

    /// The producer was closed while its negotiation was still running.
    #[error("{0} producer closed before negotiation completed")]
    Cancelled(MediaKind),

    #[error(transparent)]
    Acquisition(#[from] MediaAcquisitionError),

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
}

/// Crate-wide error.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error(transparent)]
    Media(#[from] MediaAcquisitionError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error(transparent)]
    Producer(#[from] ProducerError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("session terminated")]
    SessionTerminated,

    #[error("room closed: {0}")]
    RoomClosed(String),

    #[error("message is empty")]
    EmptyMessage,

    #[error("display name is empty")]
    EmptyDisplayName,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Short reason suitable for the UI-facing status line. Never exposes
    /// negotiation internals beyond the relay's own rejection text.
    pub fn user_reason(&self) -> String {
        match self {
            Error::Channel(ChannelError::Rejected(reason)) => reason.clone(),
            Error::Admission(AdmissionError::RoomNotFound(_)) => "Room does not exist".to_string(),
            Error::Transport(TransportError::Connection { direction, .. }) => {
                format!("{direction} transport connection failed")
            }
            Error::Negotiation(_) => "media negotiation failed".to_string(),
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
