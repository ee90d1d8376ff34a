//! Client-side session coordination for a relay-mediated audio/video/chat
//! room.
//!
//! The [`session::SessionActor`] turns signaling events, user actions and
//! media-negotiation results into one consistent view of the room, and
//! drives transport, producer and consumer lifecycles in order.

pub mod admission;
pub mod chat;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod media;
pub mod media_engine;
pub mod metrics;
pub mod producer;
pub mod protocol;
pub mod room;
pub mod session;
pub mod signaling;
pub mod transport;

pub use config::ClientConfig;
pub use error::{Error, Result};
pub use session::{
    MediaStack, SessionActor, SessionHandle, SessionNotice, SessionParams, SessionPhase,
    SessionSnapshot, SessionStatus,
};
pub use signaling::{SignalingChannel, WsRelayLink};
