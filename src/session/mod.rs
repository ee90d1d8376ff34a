//! Session coordinator.
//!
//! A [`SessionActor`] owns every piece of session state (room view,
//! admission, transports, producers, consumers, chat) and is the only code
//! that mutates it. Callers talk to it through a cloneable [`SessionHandle`];
//! the UI observes it through [`SessionSnapshot`]s and [`SessionNotice`]s.
//!
//! Phases run `Connecting -> AwaitingAdmission -> LoadingMedia -> Active ->
//! Terminated`. Admins skip `AwaitingAdmission`; chat-only sessions skip
//! `LoadingMedia`.

mod actor;
mod messages;

pub use actor::SessionActor;

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::admission::AdmissionState;
use crate::chat::ChatMessage;
use crate::consumer::ConsumerSummary;
use crate::error::Error;
use crate::media::{MediaDevices, MediaKind, MediaStream, TrackKind, TrackRef};
use crate::media_engine::{MediaEngine, TransportDirection};
use crate::metrics::LinkQuality;
use crate::producer::ProducerSummary;
use crate::room::{PendingJoinRequest, Peer};

use messages::{SessionCommand, SessionMessage};

#[derive(Debug, Clone)]
pub struct SessionParams {
    pub room_id: String,
    pub display_name: String,
    /// Create the room (and become its admin) instead of joining it.
    pub create: bool,
}

/// Media engine and capture devices. Sessions without one are chat-only.
#[derive(Clone)]
pub struct MediaStack {
    pub engine: Arc<dyn MediaEngine>,
    pub devices: Arc<dyn MediaDevices>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionPhase {
    Connecting,
    AwaitingAdmission,
    LoadingMedia,
    Active,
    Terminated,
}

/// What the UI is told about the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SessionStatus {
    Connecting,
    WaitingForAdmission,
    Active,
    Error(String),
    Left,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub room_id: String,
    pub self_id: Option<String>,
    pub phase: SessionPhase,
    pub status: SessionStatus,
    pub is_admin: bool,
    pub admission: AdmissionState,
    pub peers: Vec<Peer>,
    pub pending: Vec<PendingJoinRequest>,
    pub producers: Vec<ProducerSummary>,
    pub consumers: Vec<ConsumerSummary>,
    pub messages: Vec<ChatMessage>,
    pub open_transports: usize,
    pub last_error: Option<String>,
}

impl SessionSnapshot {
    pub(crate) fn initial(room_id: &str) -> Self {
        Self {
            room_id: room_id.to_string(),
            self_id: None,
            phase: SessionPhase::Connecting,
            status: SessionStatus::Connecting,
            is_admin: false,
            admission: AdmissionState::Requested,
            peers: Vec::new(),
            pending: Vec::new(),
            producers: Vec::new(),
            consumers: Vec::new(),
            messages: Vec::new(),
            open_transports: 0,
            last_error: None,
        }
    }

    pub fn peer(&self, id: &str) -> Option<&Peer> {
        self.peers.iter().find(|p| p.id == id)
    }

    pub fn is_terminated(&self) -> bool {
        self.phase == SessionPhase::Terminated
    }
}

/// Local, non-fatal events for the UI (toast-equivalents).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    JoinRequest { peer_id: String, name: String },
    PeerLeft { peer_id: String },
    MediaUnavailable { reason: String },
    NegotiationFailed { reason: String },
    ToggleFailed { reason: String },
    ChatFailed { reason: String },
    ScreenShareRevoked { by: String },
    Reconnecting,
    Resynchronized,
}

/// Handle to a running [`SessionActor`].
#[derive(Clone)]
pub struct SessionHandle {
    sender: mpsc::Sender<SessionMessage>,
    snapshot: watch::Receiver<SessionSnapshot>,
    quality: watch::Receiver<Option<LinkQuality>>,
    notices: broadcast::Sender<SessionNotice>,
    cancel_token: CancellationToken,
}

impl SessionHandle {
    async fn send(&self, command: SessionCommand) -> Result<(), Error> {
        self.sender
            .send(SessionMessage::Command(command))
            .await
            .map_err(|_| Error::SessionTerminated)
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, Error>>) -> SessionCommand,
    ) -> Result<T, Error> {
        let (tx, rx) = oneshot::channel();
        self.send(build(tx)).await?;
        rx.await.map_err(|_| Error::SessionTerminated)?
    }

    /// Admit a pending peer. Admin only.
    pub async fn admit(&self, peer_id: impl Into<String>) -> Result<(), Error> {
        let peer_id = peer_id.into();
        self.call(|respond_to| SessionCommand::Admit {
            peer_id,
            respond_to,
        })
        .await
    }

    pub async fn list_pending(&self) -> Result<Vec<PendingJoinRequest>, Error> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::ListPending { respond_to: tx })
            .await?;
        rx.await.map_err(|_| Error::SessionTerminated)
    }

    /// Renderable stream received for the remote `producer_id`, if its
    /// consumer is live.
    pub async fn remote_stream(&self, producer_id: impl Into<String>) -> Result<Option<MediaStream>, Error> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::RemoteStream {
            producer_id: producer_id.into(),
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| Error::SessionTerminated)
    }

    /// Publish `track` as the producer for `kind`. Returns the producer id.
    pub async fn produce(&self, kind: MediaKind, track: TrackRef) -> Result<String, Error> {
        self.call(|respond_to| SessionCommand::Produce {
            kind,
            track,
            respond_to,
        })
        .await
    }

    /// Close the producer for `kind`. Returns false if there was none.
    pub async fn close_producer(&self, kind: MediaKind) -> Result<bool, Error> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::CloseProducer {
            kind,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| Error::SessionTerminated)
    }

    /// Mute/unmute the microphone or camera and tell the room.
    pub async fn set_media_enabled(&self, kind: TrackKind, enabled: bool) -> Result<(), Error> {
        self.call(|respond_to| SessionCommand::SetMediaEnabled {
            kind,
            enabled,
            respond_to,
        })
        .await
    }

    /// Capture the display and share it. Returns the screen producer id.
    pub async fn start_screen_share(&self) -> Result<String, Error> {
        self.call(|respond_to| SessionCommand::StartScreenShare { respond_to })
            .await
    }

    pub async fn stop_screen_share(&self) -> Result<(), Error> {
        self.call(|respond_to| SessionCommand::StopScreenShare { respond_to })
            .await
    }

    pub async fn set_hand_raised(&self, raised: bool) -> Result<(), Error> {
        self.call(|respond_to| SessionCommand::SetHandRaised { raised, respond_to })
            .await
    }

    /// Rename ourselves in the room. Also used when rejoining after a
    /// reconnect.
    pub async fn set_display_name(&self, name: impl Into<String>) -> Result<(), Error> {
        let name = name.into();
        self.call(|respond_to| SessionCommand::SetDisplayName { name, respond_to })
            .await
    }

    pub async fn send_chat(&self, text: impl Into<String>) -> Result<(), Error> {
        let text = text.into();
        self.call(|respond_to| SessionCommand::SendChat { text, respond_to })
            .await
    }

    pub async fn restart_ice(&self, direction: TransportDirection) -> Result<(), Error> {
        self.call(|respond_to| SessionCommand::RestartIce {
            direction,
            respond_to,
        })
        .await
    }

    /// Leave the room. Resolves once every resource has been released.
    pub async fn leave(&self) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        if self
            .send(SessionCommand::Leave { respond_to: tx })
            .await
            .is_err()
        {
            // Already terminated.
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    pub fn notices(&self) -> broadcast::Receiver<SessionNotice> {
        self.notices.subscribe()
    }

    pub fn quality(&self) -> watch::Receiver<Option<LinkQuality>> {
        self.quality.clone()
    }

    /// Wait until a snapshot satisfies `predicate`.
    pub async fn wait_for(
        &self,
        mut predicate: impl FnMut(&SessionSnapshot) -> bool,
    ) -> Result<SessionSnapshot, Error> {
        let mut rx = self.snapshot.clone();
        loop {
            {
                let current = rx.borrow_and_update();
                if predicate(&current) {
                    return Ok(current.clone());
                }
            }
            rx.changed().await.map_err(|_| Error::SessionTerminated)?;
        }
    }

    /// Cancel the session; the actor tears down as on leave.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}
