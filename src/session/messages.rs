//! Session actor mailbox types.

use tokio::sync::oneshot;

use crate::admission::JoinOutcome;
use crate::error::{
    ChannelError, Error, MediaAcquisitionError, NegotiationError, TransportError,
};
use crate::media::{LocalMedia, MediaKind, MediaStream, TrackKind, TrackRef};
use crate::media_engine::{ConsumerRef, ProducerRef, TransportDirection, TransportRef};
use crate::protocol::ReconnectSnapshot;
use crate::room::PendingJoinRequest;
use crate::transport::TransportStateChange;

pub(crate) type Reply<T> = oneshot::Sender<Result<T, Error>>;

#[derive(Debug)]
pub(crate) enum SessionMessage {
    Command(SessionCommand),
    /// Completion of a spawned task, tagged with the media epoch it was
    /// started in.
    Task { epoch: u64, result: TaskResult },
}

#[derive(Debug)]
pub(crate) enum SessionCommand {
    Admit {
        peer_id: String,
        respond_to: Reply<()>,
    },
    ListPending {
        respond_to: oneshot::Sender<Vec<PendingJoinRequest>>,
    },
    RemoteStream {
        producer_id: String,
        respond_to: oneshot::Sender<Option<MediaStream>>,
    },
    Produce {
        kind: MediaKind,
        track: TrackRef,
        respond_to: Reply<String>,
    },
    CloseProducer {
        kind: MediaKind,
        respond_to: oneshot::Sender<bool>,
    },
    SetMediaEnabled {
        kind: TrackKind,
        enabled: bool,
        respond_to: Reply<()>,
    },
    StartScreenShare {
        respond_to: Reply<String>,
    },
    StopScreenShare {
        respond_to: Reply<()>,
    },
    SetHandRaised {
        raised: bool,
        respond_to: Reply<()>,
    },
    SetDisplayName {
        name: String,
        respond_to: Reply<()>,
    },
    SendChat {
        text: String,
        respond_to: Reply<()>,
    },
    RestartIce {
        direction: TransportDirection,
        respond_to: Reply<()>,
    },
    Leave {
        respond_to: oneshot::Sender<()>,
    },
}

/// Which peer flag a toggle request announced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Toggle {
    Media(TrackKind),
    ScreenShare,
    HandRaise,
    DisplayName,
}

#[derive(Debug)]
pub(crate) enum TaskResult {
    Joined(Result<JoinOutcome, Error>),
    DeviceLoaded(Result<(), NegotiationError>),
    MediaAcquired(Result<LocalMedia, MediaAcquisitionError>),
    TransportCreated {
        direction: TransportDirection,
        result: Result<TransportRef, TransportError>,
    },
    TransportState(TransportStateChange),
    Produced {
        kind: MediaKind,
        result: Result<ProducerRef, NegotiationError>,
        respond_to: Option<Reply<String>>,
    },
    ScreenCaptured {
        result: Result<TrackRef, MediaAcquisitionError>,
        respond_to: Reply<String>,
    },
    ScreenShareAnnounced {
        producer_id: String,
        result: Result<(), ChannelError>,
        respond_to: Option<Reply<String>>,
    },
    ScreenTrackEnded {
        producer_id: String,
    },
    Consumed {
        producer_id: String,
        peer_id: String,
        kind: MediaKind,
        result: Result<ConsumerRef, NegotiationError>,
    },
    ConsumerResumed {
        producer_id: String,
        consumer_id: String,
        result: Result<(), ChannelError>,
    },
    Toggled {
        toggle: Toggle,
        result: Result<(), ChannelError>,
        respond_to: Option<Reply<()>>,
    },
    AdmitDone {
        peer_id: String,
        result: Result<(), ChannelError>,
        respond_to: Reply<()>,
    },
    ChatSent {
        result: Result<(), Error>,
        respond_to: Reply<()>,
    },
    IceRestarted {
        result: Result<(), NegotiationError>,
        respond_to: Reply<()>,
    },
    Resynced(Result<ReconnectSnapshot, ChannelError>),
}

impl TaskResult {
    /// Results that belong to one generation of transports and producers.
    /// They are discarded when the epoch moved on.
    pub(crate) fn is_epoch_bound(&self) -> bool {
        matches!(
            self,
            TaskResult::DeviceLoaded(_)
                | TaskResult::TransportCreated { .. }
                | TaskResult::TransportState(_)
                | TaskResult::Produced { .. }
                | TaskResult::ScreenCaptured { .. }
                | TaskResult::ScreenShareAnnounced { .. }
                | TaskResult::ScreenTrackEnded { .. }
                | TaskResult::Consumed { .. }
                | TaskResult::ConsumerResumed { .. }
        )
    }

    /// Release any native resource carried by a result nobody will install.
    pub(crate) fn release(self) {
        match self {
            TaskResult::MediaAcquired(Ok(media)) => media.stop(),
            TaskResult::TransportCreated {
                result: Ok(transport),
                ..
            } => transport.close(),
            TaskResult::Produced {
                result: Ok(producer),
                respond_to,
                ..
            } => {
                producer.close();
                reply_terminated(respond_to);
            }
            TaskResult::Produced { respond_to, .. }
            | TaskResult::ScreenShareAnnounced { respond_to, .. } => reply_terminated(respond_to),
            TaskResult::ScreenCaptured {
                result: Ok(track),
                respond_to,
            } => {
                track.stop();
                let _ = respond_to.send(Err(Error::SessionTerminated));
            }
            TaskResult::Consumed {
                result: Ok(consumer),
                ..
            } => {
                consumer.close();
                consumer.track().stop();
            }
            _ => {}
        }
    }
}

fn reply_terminated<T>(respond_to: Option<Reply<T>>) {
    if let Some(tx) = respond_to {
        let _ = tx.send(Err(Error::SessionTerminated));
    }
}
