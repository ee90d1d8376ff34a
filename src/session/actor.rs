//! The session actor: one task owning all session state.
//!
//! Every suspension point (signaling round-trip, engine negotiation, device
//! acquisition) runs in a spawned task that reports back through the
//! mailbox as a [`TaskResult`]. The actor applies results one at a time, so
//! coordinator logic never runs concurrently with itself.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::messages::{Reply, SessionCommand, SessionMessage, TaskResult, Toggle};
use super::{
    MediaStack, SessionHandle, SessionNotice, SessionParams, SessionPhase, SessionSnapshot,
    SessionStatus,
};
use crate::admission::{self, AdmissionController, JoinOutcome};
use crate::chat::{self, ChatLog, ChatMessage};
use crate::config::ClientConfig;
use crate::consumer::{Consumer, ConsumerRegistry};
use crate::error::{
    AdmissionError, ChannelError, Error, MediaAcquisitionError, NegotiationError, ProducerError,
    TransportError,
};
use crate::media::{LocalMedia, MediaKind, TrackKind, TrackRef};
use crate::media_engine::{
    ConsumerRef, ProduceOptions, ProducerRef, TransportDirection, TransportRef,
};
use crate::metrics::{self, LinkQuality};
use crate::producer::ProducerRegistry;
use crate::protocol::{ChannelEvent, Notification, PeerInfo, PeerJoinedEvent, ReconnectSnapshot};
use crate::room::{Applied, PeerProperty, PeerUpdate, RemoteProducer, Room};
use crate::signaling::SignalingChannel;
use crate::transport::{self, TransportManager};

/// Default channel buffer size for the session mailbox.
const SESSION_CHANNEL_BUFFER: usize = 128;

/// Buffered notices per subscriber before the slowest one lags.
const NOTICE_CHANNEL_BUFFER: usize = 64;

pub struct SessionActor {
    params: SessionParams,
    config: ClientConfig,
    signaling: SignalingChannel,
    media: Option<MediaStack>,

    receiver: mpsc::Receiver<SessionMessage>,
    /// Handed to spawned tasks. Weak so that dropping every handle lets the
    /// mailbox close once no task is outstanding.
    mailbox: mpsc::WeakSender<SessionMessage>,
    events: broadcast::Receiver<ChannelEvent>,
    cancel_token: CancellationToken,
    /// Child of `cancel_token`; renewed whenever the media generation resets.
    media_cancel: CancellationToken,

    snapshot: watch::Sender<SessionSnapshot>,
    notices: broadcast::Sender<SessionNotice>,
    quality: Arc<watch::Sender<Option<LinkQuality>>>,

    phase: SessionPhase,
    /// Media generation. Bumped on teardown and on a media rebuild; results
    /// of tasks from an older generation are released instead of applied.
    epoch: u64,
    final_status: Option<SessionStatus>,
    last_error: Option<String>,

    room: Room,
    admission: AdmissionController,
    transports: TransportManager,
    producers: ProducerRegistry,
    consumers: ConsumerRegistry,
    chat: ChatLog,
    router_capabilities: Option<Value>,
    local_media_requested: bool,
    screen_capture_pending: bool,
    resync_pending: bool,
}

impl SessionActor {
    /// Spawn the actor and start joining `params.room_id`.
    ///
    /// Returns the handle and the actor's task. The task ends after the
    /// session has been torn down and every resource released.
    pub fn spawn(
        params: SessionParams,
        config: ClientConfig,
        signaling: SignalingChannel,
        media: Option<MediaStack>,
        cancel_token: CancellationToken,
    ) -> (SessionHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(SESSION_CHANNEL_BUFFER);
        let (snapshot, snapshot_rx) = watch::channel(SessionSnapshot::initial(&params.room_id));
        let (quality, quality_rx) = watch::channel(None);
        let (notices, _) = broadcast::channel(NOTICE_CHANNEL_BUFFER);

        // Subscribe before the join request goes out so no notification
        // sent in reply to it can be missed.
        let events = signaling.subscribe();

        let actor = Self {
            room: Room::new(params.room_id.clone()),
            params,
            config,
            signaling,
            media,
            receiver,
            mailbox: sender.downgrade(),
            events,
            media_cancel: cancel_token.child_token(),
            cancel_token: cancel_token.clone(),
            snapshot,
            notices: notices.clone(),
            quality: Arc::new(quality),
            phase: SessionPhase::Connecting,
            epoch: 0,
            final_status: None,
            last_error: None,
            admission: AdmissionController::new(),
            transports: TransportManager::new(),
            producers: ProducerRegistry::new(),
            consumers: ConsumerRegistry::new(),
            chat: ChatLog::new(),
            router_capabilities: None,
            local_media_requested: false,
            screen_capture_pending: false,
            resync_pending: false,
        };

        let handle = SessionHandle {
            sender,
            snapshot: snapshot_rx,
            quality: quality_rx,
            notices,
            cancel_token,
        };

        let task = tokio::spawn(actor.run());
        (handle, task)
    }

    #[instrument(skip_all, name = "meet.session", fields(room_id = %self.params.room_id))]
    async fn run(mut self) {
        info!(
            target: "meet.session",
            room_id = %self.params.room_id,
            create = self.params.create,
            chat_only = self.media.is_none(),
            "Session starting"
        );
        self.start_join();
        self.publish();

        while self.phase != SessionPhase::Terminated {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(target: "meet.session", "Session cancelled");
                    self.teardown(SessionStatus::Left).await;
                }
                message = self.receiver.recv() => match message {
                    Some(message) => self.handle_message(message).await,
                    None => {
                        debug!(target: "meet.session", "All handles dropped");
                        self.teardown(SessionStatus::Left).await;
                    }
                },
                event = self.events.recv() => self.handle_channel_event(event).await,
            }
            self.publish();
        }

        // Late task results still own native resources.
        self.receiver.close();
        let mut released = 0usize;
        while let Some(message) = self.receiver.recv().await {
            match message {
                SessionMessage::Task { result, .. } => {
                    result.release();
                    released += 1;
                }
                SessionMessage::Command(SessionCommand::Leave { respond_to }) => {
                    let _ = respond_to.send(());
                }
                SessionMessage::Command(_) => {}
            }
        }
        info!(target: "meet.session", released, "Session actor stopped");
    }

    async fn handle_message(&mut self, message: SessionMessage) {
        match message {
            SessionMessage::Command(command) => self.handle_command(command).await,
            SessionMessage::Task { epoch, result } => {
                if result.is_epoch_bound() && epoch != self.epoch {
                    debug!(
                        target: "meet.session",
                        epoch,
                        current = self.epoch,
                        "Releasing result of a previous media generation"
                    );
                    result.release();
                    return;
                }
                self.handle_task(result).await;
            }
        }
    }

    /// Run `task` off the actor and deliver its result to the mailbox.
    fn spawn_task<F>(&self, task: F)
    where
        F: Future<Output = TaskResult> + Send + 'static,
    {
        let Some(sender) = self.mailbox.upgrade() else {
            return;
        };
        let epoch = self.epoch;
        tokio::spawn(async move {
            let result = task.await;
            if let Err(mpsc::error::SendError(message)) =
                sender.send(SessionMessage::Task { epoch, result }).await
            {
                if let SessionMessage::Task { result, .. } = message {
                    result.release();
                }
            }
        });
    }

    fn notify(&self, notice: SessionNotice) {
        // No subscriber is fine.
        let _ = self.notices.send(notice);
    }

    fn status(&self) -> SessionStatus {
        if let Some(status) = &self.final_status {
            return status.clone();
        }
        match self.phase {
            SessionPhase::Connecting | SessionPhase::LoadingMedia => SessionStatus::Connecting,
            SessionPhase::AwaitingAdmission => SessionStatus::WaitingForAdmission,
            SessionPhase::Active => SessionStatus::Active,
            SessionPhase::Terminated => SessionStatus::Left,
        }
    }

    fn publish(&self) {
        let open_transports = [TransportDirection::Send, TransportDirection::Recv]
            .into_iter()
            .filter(|direction| self.transports.get(*direction).is_some())
            .count();
        self.snapshot.send_replace(SessionSnapshot {
            room_id: self.room.id().to_string(),
            self_id: self.room.self_id().map(str::to_string),
            phase: self.phase,
            status: self.status(),
            is_admin: self.admission.is_admin(),
            admission: self.admission.state(),
            peers: self.room.peers().cloned().collect(),
            pending: self.admission.list_pending(),
            producers: self.producers.summaries(),
            consumers: self.consumers.summaries(),
            messages: self.chat.messages().to_vec(),
            open_transports,
            last_error: self.last_error.clone(),
        });
    }

    fn set_phase(&mut self, phase: SessionPhase) {
        if self.phase != phase {
            info!(target: "meet.session", from = ?self.phase, to = ?phase, "Session phase changed");
            self.phase = phase;
        }
    }

    fn self_id(&self) -> Option<String> {
        self.room.self_id().map(str::to_string)
    }

    fn is_sharing_screen(&self) -> bool {
        self.room
            .self_id()
            .and_then(|id| self.room.peer(id))
            .is_some_and(|peer| peer.media.sharing_screen)
    }

    /// Another peer currently marked as sharing a screen.
    fn other_sharer(&self) -> Option<String> {
        let sharer = self.room.screen_sharer()?;
        if Some(sharer.id.as_str()) == self.room.self_id() {
            return None;
        }
        Some(sharer.id.clone())
    }

    // ----- join and admission -------------------------------------------

    fn start_join(&self) {
        let signaling = self.signaling.clone();
        let room_id = self.params.room_id.clone();
        let name = self.params.display_name.clone();
        let create = self.params.create;
        self.spawn_task(async move {
            TaskResult::Joined(admission::request_join(&signaling, &room_id, &name, create).await)
        });
    }

    async fn on_joined(&mut self, result: Result<JoinOutcome, Error>) {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                if matches!(
                    self.phase,
                    SessionPhase::Connecting | SessionPhase::AwaitingAdmission
                ) {
                    self.fail(err).await;
                } else {
                    warn!(target: "meet.session", error = %err, "Join retry failed after admission");
                }
                return;
            }
        };

        self.room.set_self_id(outcome.self_id().to_string());
        self.admission.record_outcome(&outcome);
        let users = match outcome {
            JoinOutcome::Admitted { users, .. } | JoinOutcome::Pending { users, .. } => users,
        };
        self.apply_membership(users);

        info!(
            target: "meet.session",
            self_id = self.room.self_id().unwrap_or_default(),
            admitted = self.admission.is_admitted(),
            is_admin = self.admission.is_admin(),
            peers = self.room.peers().count(),
            "Joined room"
        );

        if self.admission.is_admitted() {
            if matches!(
                self.phase,
                SessionPhase::Connecting | SessionPhase::AwaitingAdmission
            ) {
                self.enter_admitted();
            }
        } else if self.phase == SessionPhase::Connecting {
            self.set_phase(SessionPhase::AwaitingAdmission);
        }
    }

    /// Nothing media-related may start before this runs.
    fn enter_admitted(&mut self) {
        if self.media.is_none() {
            info!(target: "meet.session", "No media stack, running chat-only");
            self.set_phase(SessionPhase::Active);
            return;
        }
        self.set_phase(SessionPhase::LoadingMedia);
        self.start_media_load();
    }

    fn apply_membership(&mut self, users: Vec<PeerInfo>) {
        for peer_id in self.room.replace_peers(users) {
            let closed = self.consumers.remove_peer(&peer_id);
            self.admission.peer_left(&peer_id);
            debug!(target: "meet.session", %peer_id, closed, "Peer no longer listed");
        }
        let members: Vec<String> = self
            .room
            .peers()
            .filter(|peer| peer.admitted)
            .map(|peer| peer.id.clone())
            .collect();
        self.admission
            .reconcile_members(members.iter().map(String::as_str));
    }

    fn admit(&mut self, peer_id: String, respond_to: Reply<()>) {
        if let Err(err) = self.admission.authorize_admit(&peer_id) {
            let _ = respond_to.send(Err(err.into()));
            return;
        }
        let signaling = self.signaling.clone();
        let room_id = self.params.room_id.clone();
        self.spawn_task(async move {
            let result = signaling.admit_participant(&room_id, &peer_id).await;
            TaskResult::AdmitDone {
                peer_id,
                result,
                respond_to,
            }
        });
    }

    fn on_admit_done(&mut self, peer_id: String, result: Result<(), ChannelError>, respond_to: Reply<()>) {
        let reply = match result {
            Ok(()) => {
                info!(target: "meet.admission", %peer_id, "Participant admitted");
                self.admission.complete_admit(&peer_id);
                Ok(())
            }
            Err(ChannelError::Rejected(reason)) if reason == "Unauthorized" => {
                Err(AdmissionError::Unauthorized.into())
            }
            Err(err) => {
                warn!(target: "meet.admission", %peer_id, error = %err, "Admit failed");
                Err(err.into())
            }
        };
        let _ = respond_to.send(reply);
    }

    // ----- media load and transports ------------------------------------

    fn start_media_load(&mut self) {
        let Some(stack) = self.media.clone() else {
            return;
        };

        if stack.engine.is_loaded() {
            self.create_transports();
        } else {
            let signaling = self.signaling.clone();
            let room_id = self.params.room_id.clone();
            let cached = self.router_capabilities.clone();
            let engine = stack.engine.clone();
            self.spawn_task(async move {
                let capabilities = match cached {
                    Some(capabilities) => capabilities,
                    None => match signaling.router_rtp_capabilities(&room_id).await {
                        Ok(capabilities) => capabilities,
                        Err(err) => {
                            return TaskResult::DeviceLoaded(Err(NegotiationError::from_channel(
                                "getRouterRtpCapabilities",
                                err,
                            )))
                        }
                    },
                };
                TaskResult::DeviceLoaded(engine.load(capabilities).await)
            });
        }

        let constraints = self.config.media.clone();
        if !self.local_media_requested && !constraints.is_empty() {
            self.local_media_requested = true;
            let devices = stack.devices.clone();
            self.spawn_task(async move {
                TaskResult::MediaAcquired(devices.user_media(&constraints).await)
            });
        }
    }

    fn create_transports(&mut self) {
        let Some(stack) = self.media.clone() else {
            return;
        };
        for direction in [TransportDirection::Send, TransportDirection::Recv] {
            if let Err(err) = self.transports.begin(direction) {
                debug!(target: "meet.transport", %direction, reason = %err, "Transport creation skipped");
                continue;
            }
            let signaling = self.signaling.clone();
            let engine = stack.engine.clone();
            let ice_servers = self.config.rtc_ice_servers();
            self.spawn_task(async move {
                let result =
                    transport::create_transport(signaling, engine, direction, ice_servers).await;
                TaskResult::TransportCreated { direction, result }
            });
        }
    }

    async fn on_transport_created(
        &mut self,
        direction: TransportDirection,
        result: Result<TransportRef, TransportError>,
    ) {
        let transport = match result {
            Ok(transport) => transport,
            Err(err) => {
                self.transports.abort(direction);
                self.fail(err.into()).await;
                return;
            }
        };

        if let Err(refused) = self.transports.complete(transport.clone()) {
            debug!(target: "meet.transport", %direction, id = refused.id(), "Closing unclaimed transport");
            refused.close();
            return;
        }

        let epoch = self.epoch;
        transport::spawn_state_watcher(
            &transport,
            self.media_cancel.clone(),
            self.mailbox.clone(),
            move |change| SessionMessage::Task {
                epoch,
                result: TaskResult::TransportState(change),
            },
        );

        match direction {
            TransportDirection::Send => {
                if let Some(period) = self.config.stats_interval {
                    metrics::spawn_quality_monitor(
                        transport,
                        period,
                        self.media_cancel.clone(),
                        self.quality.clone(),
                    );
                }
                self.maybe_activate();
                self.produce_staged();
            }
            TransportDirection::Recv => {
                self.maybe_activate();
                self.reconcile_consumers();
            }
        }
    }

    fn maybe_activate(&mut self) {
        if self.phase == SessionPhase::LoadingMedia && self.transports.both_ready() {
            self.set_phase(SessionPhase::Active);
        }
    }

    // ----- producers ----------------------------------------------------

    fn on_media_acquired(&mut self, result: Result<LocalMedia, MediaAcquisitionError>) {
        match result {
            Ok(media) => {
                for (kind, track) in media.into_tracks() {
                    debug!(target: "meet.producer", %kind, track_id = track.id(), "Local track acquired");
                    self.producers.stage(kind, track);
                }
                self.produce_staged();
            }
            Err(err) => {
                warn!(target: "meet.producer", error = %err, "Local media unavailable, continuing receive-only");
                self.notify(SessionNotice::MediaUnavailable {
                    reason: err.to_string(),
                });
            }
        }
    }

    fn produce_staged(&mut self) {
        if self.transports.send().is_none() {
            return;
        }
        for kind in self.producers.staged_kinds() {
            if self.producers.is_producing(kind) {
                continue;
            }
            let Some(track) = self.producers.take_staged(kind) else {
                continue;
            };
            match self.reserve_producer(kind, &track) {
                Ok(send) => self.spawn_produce(send, kind, track, None),
                Err(err) => {
                    warn!(target: "meet.producer", %kind, error = %err, "Staged track not produced");
                    track.stop();
                }
            }
        }
    }

    fn reserve_producer(&mut self, kind: MediaKind, track: &TrackRef) -> Result<TransportRef, ProducerError> {
        let send = self.transports.send().cloned();
        self.producers.reserve(kind, track.clone(), send.is_some())?;
        send.ok_or(ProducerError::NoSendTransport)
    }

    fn spawn_produce(
        &self,
        send: TransportRef,
        kind: MediaKind,
        track: TrackRef,
        respond_to: Option<Reply<String>>,
    ) {
        debug!(target: "meet.producer", %kind, transport_id = send.id(), "Producing");
        self.spawn_task(async move {
            let result = send.produce(track, ProduceOptions::for_kind(kind)).await;
            TaskResult::Produced {
                kind,
                result,
                respond_to,
            }
        });
    }

    fn produce(&mut self, kind: MediaKind, track: TrackRef, respond_to: Reply<String>) {
        if kind == MediaKind::Screen {
            if let Err(err) = self.check_screen_share() {
                let _ = respond_to.send(Err(err.into()));
                return;
            }
        }
        match self.reserve_producer(kind, &track) {
            Ok(send) => self.spawn_produce(send, kind, track, Some(respond_to)),
            Err(err) => {
                let _ = respond_to.send(Err(err.into()));
            }
        }
    }

    fn on_produced(
        &mut self,
        kind: MediaKind,
        result: Result<ProducerRef, NegotiationError>,
        respond_to: Option<Reply<String>>,
    ) {
        match result {
            Ok(producer) => {
                let producer_id = producer.id().to_string();
                if let Err(refused) = self.producers.complete(kind, producer) {
                    debug!(target: "meet.producer", %kind, id = refused.id(), "Closing unclaimed producer");
                    refused.close();
                    reply(respond_to, Err(ProducerError::Cancelled(kind).into()));
                    return;
                }
                info!(target: "meet.producer", %kind, %producer_id, "Producer created");
                if kind == MediaKind::Screen {
                    self.watch_screen_track(producer_id.clone());
                    self.announce_screen_share(producer_id, respond_to);
                } else {
                    reply(respond_to, Ok(producer_id));
                }
            }
            Err(err) => {
                warn!(target: "meet.producer", %kind, error = %err, "Produce failed");
                if let Some(track) = self.producers.abort(kind) {
                    if kind == MediaKind::Screen {
                        track.stop();
                    } else {
                        // Retried with the next media generation.
                        self.producers.stage(kind, track);
                    }
                }
                self.record_negotiation_failure(&err);
                reply(respond_to, Err(ProducerError::Negotiation(err).into()));
            }
        }
    }

    fn record_negotiation_failure(&mut self, err: &NegotiationError) {
        let reason = Error::Negotiation(err.clone()).user_reason();
        self.last_error = Some(reason.clone());
        self.notify(SessionNotice::NegotiationFailed { reason });
    }

    fn set_media_enabled(&mut self, kind: TrackKind, enabled: bool, respond_to: Reply<()>) {
        let media_kind = MediaKind::from(kind);
        let live = if enabled {
            self.producers.resume(media_kind)
        } else {
            self.producers.pause(media_kind)
        };
        debug!(target: "meet.producer", %media_kind, enabled, live, "Local media toggled");

        if let Some(self_id) = self.self_id() {
            self.room
                .apply(&self_id, PeerUpdate::MediaToggled { kind, enabled });
        }
        let signaling = self.signaling.clone();
        let room_id = self.params.room_id.clone();
        self.spawn_task(async move {
            let result = signaling.toggle_media(&room_id, kind, enabled).await;
            TaskResult::Toggled {
                toggle: Toggle::Media(kind),
                result,
                respond_to: Some(respond_to),
            }
        });
    }

    fn set_hand_raised(&mut self, raised: bool, respond_to: Reply<()>) {
        if let Some(self_id) = self.self_id() {
            self.room
                .apply(&self_id, PeerUpdate::HandRaiseToggled(raised));
        }
        let signaling = self.signaling.clone();
        let room_id = self.params.room_id.clone();
        self.spawn_task(async move {
            let result = signaling.toggle_handraise(&room_id, raised).await;
            TaskResult::Toggled {
                toggle: Toggle::HandRaise,
                result,
                respond_to: Some(respond_to),
            }
        });
    }

    fn set_display_name(&mut self, name: String, respond_to: Reply<()>) {
        let name = name.trim().to_string();
        if name.is_empty() {
            let _ = respond_to.send(Err(Error::EmptyDisplayName));
            return;
        }
        self.params.display_name = name.clone();
        let property = PeerProperty::DisplayName(name);
        if let Some(self_id) = self.self_id() {
            self.room
                .apply(&self_id, PeerUpdate::PropertyUpdated(property.clone()));
        }
        let signaling = self.signaling.clone();
        let room_id = self.params.room_id.clone();
        self.spawn_task(async move {
            let result = signaling.update_peer_properties(&room_id, &property).await;
            TaskResult::Toggled {
                toggle: Toggle::DisplayName,
                result,
                respond_to: Some(respond_to),
            }
        });
    }

    fn on_toggled(&mut self, toggle: Toggle, result: Result<(), ChannelError>, respond_to: Option<Reply<()>>) {
        match result {
            Ok(()) => reply(respond_to, Ok(())),
            Err(err) => {
                warn!(target: "meet.session", ?toggle, error = %err, "Toggle not acknowledged");
                self.notify(SessionNotice::ToggleFailed {
                    reason: err.to_string(),
                });
                reply(respond_to, Err(err.into()));
            }
        }
    }

    // ----- screen share -------------------------------------------------

    fn check_screen_share(&self) -> Result<(), ProducerError> {
        if self.producers.is_producing(MediaKind::Screen) || self.screen_capture_pending {
            return Err(ProducerError::AlreadyProducing(MediaKind::Screen));
        }
        if let Some(peer_id) = self.other_sharer() {
            return Err(ProducerError::ScreenShareBusy { peer_id });
        }
        if self.media.is_none() || self.transports.send().is_none() {
            return Err(ProducerError::NoSendTransport);
        }
        Ok(())
    }

    fn start_screen_share(&mut self, respond_to: Reply<String>) {
        if let Err(err) = self.check_screen_share() {
            let _ = respond_to.send(Err(err.into()));
            return;
        }
        let Some(stack) = self.media.clone() else {
            let _ = respond_to.send(Err(ProducerError::NoSendTransport.into()));
            return;
        };
        self.screen_capture_pending = true;
        self.spawn_task(async move {
            let result = stack.devices.display_media().await;
            TaskResult::ScreenCaptured { result, respond_to }
        });
    }

    fn on_screen_captured(&mut self, result: Result<TrackRef, MediaAcquisitionError>, respond_to: Reply<String>) {
        self.screen_capture_pending = false;
        let track = match result {
            Ok(track) => track,
            Err(err) => {
                warn!(target: "meet.producer", error = %err, "Display capture failed");
                let _ = respond_to.send(Err(ProducerError::Acquisition(err).into()));
                return;
            }
        };
        // The room may have changed while the picker was open.
        if let Err(err) = self.check_screen_share() {
            track.stop();
            let _ = respond_to.send(Err(err.into()));
            return;
        }
        match self.reserve_producer(MediaKind::Screen, &track) {
            Ok(send) => self.spawn_produce(send, MediaKind::Screen, track, Some(respond_to)),
            Err(err) => {
                track.stop();
                let _ = respond_to.send(Err(err.into()));
            }
        }
    }

    fn announce_screen_share(&mut self, producer_id: String, respond_to: Option<Reply<String>>) {
        if let Some(peer_id) = self.other_sharer() {
            info!(target: "meet.producer", %peer_id, "Screen share lost the race, closing producer");
            self.producers.close(MediaKind::Screen);
            reply(respond_to, Err(ProducerError::ScreenShareBusy { peer_id }.into()));
            return;
        }
        if let Some(self_id) = self.self_id() {
            self.room
                .apply(&self_id, PeerUpdate::ScreenShareToggled(true));
        }
        let signaling = self.signaling.clone();
        let room_id = self.params.room_id.clone();
        self.spawn_task(async move {
            let result = signaling.toggle_screenshare(&room_id, true).await;
            TaskResult::ScreenShareAnnounced {
                producer_id,
                result,
                respond_to,
            }
        });
    }

    /// Report when the shared screen's track ends by itself. Holds only a
    /// weak sender so a track that never ends keeps nothing alive.
    fn watch_screen_track(&self, producer_id: String) {
        let Some(ended) = self.producers.track(MediaKind::Screen).and_then(|t| t.ended()) else {
            return;
        };
        let mailbox = self.mailbox.clone();
        let cancel = self.media_cancel.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = ended => {
                    if let Some(sender) = mailbox.upgrade() {
                        let result = TaskResult::ScreenTrackEnded { producer_id };
                        let _ = sender.send(SessionMessage::Task { epoch, result }).await;
                    }
                }
            }
        });
    }

    fn on_screen_track_ended(&mut self, producer_id: String) {
        // Also fires after a local stop, by which point the producer is gone.
        if self.producers.producer_id(MediaKind::Screen) != Some(producer_id.as_str()) {
            return;
        }
        info!(target: "meet.producer", %producer_id, "Screen capture ended by its source");
        self.producers.close(MediaKind::Screen);
        self.withdraw_screen_share(None);
    }

    fn on_screen_share_announced(
        &mut self,
        producer_id: String,
        result: Result<(), ChannelError>,
        respond_to: Option<Reply<String>>,
    ) {
        match result {
            Ok(()) => reply(respond_to, Ok(producer_id)),
            Err(err) => {
                warn!(target: "meet.producer", %producer_id, error = %err, "Screen share announcement failed");
                if self.producers.producer_id(MediaKind::Screen) == Some(producer_id.as_str()) {
                    self.producers.close(MediaKind::Screen);
                    if let Some(self_id) = self.self_id() {
                        self.room
                            .apply(&self_id, PeerUpdate::ScreenShareToggled(false));
                    }
                }
                self.notify(SessionNotice::ToggleFailed {
                    reason: err.to_string(),
                });
                reply(respond_to, Err(err.into()));
            }
        }
    }

    /// Clear the local sharing flag and tell the room.
    fn withdraw_screen_share(&mut self, respond_to: Option<Reply<()>>) {
        if !self.is_sharing_screen() {
            reply(respond_to, Ok(()));
            return;
        }
        if let Some(self_id) = self.self_id() {
            self.room
                .apply(&self_id, PeerUpdate::ScreenShareToggled(false));
        }
        let signaling = self.signaling.clone();
        let room_id = self.params.room_id.clone();
        self.spawn_task(async move {
            let result = signaling.toggle_screenshare(&room_id, false).await;
            TaskResult::Toggled {
                toggle: Toggle::ScreenShare,
                result,
                respond_to,
            }
        });
    }

    // ----- consumers ----------------------------------------------------

    /// Ensure exactly one consumer per consumable producer and none for
    /// producers that went away.
    fn reconcile_consumers(&mut self) {
        if !matches!(self.phase, SessionPhase::LoadingMedia | SessionPhase::Active) {
            return;
        }
        let room = &self.room;
        let dropped = self.consumers.retain_producers(|id| room.has_producer(id));
        if dropped > 0 {
            debug!(target: "meet.consumer", dropped, "Closed consumers of vanished producers");
        }

        let Some(recv) = self.transports.recv().cloned() else {
            return;
        };
        let Some(rtp_capabilities) = self
            .media
            .as_ref()
            .and_then(|stack| stack.engine.rtp_capabilities())
        else {
            return;
        };

        for producer in self.room.consumable_producers() {
            if !self
                .consumers
                .reserve(&producer.producer_id, &producer.peer_id)
            {
                continue;
            }
            self.spawn_consume(recv.clone(), producer, rtp_capabilities.clone());
        }
    }

    fn spawn_consume(&self, recv: TransportRef, producer: RemoteProducer, rtp_capabilities: Value) {
        debug!(
            target: "meet.consumer",
            producer_id = %producer.producer_id,
            peer_id = %producer.peer_id,
            kind = %producer.kind,
            "Consuming"
        );
        let signaling = self.signaling.clone();
        self.spawn_task(async move {
            let RemoteProducer {
                producer_id,
                peer_id,
                kind,
                ..
            } = producer;
            let result: Result<ConsumerRef, NegotiationError> = async {
                let params = signaling
                    .consume(recv.id(), &producer_id, rtp_capabilities)
                    .await
                    .map_err(|e| NegotiationError::from_channel("consume", e))?;
                recv.consume(params).await
            }
            .await;
            TaskResult::Consumed {
                producer_id,
                peer_id,
                kind,
                result,
            }
        });
    }

    fn on_consumed(
        &mut self,
        producer_id: String,
        peer_id: String,
        kind: MediaKind,
        result: Result<ConsumerRef, NegotiationError>,
    ) {
        let handle = match result {
            Ok(handle) => handle,
            Err(err) => {
                warn!(target: "meet.consumer", %producer_id, %peer_id, error = %err, "Consume failed");
                self.consumers.fail(&producer_id);
                self.record_negotiation_failure(&err);
                return;
            }
        };

        let consumer = Consumer::new(peer_id, kind, handle);
        let consumer_id = consumer.id().to_string();
        if let Err(refused) = self.consumers.complete(consumer) {
            debug!(target: "meet.consumer", %producer_id, "Closing unclaimed consumer");
            refused.close();
            return;
        }

        let signaling = self.signaling.clone();
        self.spawn_task(async move {
            let result = signaling.resume_consumer(&consumer_id).await;
            TaskResult::ConsumerResumed {
                producer_id,
                consumer_id,
                result,
            }
        });
    }

    /// A consumer left paused on the relay renders nothing, so a refused
    /// resume is treated like a failed consume.
    fn on_consumer_resumed(&mut self, producer_id: String, consumer_id: String, result: Result<(), ChannelError>) {
        let Err(err) = result else {
            debug!(target: "meet.consumer", %producer_id, %consumer_id, "Consumer resumed");
            return;
        };
        warn!(target: "meet.consumer", %producer_id, %consumer_id, error = %err, "Consumer resume failed");
        if self.consumers.fail_live(&producer_id, &consumer_id) {
            self.record_negotiation_failure(&NegotiationError::from_channel("resumeConsumer", err));
        }
    }

    fn on_peer_closed(&mut self, peer_id: &str) {
        let closed = self.consumers.remove_peer(peer_id);
        let removed = self.room.remove_peer(peer_id).is_some();
        let abandoned = self.admission.peer_left(peer_id);
        if removed || abandoned {
            info!(target: "meet.session", %peer_id, closed, "Peer left");
            self.notify(SessionNotice::PeerLeft {
                peer_id: peer_id.to_string(),
            });
        }
    }

    fn apply_peer_update(&mut self, peer_id: &str, update: PeerUpdate) {
        match self.room.apply(peer_id, update) {
            Applied::UnknownPeer => {
                debug!(target: "meet.session", %peer_id, "Update for unknown peer ignored");
            }
            Applied::Updated {
                displaced_sharer: Some(displaced),
            } if Some(displaced.as_str()) == self.room.self_id() => {
                warn!(target: "meet.producer", by = %peer_id, "Screen share superseded by another peer");
                self.producers.close(MediaKind::Screen);
                self.notify(SessionNotice::ScreenShareRevoked {
                    by: peer_id.to_string(),
                });
                let signaling = self.signaling.clone();
                let room_id = self.params.room_id.clone();
                self.spawn_task(async move {
                    let result = signaling.toggle_screenshare(&room_id, false).await;
                    TaskResult::Toggled {
                        toggle: Toggle::ScreenShare,
                        result,
                        respond_to: None,
                    }
                });
            }
            Applied::Updated { .. } => {}
        }
    }

    // ----- reconnection -------------------------------------------------

    fn on_reconnected(&mut self) {
        match self.phase {
            SessionPhase::AwaitingAdmission => {
                info!(target: "meet.session", "Re-issuing join request after reconnect");
                self.start_join();
            }
            SessionPhase::LoadingMedia | SessionPhase::Active => self.start_resync(),
            // A join in flight fails or completes on its own.
            SessionPhase::Connecting | SessionPhase::Terminated => {}
        }
    }

    fn start_resync(&mut self) {
        let Some(peer_id) = self.self_id() else {
            return;
        };
        if self.resync_pending {
            return;
        }
        self.resync_pending = true;
        info!(target: "meet.session", "Fetching room snapshot");
        let signaling = self.signaling.clone();
        let room_id = self.params.room_id.clone();
        self.spawn_task(async move {
            TaskResult::Resynced(signaling.reconnect(&room_id, &peer_id).await)
        });
    }

    async fn on_resynced(&mut self, result: Result<ReconnectSnapshot, ChannelError>) {
        self.resync_pending = false;
        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.fail(err.into()).await;
                return;
            }
        };
        if !matches!(self.phase, SessionPhase::LoadingMedia | SessionPhase::Active) {
            return;
        }
        if snapshot.pending {
            warn!(target: "meet.session", "Relay reports this peer as still waiting for admission");
        }

        if let Some(peer_id) = snapshot.peer_id {
            self.room.set_self_id(peer_id);
        }
        self.apply_membership(snapshot.users);

        let producers: Vec<RemoteProducer> = snapshot
            .producers
            .into_iter()
            .map(RemoteProducer::from)
            .collect();
        let known: HashSet<String> = producers.iter().map(|p| p.producer_id.clone()).collect();
        self.room.replace_producers(producers);

        if let Some(messages) = snapshot.messages {
            self.chat
                .replace(messages.into_iter().map(ChatMessage::from).collect());
        }
        self.consumers.clear_failures();

        let lost: Vec<String> = self
            .producers
            .live_ids()
            .into_iter()
            .filter(|id| !known.contains(id))
            .collect();
        info!(
            target: "meet.session",
            peers = self.room.peers().count(),
            producers = known.len(),
            lost_producers = lost.len(),
            "Room state resynchronized"
        );

        if lost.is_empty() {
            self.reconcile_consumers();
        } else {
            self.rebuild_media();
        }
        self.notify(SessionNotice::Resynchronized);
    }

    /// Drop the current media generation and build a new one from scratch,
    /// re-producing the local camera and microphone tracks.
    fn rebuild_media(&mut self) {
        warn!(target: "meet.session", "Local producers lost on the relay, rebuilding media");
        self.epoch += 1;
        self.media_cancel.cancel();
        self.media_cancel = self.cancel_token.child_token();

        let restaged = self.producers.detach_for_resync();
        self.screen_capture_pending = false;
        let consumers = self.consumers.close_all();
        let transports = self.transports.close_all();
        self.quality.send_replace(None);
        debug!(target: "meet.session", ?restaged, consumers, transports, "Media generation released");

        self.withdraw_screen_share(None);
        self.set_phase(SessionPhase::LoadingMedia);
        self.start_media_load();
    }

    // ----- dispatch -----------------------------------------------------

    async fn handle_command(&mut self, command: SessionCommand) {
        if self.phase == SessionPhase::Terminated {
            return;
        }
        match command {
            SessionCommand::Admit {
                peer_id,
                respond_to,
            } => self.admit(peer_id, respond_to),
            SessionCommand::ListPending { respond_to } => {
                let _ = respond_to.send(self.admission.list_pending());
            }
            SessionCommand::RemoteStream {
                producer_id,
                respond_to,
            } => {
                let stream = self
                    .consumers
                    .get(&producer_id)
                    .map(|consumer| consumer.stream.clone());
                let _ = respond_to.send(stream);
            }
            SessionCommand::Produce {
                kind,
                track,
                respond_to,
            } => self.produce(kind, track, respond_to),
            SessionCommand::CloseProducer { kind, respond_to } => {
                let closed = self.producers.close(kind);
                if closed && kind == MediaKind::Screen {
                    self.withdraw_screen_share(None);
                }
                let _ = respond_to.send(closed);
            }
            SessionCommand::SetMediaEnabled {
                kind,
                enabled,
                respond_to,
            } => self.set_media_enabled(kind, enabled, respond_to),
            SessionCommand::StartScreenShare { respond_to } => self.start_screen_share(respond_to),
            SessionCommand::StopScreenShare { respond_to } => {
                self.producers.close(MediaKind::Screen);
                self.withdraw_screen_share(Some(respond_to));
            }
            SessionCommand::SetHandRaised { raised, respond_to } => {
                self.set_hand_raised(raised, respond_to)
            }
            SessionCommand::SetDisplayName { name, respond_to } => {
                self.set_display_name(name, respond_to)
            }
            SessionCommand::SendChat { text, respond_to } => {
                let text = match chat::prepare(&text) {
                    Ok(text) => text,
                    Err(err) => {
                        let _ = respond_to.send(Err(err));
                        return;
                    }
                };
                let signaling = self.signaling.clone();
                let room_id = self.params.room_id.clone();
                self.spawn_task(async move {
                    let result = chat::send(&signaling, &room_id, &text).await;
                    TaskResult::ChatSent { result, respond_to }
                });
            }
            SessionCommand::RestartIce {
                direction,
                respond_to,
            } => {
                let Some(transport) = self.transports.get(direction).cloned() else {
                    let _ = respond_to.send(Err(TransportError::NotReady(direction).into()));
                    return;
                };
                info!(target: "meet.transport", %direction, id = transport.id(), "Restarting ICE");
                let signaling = self.signaling.clone();
                self.spawn_task(async move {
                    let result = transport::restart_ice(signaling, transport).await;
                    TaskResult::IceRestarted { result, respond_to }
                });
            }
            SessionCommand::Leave { respond_to } => {
                info!(target: "meet.session", "Leaving room");
                self.teardown(SessionStatus::Left).await;
                let _ = respond_to.send(());
            }
        }
    }

    async fn handle_task(&mut self, result: TaskResult) {
        match result {
            TaskResult::Joined(result) => self.on_joined(result).await,
            TaskResult::DeviceLoaded(Ok(())) => {
                debug!(target: "meet.transport", "Media engine loaded");
                self.create_transports();
            }
            TaskResult::DeviceLoaded(Err(err)) => self.fail(err.into()).await,
            TaskResult::MediaAcquired(result) => self.on_media_acquired(result),
            TaskResult::TransportCreated { direction, result } => {
                self.on_transport_created(direction, result).await
            }
            TaskResult::TransportState(change) => {
                if let Some(err) = self.transports.on_state_change(&change) {
                    self.fail(err.into()).await;
                }
            }
            TaskResult::Produced {
                kind,
                result,
                respond_to,
            } => self.on_produced(kind, result, respond_to),
            TaskResult::ScreenCaptured { result, respond_to } => {
                self.on_screen_captured(result, respond_to)
            }
            TaskResult::ScreenShareAnnounced {
                producer_id,
                result,
                respond_to,
            } => self.on_screen_share_announced(producer_id, result, respond_to),
            TaskResult::ScreenTrackEnded { producer_id } => self.on_screen_track_ended(producer_id),
            TaskResult::Consumed {
                producer_id,
                peer_id,
                kind,
                result,
            } => self.on_consumed(producer_id, peer_id, kind, result),
            TaskResult::ConsumerResumed {
                producer_id,
                consumer_id,
                result,
            } => self.on_consumer_resumed(producer_id, consumer_id, result),
            TaskResult::Toggled {
                toggle,
                result,
                respond_to,
            } => self.on_toggled(toggle, result, respond_to),
            TaskResult::AdmitDone {
                peer_id,
                result,
                respond_to,
            } => self.on_admit_done(peer_id, result, respond_to),
            TaskResult::ChatSent { result, respond_to } => {
                if let Err(err) = &result {
                    warn!(target: "meet.session", error = %err, "Chat message not delivered");
                    self.notify(SessionNotice::ChatFailed {
                        reason: err.to_string(),
                    });
                }
                let _ = respond_to.send(result);
            }
            TaskResult::IceRestarted { result, respond_to } => {
                if let Err(err) = &result {
                    warn!(target: "meet.transport", error = %err, "ICE restart failed");
                }
                let _ = respond_to.send(result.map_err(Error::from));
            }
            TaskResult::Resynced(result) => self.on_resynced(result).await,
        }
    }

    async fn handle_channel_event(&mut self, event: Result<ChannelEvent, RecvError>) {
        match event {
            Ok(ChannelEvent::Notification(notification)) => {
                self.handle_notification(notification).await
            }
            Ok(ChannelEvent::Disconnected { reason }) => {
                warn!(target: "meet.session", %reason, "Signaling disconnected, waiting for reconnect");
                self.notify(SessionNotice::Reconnecting);
            }
            Ok(ChannelEvent::Reconnected) => {
                info!(target: "meet.session", "Signaling reconnected");
                self.on_reconnected();
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(target: "meet.session", skipped, "Missed signaling events, resynchronizing");
                self.on_reconnected();
            }
            Err(RecvError::Closed) => self.fail(ChannelError::ChannelLost.into()).await,
        }
    }

    async fn handle_notification(&mut self, notification: Notification) {
        match notification {
            Notification::NewProducer(info) => {
                let producer = RemoteProducer::from(info);
                debug!(
                    target: "meet.consumer",
                    producer_id = %producer.producer_id,
                    peer_id = %producer.peer_id,
                    kind = %producer.kind,
                    "New producer announced"
                );
                if self.room.add_producer(producer) {
                    self.reconcile_consumers();
                }
            }
            Notification::ProducerList(list) => {
                self.room
                    .replace_producers(list.into_iter().map(RemoteProducer::from).collect());
                self.reconcile_consumers();
            }
            Notification::PeerJoined(PeerJoinedEvent {
                peer_id,
                peer_details,
                users,
            }) => {
                info!(target: "meet.session", %peer_id, "Peer joined");
                if !users.is_empty() {
                    self.apply_membership(users);
                } else if let Some(details) = peer_details {
                    self.room.upsert_peer(details);
                    if self.room.is_admitted(&peer_id) {
                        self.admission.reconcile_members([peer_id.as_str()]);
                    }
                }
                self.reconcile_consumers();
            }
            Notification::PeerClosed(event) => self.on_peer_closed(&event.peer_id),
            Notification::ParticipantsUpdated(event) => {
                self.apply_membership(event.users);
                self.reconcile_consumers();
            }
            Notification::PeerMediaToggle(event) => self.apply_peer_update(
                &event.peer_id,
                PeerUpdate::MediaToggled {
                    kind: event.kind,
                    enabled: event.enabled,
                },
            ),
            Notification::ScreenshareToggle(event) => {
                self.apply_peer_update(&event.peer_id, PeerUpdate::ScreenShareToggled(event.enabled))
            }
            Notification::HandraiseToggle(event) => {
                self.apply_peer_update(&event.peer_id, PeerUpdate::HandRaiseToggled(event.enabled))
            }
            Notification::PeerPropertiesUpdated(event) => {
                match PeerProperty::parse(&event.property, &event.value) {
                    Some(property) => {
                        self.apply_peer_update(&event.peer_id, PeerUpdate::PropertyUpdated(property))
                    }
                    None => debug!(
                        target: "meet.session",
                        peer_id = %event.peer_id,
                        property = %event.property,
                        "Ignoring unknown peer property"
                    ),
                }
            }
            Notification::NewMessage(message) => self.chat.push(message.into()),
            Notification::ConsumerClosed(event) => {
                if let Some(producer_id) = self.consumers.remove_by_consumer_id(&event.consumer_id) {
                    debug!(target: "meet.consumer", %producer_id, "Consumer closed by relay");
                    self.room.remove_producer(&producer_id);
                }
            }
            Notification::JoinRequest(event) => {
                if self
                    .admission
                    .add_request(event.peer_id.clone(), event.name.clone())
                {
                    self.notify(SessionNotice::JoinRequest {
                        peer_id: event.peer_id,
                        name: event.name,
                    });
                }
            }
            Notification::Admitted(event) => {
                if let Some(capabilities) = event.rtp_capabilities {
                    self.router_capabilities = Some(capabilities);
                }
                if self.admission.mark_admitted() && self.phase == SessionPhase::AwaitingAdmission {
                    self.enter_admitted();
                }
            }
            Notification::Rejected(event) => {
                self.admission.mark_denied();
                let reason = event
                    .reason
                    .unwrap_or_else(|| "join request denied".to_string());
                self.fail(AdmissionError::Denied(reason).into()).await;
            }
            Notification::RouterCapabilities(capabilities) => {
                self.router_capabilities = Some(capabilities);
            }
            Notification::RoomClosed(event) => {
                let reason = event.reason.unwrap_or_else(|| "closed by host".to_string());
                self.fail(Error::RoomClosed(reason)).await;
            }
        }
    }

    // ----- termination --------------------------------------------------

    async fn fail(&mut self, err: Error) {
        error!(target: "meet.session", error = %err, "Session failed");
        let reason = err.user_reason();
        self.last_error = Some(reason.clone());
        self.teardown(SessionStatus::Error(reason)).await;
    }

    /// Release every owned resource exactly once: tracks, producers,
    /// consumers, transports, then the signaling channel.
    async fn teardown(&mut self, status: SessionStatus) {
        if self.phase == SessionPhase::Terminated {
            return;
        }
        self.set_phase(SessionPhase::Terminated);
        if status == SessionStatus::Left {
            self.admission.mark_abandoned();
        }
        self.final_status = Some(status);
        self.epoch += 1;
        self.media_cancel.cancel();

        let tracks = self.producers.stop_all_tracks();
        let producers = self.producers.close_all();
        let consumers = self.consumers.close_all();
        let transports = self.transports.close_all();
        self.signaling.close().await;
        self.quality.send_replace(None);

        info!(
            target: "meet.session",
            tracks,
            producers,
            consumers,
            transports,
            "Session resources released"
        );
    }
}

fn reply<T>(respond_to: Option<Reply<T>>, result: Result<T, Error>) {
    if let Some(tx) = respond_to {
        let _ = tx.send(result);
    }
}
