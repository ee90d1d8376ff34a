//! In-memory relay, media engine and capture devices for session tests.
//!
//! Every fake writes into a shared [`Journal`] when it releases something,
//! so tests can assert both that resources were released and in which order.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt};
use serde_json::{json, Value};
use tokio::sync::{broadcast, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use meet_client::connection::TransportConnectionState;
use meet_client::error::{ChannelError, MediaAcquisitionError, NegotiationError, TransportError};
use meet_client::media::{LocalMedia, MediaConstraints, MediaDevices, MediaTrack, TrackKind, TrackRef};
use meet_client::media_engine::{
    ConsumerParams, ConsumerRef, EngineConsumer, EngineProducer, EngineTransport, MediaEngine,
    ProduceOptions, ProducerRef, TransportDirection, TransportHandler, TransportOptions,
    TransportRef, TransportStats,
};
use meet_client::protocol::{ChannelEvent, Notification};
use meet_client::signaling::{RelayLink, RequestPolicy};
use meet_client::{
    ClientConfig, MediaStack, SessionActor, SessionHandle, SessionParams, SessionSnapshot,
    SignalingChannel,
};

pub const SELF_ID: &str = "self";
pub const ROOM_ID: &str = "room-1";

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Journal
// ============================================================================

/// Ordered record of release calls across all fakes.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Index of the first entry starting with `prefix`.
    pub fn first(&self, prefix: &str) -> Option<usize> {
        self.entries().iter().position(|e| e.starts_with(prefix))
    }

    /// Index of the last entry starting with `prefix`.
    pub fn last(&self, prefix: &str) -> Option<usize> {
        self.entries().iter().rposition(|e| e.starts_with(prefix))
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.entries().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

// ============================================================================
// Relay
// ============================================================================

type Handler = Box<dyn Fn(&Value) -> Result<Value, ChannelError> + Send + Sync>;

/// Scripted relay. Unscripted events get a successful canned response.
pub struct FakeRelay {
    handlers: Mutex<HashMap<String, Handler>>,
    holds: Mutex<HashMap<String, Arc<Semaphore>>>,
    calls: Mutex<Vec<(String, Value)>>,
    events: broadcast::Sender<ChannelEvent>,
    next_id: AtomicU64,
    journal: Journal,
}

impl FakeRelay {
    pub fn new(journal: Journal) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            handlers: Mutex::new(HashMap::new()),
            holds: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            events,
            next_id: AtomicU64::new(1),
            journal,
        })
    }

    /// Script the response to `event`.
    pub fn on<F>(&self, event: &str, handler: F)
    where
        F: Fn(&Value) -> Result<Value, ChannelError> + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .unwrap()
            .insert(event.to_string(), Box::new(handler));
    }

    /// Reply to `event` with a fixed payload.
    pub fn reply(&self, event: &str, payload: Value) {
        self.on(event, move |_| Ok(payload.clone()));
    }

    /// Park every `event` request until [`FakeRelay::release`].
    pub fn hold(&self, event: &str) {
        self.holds
            .lock()
            .unwrap()
            .insert(event.to_string(), Arc::new(Semaphore::new(0)));
    }

    pub fn release(&self, event: &str) {
        if let Some(gate) = self.holds.lock().unwrap().remove(event) {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    /// Push a server notification to subscribers.
    pub fn notify(&self, event: &str, data: Value) {
        let notification = Notification::from_parts(event, data)
            .expect("notification decodes")
            .expect("known notification");
        let _ = self.events.send(ChannelEvent::Notification(notification));
    }

    pub fn drop_connection(&self) {
        let _ = self.events.send(ChannelEvent::Disconnected {
            reason: "test".to_string(),
        });
    }

    pub fn restore_connection(&self) {
        let _ = self.events.send(ChannelEvent::Reconnected);
    }

    pub fn calls(&self, event: &str) -> Vec<Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == event)
            .map(|(_, data)| data.clone())
            .collect()
    }

    pub fn count(&self, event: &str) -> usize {
        self.calls(event).len()
    }

    /// Event names in the order they were issued.
    pub fn call_order(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn canned(&self, event: &str, data: &Value) -> Result<Value, ChannelError> {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = match event {
            "createRoom" => json!({
                "success": true,
                "peerId": SELF_ID,
                "isAdmin": true,
                "users": [{ "id": SELF_ID, "name": "Me", "isAdmin": true }],
            }),
            "joinRoom" => json!({
                "success": true,
                "peerId": SELF_ID,
                "users": [{ "id": "host", "name": "Host", "isAdmin": true }],
            }),
            "getRouterRtpCapabilities" => json!({ "success": true, "rtpCapabilities": { "codecs": [] } }),
            "createWebRtcTransport" => {
                let direction = data["direction"].as_str().unwrap_or("unknown");
                json!({
                    "success": true,
                    "params": {
                        "id": format!("t-{direction}-{n}"),
                        "iceParameters": {},
                        "iceCandidates": [],
                        "dtlsParameters": {},
                    },
                })
            }
            "produce" => json!({ "success": true, "producerId": format!("pr-{n}") }),
            "consume" => {
                let producer_id = data["producerId"].as_str().unwrap_or_default();
                json!({
                    "success": true,
                    "params": {
                        "id": format!("c-{producer_id}"),
                        "producerId": producer_id,
                        "kind": "video",
                        "rtpParameters": {},
                    },
                })
            }
            "reconnect" => json!({ "success": true, "users": [], "producers": [] }),
            "restartIce" => json!({ "success": true, "iceParameters": { "usernameFragment": "fresh" } }),
            _ => json!({ "success": true }),
        };
        Ok(payload)
    }
}

#[async_trait]
impl RelayLink for FakeRelay {
    async fn request(&self, event: &str, data: Value) -> Result<Value, ChannelError> {
        self.calls
            .lock()
            .unwrap()
            .push((event.to_string(), data.clone()));

        let gate = self.holds.lock().unwrap().get(event).cloned();
        if let Some(gate) = gate {
            gate.acquire().await.map_err(|_| ChannelError::ChannelLost)?.forget();
        }

        let handlers = self.handlers.lock().unwrap();
        match handlers.get(event) {
            Some(handler) => handler(&data),
            None => self.canned(event, &data),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    async fn disconnect(&self) {
        self.journal.record("relay.disconnect");
    }
}

// ============================================================================
// Tracks and devices
// ============================================================================

#[derive(Debug)]
pub struct FakeTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
    ended: watch::Sender<bool>,
    journal: Journal,
}

impl FakeTrack {
    pub fn new(id: &str, kind: TrackKind, journal: &Journal) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            ended: watch::channel(false).0,
            journal: journal.clone(),
        })
    }

    /// The source goes away, as when the user stops sharing from the
    /// system picker.
    pub fn end(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.journal.record(format!("track.ended:{}", self.id));
        }
        self.ended.send_replace(true);
    }
}

impl MediaTrack for FakeTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.journal.record(format!("track.stop:{}", self.id));
        }
        self.ended.send_replace(true);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn ended(&self) -> Option<BoxFuture<'static, ()>> {
        let mut ended = self.ended.subscribe();
        Some(
            async move {
                loop {
                    let done = *ended.borrow_and_update();
                    if done || ended.changed().await.is_err() {
                        break;
                    }
                }
            }
            .boxed(),
        )
    }
}

/// Camera, microphone and display capture.
pub struct FakeDevices {
    journal: Journal,
    failure: Mutex<Option<MediaAcquisitionError>>,
    user_gate: Mutex<Option<Arc<Semaphore>>>,
    display_gate: Mutex<Option<Arc<Semaphore>>>,
    tracks: Mutex<Vec<Arc<FakeTrack>>>,
    user_media_calls: AtomicUsize,
    display_calls: AtomicUsize,
    requested: Mutex<Vec<MediaConstraints>>,
}

impl FakeDevices {
    pub fn new(journal: Journal) -> Arc<Self> {
        Arc::new(Self {
            journal,
            failure: Mutex::new(None),
            user_gate: Mutex::new(None),
            display_gate: Mutex::new(None),
            tracks: Mutex::new(Vec::new()),
            user_media_calls: AtomicUsize::new(0),
            display_calls: AtomicUsize::new(0),
            requested: Mutex::new(Vec::new()),
        })
    }

    pub fn fail_with(&self, error: MediaAcquisitionError) {
        *self.failure.lock().unwrap() = Some(error);
    }

    pub fn hold_user_media(&self) {
        *self.user_gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_user_media(&self) {
        if let Some(gate) = self.user_gate.lock().unwrap().take() {
            gate.add_permits(16);
        }
    }

    pub fn hold_display(&self) {
        *self.display_gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_display(&self) {
        if let Some(gate) = self.display_gate.lock().unwrap().take() {
            gate.add_permits(16);
        }
    }

    pub fn user_media_calls(&self) -> usize {
        self.user_media_calls.load(Ordering::SeqCst)
    }

    /// Constraints of every camera/microphone acquisition, in call order.
    pub fn requested(&self) -> Vec<MediaConstraints> {
        self.requested.lock().unwrap().clone()
    }

    pub fn display_calls(&self) -> usize {
        self.display_calls.load(Ordering::SeqCst)
    }

    /// Every track handed out so far.
    pub fn tracks(&self) -> Vec<Arc<FakeTrack>> {
        self.tracks.lock().unwrap().clone()
    }

    pub fn track(&self, prefix: &str) -> Option<Arc<FakeTrack>> {
        self.tracks().into_iter().find(|t| t.id.starts_with(prefix))
    }

    fn make_track(&self, id: &str, kind: TrackKind) -> Arc<FakeTrack> {
        let track = FakeTrack::new(id, kind, &self.journal);
        self.tracks.lock().unwrap().push(track.clone());
        track
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalMedia, MediaAcquisitionError> {
        self.user_media_calls.fetch_add(1, Ordering::SeqCst);
        self.requested.lock().unwrap().push(constraints.clone());
        let gate = self.user_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        if let Some(error) = self.failure.lock().unwrap().clone() {
            return Err(error);
        }

        let mut media = LocalMedia::default();
        if constraints.audio {
            let track: TrackRef = self.make_track("local-audio", TrackKind::Audio);
            media.audio = Some(track);
        }
        if constraints.video {
            let track: TrackRef = self.make_track("local-video", TrackKind::Video);
            media.video = Some(track);
        }
        Ok(media)
    }

    async fn display_media(&self) -> Result<TrackRef, MediaAcquisitionError> {
        let n = self.display_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.display_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        let track: TrackRef = self.make_track(&format!("local-screen-{n}"), TrackKind::Video);
        Ok(track)
    }
}

// ============================================================================
// Engine
// ============================================================================

#[derive(Debug)]
pub struct FakeProducer {
    id: String,
    paused: AtomicBool,
    closed: AtomicBool,
    journal: Journal,
}

impl EngineProducer for FakeProducer {
    fn id(&self) -> &str {
        &self.id
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.journal.record(format!("producer.close:{}", self.id));
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct FakeConsumer {
    id: String,
    producer_id: String,
    track: Arc<FakeTrack>,
    closed: AtomicBool,
    journal: Journal,
}

impl EngineConsumer for FakeConsumer {
    fn id(&self) -> &str {
        &self.id
    }

    fn producer_id(&self) -> &str {
        &self.producer_id
    }

    fn track(&self) -> TrackRef {
        self.track.clone()
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.journal.record(format!("consumer.close:{}", self.id));
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct FakeTransport {
    id: String,
    direction: TransportDirection,
    handler: Arc<dyn TransportHandler>,
    connected: tokio::sync::Mutex<bool>,
    state: watch::Sender<TransportConnectionState>,
    closed: AtomicBool,
    producers: Mutex<Vec<Arc<FakeProducer>>>,
    consumers: Mutex<Vec<Arc<FakeConsumer>>>,
    ice_restarts: AtomicUsize,
    journal: Journal,
}

impl std::fmt::Debug for FakeTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeTransport")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .finish()
    }
}

impl FakeTransport {
    /// Drive the transport's connection state, as ICE/DTLS would.
    pub fn set_state(&self, state: TransportConnectionState) {
        self.state.send_replace(state);
    }

    pub fn ice_restarts(&self) -> usize {
        self.ice_restarts.load(Ordering::SeqCst)
    }

    pub fn open_producers(&self) -> usize {
        self.producers
            .lock()
            .unwrap()
            .iter()
            .filter(|p| !p.is_closed())
            .count()
    }

    pub fn open_consumers(&self) -> usize {
        self.consumers
            .lock()
            .unwrap()
            .iter()
            .filter(|c| !c.is_closed())
            .count()
    }

    pub fn consumer_tracks(&self) -> Vec<Arc<FakeTrack>> {
        self.consumers
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.track.clone())
            .collect()
    }

    /// `connect` fires once, before the first producer or consumer.
    async fn ensure_connected(&self) -> Result<(), NegotiationError> {
        let mut connected = self.connected.lock().await;
        if !*connected {
            self.handler
                .connect(&self.id, json!({ "role": "client", "fingerprints": [] }))
                .await?;
            *connected = true;
            self.state.send_replace(TransportConnectionState::Connected);
        }
        Ok(())
    }
}

#[async_trait]
impl EngineTransport for FakeTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn direction(&self) -> TransportDirection {
        self.direction
    }

    fn connection_state(&self) -> watch::Receiver<TransportConnectionState> {
        self.state.subscribe()
    }

    async fn produce(
        &self,
        track: TrackRef,
        options: ProduceOptions,
    ) -> Result<ProducerRef, NegotiationError> {
        if self.is_closed() {
            return Err(NegotiationError::TransportClosed);
        }
        self.ensure_connected().await?;
        let rtp_parameters = json!({ "encodings": options.encodings.len() });
        let id = self
            .handler
            .produce(&self.id, track.kind(), rtp_parameters, options.app_data)
            .await?;
        let producer = Arc::new(FakeProducer {
            id,
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            journal: self.journal.clone(),
        });
        self.producers.lock().unwrap().push(producer.clone());
        Ok(producer)
    }

    async fn consume(&self, params: ConsumerParams) -> Result<ConsumerRef, NegotiationError> {
        if self.is_closed() {
            return Err(NegotiationError::TransportClosed);
        }
        self.ensure_connected().await?;
        let track = FakeTrack::new(
            &format!("remote-{}", params.producer_id),
            params.kind,
            &self.journal,
        );
        let consumer = Arc::new(FakeConsumer {
            id: params.id,
            producer_id: params.producer_id,
            track,
            closed: AtomicBool::new(false),
            journal: self.journal.clone(),
        });
        self.consumers.lock().unwrap().push(consumer.clone());
        Ok(consumer)
    }

    async fn restart_ice(&self, _ice_parameters: Value) -> Result<(), NegotiationError> {
        self.ice_restarts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stats(&self) -> Result<TransportStats, NegotiationError> {
        Ok(TransportStats {
            bytes_sent: 10_000,
            packets_sent: 100,
            round_trip_time_ms: Some(40.0),
            jitter_ms: Some(5.0),
            ..Default::default()
        })
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.journal.record(format!("transport.close:{}", self.id));
            self.state.send_replace(TransportConnectionState::Closed);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct FakeEngine {
    loaded: AtomicBool,
    load_calls: AtomicUsize,
    transports: Mutex<Vec<Arc<FakeTransport>>>,
    journal: Journal,
}

impl FakeEngine {
    pub fn new(journal: Journal) -> Arc<Self> {
        Arc::new(Self {
            loaded: AtomicBool::new(false),
            load_calls: AtomicUsize::new(0),
            transports: Mutex::new(Vec::new()),
            journal,
        })
    }

    pub fn load_calls(&self) -> usize {
        self.load_calls.load(Ordering::SeqCst)
    }

    pub fn transports(&self) -> Vec<Arc<FakeTransport>> {
        self.transports.lock().unwrap().clone()
    }

    /// Most recent transport in `direction`.
    pub fn transport(&self, direction: TransportDirection) -> Option<Arc<FakeTransport>> {
        self.transports()
            .into_iter()
            .rev()
            .find(|t| t.direction == direction)
    }

    pub fn created_transports(&self) -> usize {
        self.transports.lock().unwrap().len()
    }

    pub fn open_transports(&self) -> usize {
        self.transports().iter().filter(|t| !t.is_closed()).count()
    }

    pub fn open_producers(&self) -> usize {
        self.transports().iter().map(|t| t.open_producers()).sum()
    }

    pub fn open_consumers(&self) -> usize {
        self.transports().iter().map(|t| t.open_consumers()).sum()
    }
}

#[async_trait]
impl MediaEngine for FakeEngine {
    fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    async fn load(&self, _router_rtp_capabilities: Value) -> Result<(), NegotiationError> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        self.loaded.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn rtp_capabilities(&self) -> Option<Value> {
        self.is_loaded().then(|| json!({ "codecs": [] }))
    }

    fn create_transport(
        &self,
        direction: TransportDirection,
        options: TransportOptions,
        handler: Arc<dyn TransportHandler>,
    ) -> Result<TransportRef, TransportError> {
        let (state, _) = watch::channel(TransportConnectionState::New);
        let transport = Arc::new(FakeTransport {
            id: options.params.id,
            direction,
            handler,
            connected: tokio::sync::Mutex::new(false),
            state,
            closed: AtomicBool::new(false),
            producers: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
            ice_restarts: AtomicUsize::new(0),
            journal: self.journal.clone(),
        });
        self.transports.lock().unwrap().push(transport.clone());
        Ok(transport)
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Fakes {
    pub journal: Journal,
    pub relay: Arc<FakeRelay>,
    pub engine: Arc<FakeEngine>,
    pub devices: Arc<FakeDevices>,
}

impl Default for Fakes {
    fn default() -> Self {
        Self::new()
    }
}

impl Fakes {
    pub fn new() -> Self {
        let journal = Journal::default();
        Self {
            relay: FakeRelay::new(journal.clone()),
            engine: FakeEngine::new(journal.clone()),
            devices: FakeDevices::new(journal.clone()),
            journal,
        }
    }

    pub fn media_stack(&self) -> MediaStack {
        MediaStack {
            engine: self.engine.clone(),
            devices: self.devices.clone(),
        }
    }

    /// Start a session with camera and microphone.
    pub fn start(&self, create: bool) -> (SessionHandle, JoinHandle<()>) {
        self.start_with(create, test_config(), Some(self.media_stack()))
    }

    /// Start a session that acquires no local media on its own.
    pub fn start_without_local_media(&self, create: bool) -> (SessionHandle, JoinHandle<()>) {
        let mut config = test_config();
        config.media = MediaConstraints {
            audio: false,
            video: false,
            ..Default::default()
        };
        self.start_with(create, config, Some(self.media_stack()))
    }

    pub fn start_chat_only(&self, create: bool) -> (SessionHandle, JoinHandle<()>) {
        self.start_with(create, test_config(), None)
    }

    pub fn start_with(
        &self,
        create: bool,
        config: ClientConfig,
        media: Option<MediaStack>,
    ) -> (SessionHandle, JoinHandle<()>) {
        let signaling = SignalingChannel::new(self.relay.clone(), config.request_policy());
        SessionActor::spawn(
            SessionParams {
                room_id: ROOM_ID.to_string(),
                display_name: "Me".to_string(),
                create,
            },
            config,
            signaling,
            media,
            CancellationToken::new(),
        )
    }
}

pub fn test_config() -> ClientConfig {
    ClientConfig {
        request_timeout: Duration::from_secs(30),
        request_retries: 0,
        stats_interval: None,
        ..Default::default()
    }
}

pub fn request_policy() -> RequestPolicy {
    test_config().request_policy()
}

/// Peer entry as the relay lists it in `users`.
pub fn user(id: &str, name: &str) -> Value {
    json!({ "id": id, "name": name })
}

pub fn producer(producer_id: &str, peer_id: &str, kind: &str) -> Value {
    json!({ "producerId": producer_id, "peerId": peer_id, "kind": kind })
}

pub async fn wait_for(
    handle: &SessionHandle,
    what: &str,
    predicate: impl FnMut(&SessionSnapshot) -> bool,
) -> SessionSnapshot {
    match tokio::time::timeout(WAIT_TIMEOUT, handle.wait_for(predicate)).await {
        Ok(Ok(snapshot)) => snapshot,
        Ok(Err(e)) => panic!("session ended while waiting for {what}: {e}; last: {:?}", handle.snapshot()),
        Err(_) => panic!("timed out waiting for {what}; last: {:?}", handle.snapshot()),
    }
}

/// Poll `condition` until it holds.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Give spawned tasks a chance to run before asserting that nothing happened.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Admin session with camera and microphone live on both transports.
pub async fn active_admin(fakes: &Fakes) -> (SessionHandle, JoinHandle<()>) {
    let (handle, task) = fakes.start(true);
    wait_for(&handle, "active with two producers", |s| {
        s.status == meet_client::SessionStatus::Active
            && s.open_transports == 2
            && s.producers.len() == 2
    })
    .await;
    (handle, task)
}

/// Bring `peer_id` into the room as an admitted member alongside the local peer.
pub fn add_member(relay: &FakeRelay, peer_id: &str, name: &str) {
    relay.notify(
        "peerJoined",
        json!({
            "peerId": peer_id,
            "peerDetails": user(peer_id, name),
        }),
    );
}
