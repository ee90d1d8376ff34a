//! Signaling channel to the relay.
//!
//! [`RelayLink`] is the raw duplex link (request correlation and notification
//! fan-out). [`SignalingChannel`] layers the request policy on top: a
//! per-attempt timeout, bounded retry of timed-out requests with linear
//! backoff, and interpretation of the relay's acknowledgement payloads.

mod ws;

pub use ws::WsRelayLink;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::ChannelError;
use crate::media::TrackKind;
use crate::media_engine::{AppData, ConsumerParams, TransportDirection, TransportParams};
use crate::protocol::{
    self, ChannelEvent, Consumed, IceRestarted, JoinResponse, Produced, ReconnectSnapshot,
    RouterCapabilitiesResponse, TransportCreated,
};
use crate::room::PeerProperty;

/// Raw request/notification link to the relay.
///
/// `request` resolves with the response payload exactly as the relay sent it.
/// Requests in flight when the link drops fail with
/// [`ChannelError::ChannelLost`]; the link reconnects on its own and announces
/// it with [`ChannelEvent::Reconnected`].
#[async_trait]
pub trait RelayLink: Send + Sync {
    async fn request(&self, event: &str, data: Value) -> Result<Value, ChannelError>;

    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent>;

    async fn disconnect(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestPolicy {
    pub timeout: Duration,
    pub retries: u32,
    pub backoff: Duration,
}

impl Default for RequestPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            retries: 3,
            backoff: Duration::from_secs(1),
        }
    }
}

impl RequestPolicy {
    fn backoff_for(&self, attempt: u32) -> Duration {
        self.backoff * (attempt + 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            jitter: 0.5,
        }
    }
}

impl ReconnectPolicy {
    /// Exponential delay for the given attempt, randomized by `jitter` and
    /// capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = 2u32.saturating_pow(attempt.min(16));
        let base = self.initial_delay.saturating_mul(exp).min(self.max_delay);
        if self.jitter <= 0.0 {
            return base;
        }
        let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        base.mul_f64(factor).min(self.max_delay)
    }
}

/// Events the relay can safely receive twice: reads, and toggles that set an
/// absolute value. Anything that creates state on the relay is never resent
/// after a timeout, since the first attempt may already have been applied.
const RETRYABLE_EVENTS: &[&str] = &[
    "getRouterRtpCapabilities",
    "resumeConsumer",
    "toggle-media",
    "toggle-screenshare",
    "toggle-handraise",
    "updatePeerProperties",
    "reconnect",
];

fn is_retryable(event: &str) -> bool {
    RETRYABLE_EVENTS.contains(&event)
}

/// Request/response channel with timeout and retry, plus typed helpers for
/// every signaling event the client issues.
#[derive(Clone)]
pub struct SignalingChannel {
    link: Arc<dyn RelayLink>,
    policy: RequestPolicy,
    closed: Arc<AtomicBool>,
}

impl SignalingChannel {
    pub fn new(link: Arc<dyn RelayLink>, policy: RequestPolicy) -> Self {
        Self {
            link,
            policy,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.link.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the channel. Every later request fails with `Closed`.
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(target: "meet.signaling", "Closing signaling channel");
            self.link.disconnect().await;
        }
    }

    /// Issue `event` and return the acknowledged payload.
    ///
    /// Only timeouts of retryable events are retried. A rejection or a lost
    /// channel is returned to the caller on the first occurrence.
    pub async fn request(&self, event: &str, data: Value) -> Result<Value, ChannelError> {
        let mut attempt = 0;
        loop {
            if self.is_closed() {
                return Err(ChannelError::Closed);
            }

            let outcome =
                match tokio::time::timeout(self.policy.timeout, self.link.request(event, data.clone()))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ChannelError::Timeout {
                        event: event.to_string(),
                    }),
                };

            match outcome {
                Ok(payload) => return protocol::check_ack(payload),
                Err(ChannelError::Timeout { .. })
                    if attempt < self.policy.retries && is_retryable(event) =>
                {
                    let delay = self.policy.backoff_for(attempt);
                    attempt += 1;
                    warn!(
                        target: "meet.signaling",
                        event,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Request timed out, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    debug!(target: "meet.signaling", event, error = %err, "Request failed");
                    return Err(err);
                }
            }
        }
    }

    async fn request_as<T: serde::de::DeserializeOwned>(
        &self,
        event: &str,
        data: Value,
    ) -> Result<T, ChannelError> {
        let payload = self.request(event, data).await?;
        protocol::decode(event, payload)
    }

    pub async fn create_room(&self, room_id: &str, name: &str) -> Result<JoinResponse, ChannelError> {
        self.request_as("createRoom", json!({ "roomId": room_id, "name": name }))
            .await
    }

    pub async fn join_room(&self, room_id: &str, name: &str) -> Result<JoinResponse, ChannelError> {
        self.request_as("joinRoom", json!({ "roomId": room_id, "name": name }))
            .await
    }

    pub async fn admit_participant(&self, room_id: &str, peer_id: &str) -> Result<(), ChannelError> {
        self.request(
            "admit-participant",
            json!({ "roomId": room_id, "peerId": peer_id }),
        )
        .await
        .map(drop)
    }

    pub async fn router_rtp_capabilities(&self, room_id: &str) -> Result<Value, ChannelError> {
        let resp: RouterCapabilitiesResponse = self
            .request_as("getRouterRtpCapabilities", json!({ "roomId": room_id }))
            .await?;
        Ok(resp.rtp_capabilities)
    }

    pub async fn create_webrtc_transport(
        &self,
        direction: TransportDirection,
    ) -> Result<TransportParams, ChannelError> {
        let resp: TransportCreated = self
            .request_as("createWebRtcTransport", json!({ "direction": direction }))
            .await?;
        Ok(resp.params)
    }

    pub async fn connect_transport(
        &self,
        transport_id: &str,
        dtls_parameters: Value,
    ) -> Result<(), ChannelError> {
        self.request(
            "connectTransport",
            json!({ "transportId": transport_id, "dtlsParameters": dtls_parameters }),
        )
        .await
        .map(drop)
    }

    pub async fn produce(
        &self,
        transport_id: &str,
        kind: TrackKind,
        rtp_parameters: Value,
        app_data: AppData,
    ) -> Result<String, ChannelError> {
        let resp: Produced = self
            .request_as(
                "produce",
                json!({
                    "transportId": transport_id,
                    "kind": kind,
                    "rtpParameters": rtp_parameters,
                    "appData": app_data,
                }),
            )
            .await?;
        Ok(resp.producer_id)
    }

    pub async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: Value,
    ) -> Result<ConsumerParams, ChannelError> {
        let resp: Consumed = self
            .request_as(
                "consume",
                json!({
                    "transportId": transport_id,
                    "producerId": producer_id,
                    "rtpCapabilities": rtp_capabilities,
                }),
            )
            .await?;
        Ok(resp.params)
    }

    pub async fn resume_consumer(&self, consumer_id: &str) -> Result<(), ChannelError> {
        self.request("resumeConsumer", json!({ "consumerId": consumer_id }))
            .await
            .map(drop)
    }

    pub async fn toggle_media(
        &self,
        room_id: &str,
        kind: TrackKind,
        enabled: bool,
    ) -> Result<(), ChannelError> {
        self.request(
            "toggle-media",
            json!({ "roomId": room_id, "type": kind, "enabled": enabled }),
        )
        .await
        .map(drop)
    }

    pub async fn toggle_screenshare(&self, room_id: &str, enabled: bool) -> Result<(), ChannelError> {
        self.request(
            "toggle-screenshare",
            json!({ "roomId": room_id, "enabled": enabled }),
        )
        .await
        .map(drop)
    }

    pub async fn toggle_handraise(&self, room_id: &str, enabled: bool) -> Result<(), ChannelError> {
        self.request(
            "toggle-handraise",
            json!({ "roomId": room_id, "enabled": enabled }),
        )
        .await
        .map(drop)
    }

    /// Set one of our own peer properties; the relay rebroadcasts it as
    /// `peerPropertiesUpdated`.
    pub async fn update_peer_properties(
        &self,
        room_id: &str,
        property: &PeerProperty,
    ) -> Result<(), ChannelError> {
        let (name, value) = property.to_wire();
        self.request(
            "updatePeerProperties",
            json!({ "roomId": room_id, "property": name, "value": value }),
        )
        .await
        .map(drop)
    }

    pub async fn send_message(&self, room_id: &str, message: &str) -> Result<(), ChannelError> {
        self.request(
            "send-message",
            json!({ "roomId": room_id, "message": message }),
        )
        .await
        .map(drop)
    }

    pub async fn reconnect(
        &self,
        room_id: &str,
        peer_id: &str,
    ) -> Result<ReconnectSnapshot, ChannelError> {
        self.request_as("reconnect", json!({ "roomId": room_id, "peerId": peer_id }))
            .await
    }

    /// Returns the transport's fresh ICE parameters.
    pub async fn restart_ice(&self, transport_id: &str) -> Result<Value, ChannelError> {
        let resp: IceRestarted = self
            .request_as("restartIce", json!({ "transportId": transport_id }))
            .await?;
        Ok(resp.ice_parameters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    enum Step {
        Hang,
        Reply(Value),
        Fail(ChannelError),
    }

    struct ScriptedLink {
        steps: Mutex<VecDeque<Step>>,
        calls: Mutex<Vec<String>>,
        events: broadcast::Sender<ChannelEvent>,
    }

    impl ScriptedLink {
        fn new(steps: Vec<Step>) -> Arc<Self> {
            let (events, _) = broadcast::channel(8);
            Arc::new(Self {
                steps: Mutex::new(steps.into()),
                calls: Mutex::new(Vec::new()),
                events,
            })
        }

        fn calls(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl RelayLink for ScriptedLink {
        async fn request(&self, event: &str, _data: Value) -> Result<Value, ChannelError> {
            self.calls.lock().unwrap().push(event.to_string());
            let step = self.steps.lock().unwrap().pop_front();
            match step {
                Some(Step::Reply(v)) => Ok(v),
                Some(Step::Fail(e)) => Err(e),
                Some(Step::Hang) | None => std::future::pending().await,
            }
        }

        fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
            self.events.subscribe()
        }

        async fn disconnect(&self) {}
    }

    fn policy(retries: u32) -> RequestPolicy {
        RequestPolicy {
            timeout: Duration::from_millis(100),
            retries,
            backoff: Duration::from_millis(50),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retried_then_succeeds() {
        let link = ScriptedLink::new(vec![
            Step::Hang,
            Step::Hang,
            Step::Reply(json!({ "success": true })),
        ]);
        let channel = SignalingChannel::new(link.clone(), policy(3));

        channel.resume_consumer("c1").await.unwrap();
        assert_eq!(link.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_are_bounded() {
        let link = ScriptedLink::new(vec![]);
        let channel = SignalingChannel::new(link.clone(), policy(2));

        let err = channel.toggle_handraise("abc12", true).await.unwrap_err();
        assert_eq!(
            err,
            ChannelError::Timeout {
                event: "toggle-handraise".into()
            }
        );
        assert_eq!(link.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_creations_are_not_resent() {
        let link = ScriptedLink::new(vec![Step::Hang, Step::Hang, Step::Hang]);
        let channel = SignalingChannel::new(link.clone(), policy(3));

        let err = channel
            .produce("t1", TrackKind::Video, json!({}), AppData { media_type: crate::media::MediaKind::Video })
            .await
            .unwrap_err();
        assert_eq!(err, ChannelError::Timeout { event: "produce".into() });
        assert_eq!(link.calls(), 1);

        let err = channel.send_message("abc12", "hi").await.unwrap_err();
        assert_eq!(err, ChannelError::Timeout { event: "send-message".into() });
        assert_eq!(link.calls(), 2);

        assert!(is_retryable("getRouterRtpCapabilities"));
        assert!(!is_retryable("createWebRtcTransport"));
        assert!(!is_retryable("joinRoom"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_and_loss_are_not_retried() {
        let link = ScriptedLink::new(vec![
            Step::Reply(json!({ "success": false, "error": "Room does not exist" })),
            Step::Fail(ChannelError::ChannelLost),
        ]);
        let channel = SignalingChannel::new(link.clone(), policy(3));

        let err = channel.join_room("abc12", "Bob").await.unwrap_err();
        assert_eq!(err, ChannelError::Rejected("Room does not exist".into()));

        let err = channel.send_message("abc12", "hi").await.unwrap_err();
        assert_eq!(err, ChannelError::ChannelLost);
        assert_eq!(link.calls(), 2);
    }

    #[tokio::test]
    async fn test_closed_channel_issues_nothing() {
        let link = ScriptedLink::new(vec![Step::Reply(json!({}))]);
        let channel = SignalingChannel::new(link.clone(), policy(0));

        channel.close().await;
        assert_eq!(channel.send_message("r", "x").await, Err(ChannelError::Closed));
        assert_eq!(link.calls(), 0);
    }

    #[tokio::test]
    async fn test_typed_responses_decode() {
        let link = ScriptedLink::new(vec![
            Step::Reply(json!({ "success": true, "producerId": "pr9" })),
            Step::Reply(json!({ "success": true, "params": { "id": "t1" } })),
        ]);
        let channel = SignalingChannel::new(link, policy(0));

        let id = channel
            .produce("t1", TrackKind::Audio, json!({}), AppData { media_type: crate::media::MediaKind::Audio })
            .await
            .unwrap();
        assert_eq!(id, "pr9");

        let err = channel
            .create_webrtc_transport(TransportDirection::Send)
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::InvalidResponse(_)));
    }

    #[test]
    fn test_reconnect_delay_is_capped() {
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(5000),
            jitter: 0.5,
        };
        for attempt in 0..10 {
            let delay = policy.delay_for(attempt);
            assert!(delay <= Duration::from_millis(5000));
        }
        let first = policy.delay_for(0);
        assert!(first >= Duration::from_millis(500) && first <= Duration::from_millis(1500));

        let fixed = ReconnectPolicy { jitter: 0.0, ..policy };
        assert_eq!(fixed.delay_for(1), Duration::from_millis(2000));
    }
}
