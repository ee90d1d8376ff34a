//! Binding seam to the local media engine.
//!
//! The engine owns the native objects (device, transports, producers,
//! consumers). The coordinator only sees them through these traits, and the
//! negotiation callbacks the engine needs (`connect`, `produce`) are supplied
//! as a [`TransportHandler`] that performs ordinary signaling round-trips.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::watch;
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::connection::TransportConnectionState;
use crate::error::{NegotiationError, TransportError};
use crate::media::{MediaKind, TrackKind, TrackRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

impl TransportDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportDirection::Send => "send",
            TransportDirection::Recv => "recv",
        }
    }
}

impl fmt::Display for TransportDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Server-side transport parameters returned by `createWebRtcTransport`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParams {
    pub id: String,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sctp_parameters: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub params: TransportParams,
    pub ice_servers: Vec<RTCIceServer>,
}

/// Parameters returned by `consume`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerParams {
    pub id: String,
    pub producer_id: String,
    pub kind: TrackKind,
    pub rtp_parameters: Value,
    #[serde(default)]
    pub app_data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Encoding {
    pub max_bitrate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_resolution_down_by: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppData {
    pub media_type: MediaKind,
}

/// Encoding and codec settings passed to the engine for one producer.
#[derive(Debug, Clone, PartialEq)]
pub struct ProduceOptions {
    pub encodings: Vec<Encoding>,
    pub codec_options: Value,
    pub app_data: AppData,
}

impl ProduceOptions {
    pub fn for_kind(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Audio => Self {
                encodings: Vec::new(),
                codec_options: json!({ "opusStereo": true, "opusDtx": true }),
                app_data: AppData { media_type: kind },
            },
            MediaKind::Video => Self {
                encodings: vec![
                    Encoding {
                        max_bitrate: 100_000,
                        scale_resolution_down_by: Some(4.0),
                    },
                    Encoding {
                        max_bitrate: 300_000,
                        scale_resolution_down_by: Some(2.0),
                    },
                    Encoding {
                        max_bitrate: 900_000,
                        scale_resolution_down_by: None,
                    },
                ],
                codec_options: json!({ "videoGoogleStartBitrate": 1000 }),
                app_data: AppData { media_type: kind },
            },
            MediaKind::Screen => Self {
                encodings: vec![Encoding {
                    max_bitrate: 1_500_000,
                    scale_resolution_down_by: None,
                }],
                codec_options: json!({}),
                app_data: AppData { media_type: kind },
            },
        }
    }
}

/// Transport-level counters sampled by the engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_lost: u64,
    pub round_trip_time_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
}

/// Negotiation callbacks invoked by the engine on a transport.
///
/// `connect` fires once, before the first media flows over the transport.
/// `produce` fires for every new producer on a send transport and must return
/// the server-assigned producer id.
#[async_trait]
pub trait TransportHandler: Send + Sync {
    async fn connect(&self, transport_id: &str, dtls_parameters: Value)
        -> Result<(), NegotiationError>;

    async fn produce(
        &self,
        transport_id: &str,
        kind: TrackKind,
        rtp_parameters: Value,
        app_data: AppData,
    ) -> Result<String, NegotiationError>;
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    fn is_loaded(&self) -> bool;

    /// Load the router's RTP capabilities. Must precede transport creation.
    async fn load(&self, router_rtp_capabilities: Value) -> Result<(), NegotiationError>;

    /// Local receive capabilities, available once loaded.
    fn rtp_capabilities(&self) -> Option<Value>;

    fn create_transport(
        &self,
        direction: TransportDirection,
        options: TransportOptions,
        handler: Arc<dyn TransportHandler>,
    ) -> Result<TransportRef, TransportError>;
}

#[async_trait]
pub trait EngineTransport: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;
    fn direction(&self) -> TransportDirection;
    fn connection_state(&self) -> watch::Receiver<TransportConnectionState>;

    async fn produce(
        &self,
        track: TrackRef,
        options: ProduceOptions,
    ) -> Result<ProducerRef, NegotiationError>;

    async fn consume(&self, params: ConsumerParams) -> Result<ConsumerRef, NegotiationError>;

    async fn restart_ice(&self, ice_parameters: Value) -> Result<(), NegotiationError>;

    async fn stats(&self) -> Result<TransportStats, NegotiationError>;

    /// Closing a transport invalidates every producer or consumer on it.
    fn close(&self);
    fn is_closed(&self) -> bool;
}

pub trait EngineProducer: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;
    fn pause(&self);
    fn resume(&self);
    fn is_paused(&self) -> bool;
    fn close(&self);
    fn is_closed(&self) -> bool;
}

pub trait EngineConsumer: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;
    fn producer_id(&self) -> &str;
    fn track(&self) -> TrackRef;
    fn close(&self);
    fn is_closed(&self) -> bool;
}

pub type TransportRef = Arc<dyn EngineTransport>;
pub type ProducerRef = Arc<dyn EngineProducer>;
pub type ConsumerRef = Arc<dyn EngineConsumer>;
