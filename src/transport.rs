//! Send/recv transport ownership and the signaling-backed negotiation handler.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::connection::TransportConnectionState;
use crate::error::{NegotiationError, TransportError};
use crate::media::TrackKind;
use crate::media_engine::{
    AppData, MediaEngine, TransportDirection, TransportHandler, TransportOptions, TransportRef,
};
use crate::signaling::SignalingChannel;

/// Routes a transport's `connect`/`produce` callbacks through signaling.
pub struct SignalingNegotiator {
    signaling: SignalingChannel,
    direction: TransportDirection,
}

impl SignalingNegotiator {
    pub fn new(signaling: SignalingChannel, direction: TransportDirection) -> Self {
        Self {
            signaling,
            direction,
        }
    }
}

#[async_trait]
impl TransportHandler for SignalingNegotiator {
    async fn connect(
        &self,
        transport_id: &str,
        dtls_parameters: Value,
    ) -> Result<(), NegotiationError> {
        debug!(target: "meet.transport", direction = %self.direction, transport_id, "Connecting transport");
        self.signaling
            .connect_transport(transport_id, dtls_parameters)
            .await
            .map_err(|e| NegotiationError::from_channel("connectTransport", e))
    }

    async fn produce(
        &self,
        transport_id: &str,
        kind: TrackKind,
        rtp_parameters: Value,
        app_data: AppData,
    ) -> Result<String, NegotiationError> {
        if self.direction != TransportDirection::Send {
            return Err(NegotiationError::Engine(
                "produce requested on a recv transport".to_string(),
            ));
        }
        self.signaling
            .produce(transport_id, kind, rtp_parameters, app_data)
            .await
            .map_err(|e| NegotiationError::from_channel("produce", e))
    }
}

/// Request parameters from the relay and build the local transport.
pub async fn create_transport(
    signaling: SignalingChannel,
    engine: Arc<dyn MediaEngine>,
    direction: TransportDirection,
    ice_servers: Vec<RTCIceServer>,
) -> Result<TransportRef, TransportError> {
    let params = signaling.create_webrtc_transport(direction).await?;
    let handler = Arc::new(SignalingNegotiator::new(signaling, direction));
    let transport = engine.create_transport(direction, TransportOptions { params, ice_servers }, handler)?;
    debug!(target: "meet.transport", %direction, id = transport.id(), "Transport created");
    Ok(transport)
}

/// Restart ICE on a transport with fresh parameters from the relay.
pub async fn restart_ice(
    signaling: SignalingChannel,
    transport: TransportRef,
) -> Result<(), NegotiationError> {
    let ice_parameters = signaling
        .restart_ice(transport.id())
        .await
        .map_err(|e| NegotiationError::from_channel("restartIce", e))?;
    transport.restart_ice(ice_parameters).await
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportStateChange {
    pub direction: TransportDirection,
    pub transport_id: String,
    pub state: TransportConnectionState,
}

/// Forward every connection-state change of `transport` into `tx`.
///
/// Holds only a weak sender: the watcher stops once every strong sender of
/// the mailbox is gone.
pub fn spawn_state_watcher<M, F>(
    transport: &TransportRef,
    cancel: CancellationToken,
    tx: mpsc::WeakSender<M>,
    wrap: F,
) -> JoinHandle<()>
where
    M: Send + 'static,
    F: Fn(TransportStateChange) -> M + Send + 'static,
{
    let mut states = transport.connection_state();
    let direction = transport.direction();
    let transport_id = transport.id().to_string();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                changed = states.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *states.borrow_and_update();
                    let change = TransportStateChange {
                        direction,
                        transport_id: transport_id.clone(),
                        state,
                    };
                    let Some(sender) = tx.upgrade() else {
                        break;
                    };
                    if sender.send(wrap(change)).await.is_err() || state == TransportConnectionState::Closed {
                        break;
                    }
                }
            }
        }
    })
}

#[derive(Debug, Default)]
enum Slot {
    #[default]
    Empty,
    Pending,
    Ready(TransportRef),
}

/// Holds at most one send and one recv transport.
#[derive(Debug, Default)]
pub struct TransportManager {
    send: Slot,
    recv: Slot,
}

impl TransportManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, direction: TransportDirection) -> &Slot {
        match direction {
            TransportDirection::Send => &self.send,
            TransportDirection::Recv => &self.recv,
        }
    }

    fn slot_mut(&mut self, direction: TransportDirection) -> &mut Slot {
        match direction {
            TransportDirection::Send => &mut self.send,
            TransportDirection::Recv => &mut self.recv,
        }
    }

    /// Reserve the slot for a creation. A second concurrent creation is
    /// rejected rather than run in parallel.
    pub fn begin(&mut self, direction: TransportDirection) -> Result<(), TransportError> {
        let slot = self.slot_mut(direction);
        match slot {
            Slot::Empty => {
                *slot = Slot::Pending;
                Ok(())
            }
            Slot::Pending => Err(TransportError::CreationPending(direction)),
            Slot::Ready(_) => Err(TransportError::AlreadyExists(direction)),
        }
    }

    /// Install a created transport. Hands it back if the reservation was
    /// dropped meanwhile; the caller must close it.
    pub fn complete(&mut self, transport: TransportRef) -> Result<(), TransportRef> {
        let direction = transport.direction();
        let slot = self.slot_mut(direction);
        if !matches!(slot, Slot::Pending) {
            return Err(transport);
        }
        info!(target: "meet.transport", %direction, id = transport.id(), "Transport ready");
        *slot = Slot::Ready(transport);
        Ok(())
    }

    pub fn abort(&mut self, direction: TransportDirection) {
        let slot = self.slot_mut(direction);
        if matches!(slot, Slot::Pending) {
            *slot = Slot::Empty;
        }
    }

    pub fn get(&self, direction: TransportDirection) -> Option<&TransportRef> {
        match self.slot(direction) {
            Slot::Ready(transport) => Some(transport),
            _ => None,
        }
    }

    pub fn send(&self) -> Option<&TransportRef> {
        self.get(TransportDirection::Send)
    }

    pub fn recv(&self) -> Option<&TransportRef> {
        self.get(TransportDirection::Recv)
    }

    pub fn both_ready(&self) -> bool {
        self.send().is_some() && self.recv().is_some()
    }

    /// Interpret a connection-state change. Changes for transports that are
    /// no longer held are ignored. Returns the error for fatal states.
    pub fn on_state_change(&self, change: &TransportStateChange) -> Option<TransportError> {
        let current = self.get(change.direction)?;
        if current.id() != change.transport_id {
            return None;
        }
        debug!(
            target: "meet.transport",
            direction = %change.direction,
            state = %change.state,
            "Transport connection state changed"
        );
        if change.state.is_fatal() {
            warn!(target: "meet.transport", direction = %change.direction, state = %change.state, "Transport connection lost");
            return Some(TransportError::Connection {
                direction: change.direction,
                state: change.state,
            });
        }
        None
    }

    /// Close both transports and clear every slot, pending ones included.
    pub fn close_all(&mut self) -> usize {
        let mut closed = 0;
        for direction in [TransportDirection::Send, TransportDirection::Recv] {
            if let Slot::Ready(transport) = std::mem::take(self.slot_mut(direction)) {
                transport.close();
                closed += 1;
                debug!(target: "meet.transport", %direction, id = transport.id(), "Transport closed");
            }
        }
        closed
    }
}
