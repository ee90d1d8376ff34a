use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ReconnectPolicy, RelayLink};
use crate::connection::{ConnectionMonitor, ConnectionState};
use crate::error::ChannelError;
use crate::protocol::{ChannelEvent, Frame, Notification};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Responder = oneshot::Sender<Result<Value, ChannelError>>;

const OUTGOING_BUFFER: usize = 100;
const EVENT_BUFFER: usize = 256;

struct Shared {
    pending: StdMutex<HashMap<u64, Responder>>,
    events: broadcast::Sender<ChannelEvent>,
    monitor: ConnectionMonitor,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, HashMap<u64, Responder>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn fail_pending(&self, error: ChannelError) {
        let drained: Vec<_> = self.pending().drain().collect();
        if !drained.is_empty() {
            debug!(target: "meet.signaling.ws", count = drained.len(), "Failing in-flight requests");
        }
        for (_, responder) in drained {
            let _ = responder.send(Err(error.clone()));
        }
    }

    fn dispatch(&self, text: &str) {
        let frame = match serde_json::from_str::<Frame>(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(target: "meet.signaling.ws", error = %e, "Dropping malformed frame");
                return;
            }
        };

        match frame {
            Frame::Response { id, data } => {
                if let Some(responder) = self.pending().remove(&id) {
                    let _ = responder.send(Ok(data));
                } else {
                    debug!(target: "meet.signaling.ws", id, "Response for unknown request");
                }
            }
            Frame::Notification { event, data } => match Notification::from_parts(&event, data) {
                Ok(Some(notification)) => {
                    let _ = self.events.send(ChannelEvent::Notification(notification));
                }
                Ok(None) => debug!(target: "meet.signaling.ws", %event, "Ignoring unknown notification"),
                Err(e) => warn!(target: "meet.signaling.ws", %event, error = %e, "Malformed notification"),
            },
            Frame::Request { event, .. } => {
                debug!(target: "meet.signaling.ws", %event, "Ignoring relay-initiated request");
            }
        }
    }
}

/// Websocket link to the relay with transparent reconnection.
pub struct WsRelayLink {
    shared: Arc<Shared>,
    outgoing: mpsc::Sender<(u64, String)>,
    next_id: AtomicU64,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WsRelayLink {
    pub async fn connect(url: &str, policy: ReconnectPolicy) -> Result<Self, ChannelError> {
        let monitor = ConnectionMonitor::new();
        monitor.update_state(ConnectionState::Connecting);

        let (ws, _) = connect_async(url).await.map_err(|e| {
            monitor.update_state(ConnectionState::Failed);
            ChannelError::Connect(e.to_string())
        })?;
        monitor.update_state(ConnectionState::Connected);
        info!(target: "meet.signaling.ws", url, "Connected to relay");

        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let shared = Arc::new(Shared {
            pending: StdMutex::new(HashMap::new()),
            events,
            monitor,
        });
        let (outgoing, outgoing_rx) = mpsc::channel(OUTGOING_BUFFER);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(supervise(
            url.to_string(),
            ws,
            outgoing_rx,
            shared.clone(),
            policy,
            cancel.clone(),
        ));

        Ok(Self {
            shared,
            outgoing,
            next_id: AtomicU64::new(1),
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn monitor(&self) -> &ConnectionMonitor {
        &self.shared.monitor
    }

    /// Requests still waiting for a response.
    pub fn in_flight(&self) -> usize {
        self.shared.pending().len()
    }
}

/// Forgets a request once its caller stops waiting, including when the
/// caller's timeout drops the request future.
struct PendingRequest<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        self.shared.pending().remove(&self.id);
    }
}

#[async_trait]
impl RelayLink for WsRelayLink {
    async fn request(&self, event: &str, data: Value) -> Result<Value, ChannelError> {
        if self.cancel.is_cancelled() {
            return Err(ChannelError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let text = serde_json::to_string(&Frame::Request {
            id,
            event: event.to_string(),
            data,
        })
        .map_err(|e| ChannelError::InvalidResponse(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.shared.pending().insert(id, tx);
        let _pending = PendingRequest {
            shared: &self.shared,
            id,
        };

        if self.outgoing.send((id, text)).await.is_err() {
            return Err(ChannelError::Closed);
        }

        rx.await.map_err(|_| ChannelError::ChannelLost)?
    }

    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.shared.events.subscribe()
    }

    async fn disconnect(&self) {
        debug!(target: "meet.signaling.ws", in_flight = self.in_flight(), "Disconnecting from relay");
        self.cancel.cancel();
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
        self.shared.fail_pending(ChannelError::Closed);
        self.shared.monitor.update_state(ConnectionState::Disconnected);
    }
}

impl Drop for WsRelayLink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn supervise(
    url: String,
    ws: WsStream,
    mut outgoing: mpsc::Receiver<(u64, String)>,
    shared: Arc<Shared>,
    policy: ReconnectPolicy,
    cancel: CancellationToken,
) {
    let mut ws = ws;
    loop {
        let reason = pump(ws, &mut outgoing, &shared, &cancel).await;
        if cancel.is_cancelled() {
            return;
        }

        // Frames still queued belong to requests that are about to fail.
        while outgoing.try_recv().is_ok() {}
        shared.fail_pending(ChannelError::ChannelLost);
        shared.monitor.set_error(reason.clone());
        warn!(target: "meet.signaling.ws", %reason, "Relay connection lost");
        let _ = shared.events.send(ChannelEvent::Disconnected { reason });

        let mut attempt = 0;
        ws = loop {
            shared.monitor.record_reconnect_attempt();
            let delay = policy.delay_for(attempt);
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
            match connect_async(url.as_str()).await {
                Ok((ws, _)) => break ws,
                Err(e) => {
                    attempt += 1;
                    warn!(
                        target: "meet.signaling.ws",
                        attempt,
                        error = %e,
                        "Reconnect attempt failed"
                    );
                }
            }
        };

        shared.monitor.update_state(ConnectionState::Connected);
        info!(target: "meet.signaling.ws", attempts = attempt + 1, "Reconnected to relay");
        let _ = shared.events.send(ChannelEvent::Reconnected);
    }
}

/// Drive one websocket connection until it ends. Returns why it ended.
async fn pump(
    ws: WsStream,
    outgoing: &mut mpsc::Receiver<(u64, String)>,
    shared: &Shared,
    cancel: &CancellationToken,
) -> String {
    let (mut write, mut read) = ws.split();
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return "closed locally".to_string();
            }
            frame = outgoing.recv() => match frame {
                Some((id, text)) => {
                    if let Err(e) = write.send(Message::Text(text)).await {
                        if let Some(responder) = shared.pending().remove(&id) {
                            let _ = responder.send(Err(ChannelError::ChannelLost));
                        }
                        return e.to_string();
                    }
                }
                None => return "link dropped".to_string(),
            },
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => shared.dispatch(&text),
                Some(Ok(Message::Close(frame))) => {
                    return match frame {
                        Some(frame) => format!("closed by relay: {}", frame.reason),
                        None => "closed by relay".to_string(),
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return e.to_string(),
                None => return "stream ended".to_string(),
            },
        }
    }
}
