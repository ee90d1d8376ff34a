//! Connection state of the relay link and of media transports.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

/// State of the signaling link to the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    /// Lost and retrying with backoff.
    Reconnecting,
    /// Closed locally or never opened.
    Disconnected,
    Failed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Attempts since the link was last up. Reset on (re)connection.
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
    pub connected_since: Option<DateTime<Utc>>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            reconnect_attempts: 0,
            last_error: None,
            connected_since: None,
        }
    }
}

/// Shared, observable status of the relay link.
#[derive(Clone)]
pub struct ConnectionMonitor {
    status: Arc<watch::Sender<ConnectionStatus>>,
    receiver: watch::Receiver<ConnectionStatus>,
}

impl ConnectionMonitor {
    pub fn new() -> Self {
        let (status, receiver) = watch::channel(ConnectionStatus::default());
        Self {
            status: Arc::new(status),
            receiver,
        }
    }

    /// Observers are only woken when the state actually changes.
    pub fn update_state(&self, state: ConnectionState) {
        self.status.send_if_modified(|status| {
            if status.state == state {
                return false;
            }
            status.state = state;
            if state == ConnectionState::Connected {
                status.reconnect_attempts = 0;
                status.last_error = None;
                status.connected_since = Some(Utc::now());
            } else {
                status.connected_since = None;
            }
            true
        });
    }

    pub fn record_reconnect_attempt(&self) {
        self.status.send_modify(|status| {
            status.state = ConnectionState::Reconnecting;
            status.connected_since = None;
            status.reconnect_attempts += 1;
        });
    }

    pub fn set_error(&self, error: String) {
        self.status
            .send_modify(|status| status.last_error = Some(error));
    }

    pub fn current(&self) -> ConnectionStatus {
        self.receiver.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.receiver.clone()
    }
}

impl Default for ConnectionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Connection state of one media transport, as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl TransportConnectionState {
    /// Partial media state cannot be resumed once a transport reaches one of
    /// these; the session treats them as terminal.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            TransportConnectionState::Disconnected | TransportConnectionState::Failed
        )
    }
}

impl fmt::Display for TransportConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportConnectionState::New => "new",
            TransportConnectionState::Connecting => "connecting",
            TransportConnectionState::Connected => "connected",
            TransportConnectionState::Disconnected => "disconnected",
            TransportConnectionState::Failed => "failed",
            TransportConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

impl From<RTCPeerConnectionState> for TransportConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
                TransportConnectionState::New
            }
            RTCPeerConnectionState::Connecting => TransportConnectionState::Connecting,
            RTCPeerConnectionState::Connected => TransportConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => TransportConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => TransportConnectionState::Failed,
            RTCPeerConnectionState::Closed => TransportConnectionState::Closed,
        }
    }
}

impl From<RTCIceConnectionState> for TransportConnectionState {
    fn from(state: RTCIceConnectionState) -> Self {
        match state {
            RTCIceConnectionState::Unspecified | RTCIceConnectionState::New => {
                TransportConnectionState::New
            }
            RTCIceConnectionState::Checking => TransportConnectionState::Connecting,
            RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
                TransportConnectionState::Connected
            }
            RTCIceConnectionState::Disconnected => TransportConnectionState::Disconnected,
            RTCIceConnectionState::Failed => TransportConnectionState::Failed,
            RTCIceConnectionState::Closed => TransportConnectionState::Closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ice_states_map_to_transport_states() {
        assert_eq!(
            TransportConnectionState::from(RTCIceConnectionState::Completed),
            TransportConnectionState::Connected
        );
        assert_eq!(
            TransportConnectionState::from(RTCIceConnectionState::Checking),
            TransportConnectionState::Connecting
        );
        assert!(TransportConnectionState::from(RTCPeerConnectionState::Failed).is_fatal());
        assert!(!TransportConnectionState::from(RTCPeerConnectionState::Closed).is_fatal());
    }

    #[test]
    fn test_monitor_tracks_reconnect_attempts() {
        let monitor = ConnectionMonitor::new();
        let rx = monitor.subscribe();

        monitor.record_reconnect_attempt();
        monitor.record_reconnect_attempt();
        monitor.set_error("connection refused".into());
        assert_eq!(rx.borrow().state, ConnectionState::Reconnecting);
        assert_eq!(rx.borrow().reconnect_attempts, 2);

        monitor.update_state(ConnectionState::Connected);
        let status = monitor.current();
        assert_eq!(status.reconnect_attempts, 0);
        assert!(status.last_error.is_none());
        assert!(status.connected_since.is_some());
        assert_eq!(status.state.to_string(), "connected");
    }
}
