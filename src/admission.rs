//! Admission gate: the local peer's own admission state and, for admins, the
//! ordered queue of peers waiting to be let in.

use serde::Serialize;
use tracing::{debug, info};

use crate::error::{AdmissionError, ChannelError, Error};
use crate::protocol::PeerInfo;
use crate::room::PendingJoinRequest;
use crate::signaling::SignalingChannel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AdmissionState {
    Requested,
    Admitted,
    Denied,
    Abandoned,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JoinOutcome {
    Admitted {
        self_id: String,
        is_admin: bool,
        users: Vec<PeerInfo>,
    },
    Pending {
        self_id: String,
        users: Vec<PeerInfo>,
    },
}

impl JoinOutcome {
    pub fn self_id(&self) -> &str {
        match self {
            JoinOutcome::Admitted { self_id, .. } | JoinOutcome::Pending { self_id, .. } => self_id,
        }
    }
}

/// Create (`create = true`) or join a room.
///
/// The creator is admitted immediately and becomes admin. A joining peer is
/// admitted only if the relay says so; otherwise it waits for `admitted`.
pub async fn request_join(
    signaling: &SignalingChannel,
    room_id: &str,
    name: &str,
    create: bool,
) -> Result<JoinOutcome, Error> {
    let response = if create {
        signaling.create_room(room_id, name).await
    } else {
        signaling.join_room(room_id, name).await
    }
    .map_err(|err| map_join_error(room_id, err))?;

    let self_id = response
        .self_id()
        .map(str::to_string)
        .ok_or_else(|| ChannelError::InvalidResponse("join response carries no peer id".into()))?;

    let is_admin = create
        || response.is_admin
        || response.current_peer.as_ref().is_some_and(|p| p.is_admin);

    if is_admin || response.admitted == Some(true) {
        Ok(JoinOutcome::Admitted {
            self_id,
            is_admin,
            users: response.users,
        })
    } else {
        Ok(JoinOutcome::Pending {
            self_id,
            users: response.users,
        })
    }
}

fn map_join_error(room_id: &str, err: ChannelError) -> Error {
    match err {
        ChannelError::Rejected(reason)
            if reason.contains("does not exist") || reason.contains("not found") =>
        {
            AdmissionError::RoomNotFound(room_id.to_string()).into()
        }
        ChannelError::Rejected(reason) if reason == "Unauthorized" => AdmissionError::Unauthorized.into(),
        ChannelError::Rejected(reason) => AdmissionError::Denied(reason).into(),
        other => other.into(),
    }
}

#[derive(Debug)]
pub struct AdmissionController {
    is_admin: bool,
    state: AdmissionState,
    pending: Vec<PendingJoinRequest>,
}

impl Default for AdmissionController {
    fn default() -> Self {
        Self::new()
    }
}

impl AdmissionController {
    pub fn new() -> Self {
        Self {
            is_admin: false,
            state: AdmissionState::Requested,
            pending: Vec::new(),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.is_admin
    }

    pub fn state(&self) -> AdmissionState {
        self.state
    }

    pub fn is_admitted(&self) -> bool {
        self.state == AdmissionState::Admitted
    }

    pub fn record_outcome(&mut self, outcome: &JoinOutcome) {
        match outcome {
            JoinOutcome::Admitted { is_admin, .. } => {
                self.is_admin = *is_admin;
                self.mark_admitted();
            }
            // An `admitted` notification may overtake the join response.
            JoinOutcome::Pending { .. } if self.state != AdmissionState::Admitted => {
                self.state = AdmissionState::Requested;
            }
            JoinOutcome::Pending { .. } => {}
        }
    }

    /// Local peer admitted by the room admin. Returns true only on the
    /// transition, which is what unblocks media setup.
    pub fn mark_admitted(&mut self) -> bool {
        if self.state == AdmissionState::Admitted {
            return false;
        }
        info!(target: "meet.admission", "Admitted to room");
        self.state = AdmissionState::Admitted;
        true
    }

    pub fn mark_denied(&mut self) {
        self.state = AdmissionState::Denied;
    }

    /// The local peer gave up while still waiting for a decision.
    pub fn mark_abandoned(&mut self) {
        if self.state == AdmissionState::Requested {
            debug!(target: "meet.admission", "Left before being admitted");
            self.state = AdmissionState::Abandoned;
        }
    }

    /// Queue a join request. Duplicate requests keep their original position.
    pub fn add_request(&mut self, peer_id: String, name: String) -> bool {
        if self.pending.iter().any(|r| r.peer_id == peer_id) {
            return false;
        }
        debug!(target: "meet.admission", %peer_id, %name, "Join request queued");
        self.pending.push(PendingJoinRequest { peer_id, name });
        true
    }

    pub fn list_pending(&self) -> Vec<PendingJoinRequest> {
        self.pending.clone()
    }

    /// Check that the local peer may admit `peer_id` right now.
    pub fn authorize_admit(&self, peer_id: &str) -> Result<(), AdmissionError> {
        if !self.is_admin {
            return Err(AdmissionError::Unauthorized);
        }
        if !self.pending.iter().any(|r| r.peer_id == peer_id) {
            return Err(AdmissionError::NotPending(peer_id.to_string()));
        }
        Ok(())
    }

    pub fn complete_admit(&mut self, peer_id: &str) {
        self.pending.retain(|r| r.peer_id != peer_id);
    }

    /// A requesting peer disconnected before a decision.
    pub fn peer_left(&mut self, peer_id: &str) -> bool {
        let before = self.pending.len();
        self.pending.retain(|r| r.peer_id != peer_id);
        if self.pending.len() == before {
            return false;
        }
        debug!(target: "meet.admission", %peer_id, "Join request abandoned");
        true
    }

    /// Drop requests for peers that now appear as members, e.g. admitted by
    /// another admin.
    pub fn reconcile_members<'a>(&mut self, member_ids: impl IntoIterator<Item = &'a str>) {
        for id in member_ids {
            if self.pending.iter().any(|r| r.peer_id == id) {
                self.complete_admit(id);
            }
        }
    }
}
