use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use super::{Peer, PeerProperty, PeerUpdate};
use crate::media::{MediaKind, TrackKind};
use crate::protocol::{PeerInfo, ProducerInfo};

/// A producer announced by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteProducer {
    pub producer_id: String,
    pub peer_id: String,
    pub kind: MediaKind,
    pub peer_name: Option<String>,
}

impl From<ProducerInfo> for RemoteProducer {
    fn from(info: ProducerInfo) -> Self {
        Self {
            kind: info.media_kind(),
            producer_id: info.producer_id,
            peer_id: info.peer_id,
            peer_name: info.peer_name,
        }
    }
}

/// Outcome of applying a [`PeerUpdate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    UnknownPeer,
    Updated {
        /// Peer whose screen share was superseded by this update.
        displaced_sharer: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct Room {
    id: String,
    self_id: Option<String>,
    peers: BTreeMap<String, Peer>,
    producers: HashMap<String, RemoteProducer>,
}

impl Room {
    pub fn new(id: String) -> Self {
        Self {
            id,
            self_id: None,
            peers: BTreeMap::new(),
            producers: HashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn self_id(&self) -> Option<&str> {
        self.self_id.as_deref()
    }

    pub fn set_self_id(&mut self, id: String) {
        self.self_id = Some(id);
    }

    pub fn peer(&self, id: &str) -> Option<&Peer> {
        self.peers.get(id)
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn is_admitted(&self, id: &str) -> bool {
        self.peers.get(id).is_some_and(|p| p.admitted)
    }

    /// Replace membership with a full list. Returns the ids of peers that
    /// are no longer present; their producers are forgotten.
    pub fn replace_peers(&mut self, users: Vec<PeerInfo>) -> Vec<String> {
        let incoming: BTreeMap<String, Peer> = users
            .into_iter()
            .map(|info| {
                let peer = Peer::from(info);
                (peer.id.clone(), peer)
            })
            .collect();

        let departed: Vec<String> = self
            .peers
            .keys()
            .filter(|id| !incoming.contains_key(*id))
            .cloned()
            .collect();

        self.peers = incoming;
        for id in &departed {
            self.producers.retain(|_, p| &p.peer_id != id);
        }
        departed
    }

    pub fn upsert_peer(&mut self, info: PeerInfo) {
        let peer = Peer::from(info);
        self.peers.insert(peer.id.clone(), peer);
    }

    /// Remove a peer and every producer it owned.
    pub fn remove_peer(&mut self, id: &str) -> Option<Peer> {
        self.producers.retain(|_, p| p.peer_id != id);
        self.peers.remove(id)
    }

    /// Reduce one typed update into the peer's state.
    ///
    /// Screen sharing is exclusive: a peer starting to share clears the flag
    /// on whoever shared before (last writer wins).
    pub fn apply(&mut self, peer_id: &str, update: PeerUpdate) -> Applied {
        let Some(peer) = self.peers.get_mut(peer_id) else {
            return Applied::UnknownPeer;
        };

        let mut starts_sharing = false;
        match update {
            PeerUpdate::MediaToggled { kind, enabled } => match kind {
                TrackKind::Audio => peer.media.audio_on = enabled,
                TrackKind::Video => peer.media.video_on = enabled,
            },
            PeerUpdate::ScreenShareToggled(enabled)
            | PeerUpdate::PropertyUpdated(PeerProperty::SharingScreen(enabled)) => {
                peer.media.sharing_screen = enabled;
                starts_sharing = enabled;
            }
            PeerUpdate::HandRaiseToggled(raised)
            | PeerUpdate::PropertyUpdated(PeerProperty::HandRaised(raised)) => {
                peer.media.hand_raised = raised;
            }
            PeerUpdate::PropertyUpdated(PeerProperty::DisplayName(name)) => peer.display_name = name,
            PeerUpdate::PropertyUpdated(PeerProperty::Admin(admin)) => peer.is_admin = admin,
            PeerUpdate::PropertyUpdated(PeerProperty::AudioOn(on)) => peer.media.audio_on = on,
            PeerUpdate::PropertyUpdated(PeerProperty::VideoOn(on)) => peer.media.video_on = on,
        }

        let mut displaced_sharer = None;
        if starts_sharing {
            for other in self.peers.values_mut() {
                if other.id != peer_id && other.media.sharing_screen {
                    other.media.sharing_screen = false;
                    displaced_sharer = Some(other.id.clone());
                }
            }
        }
        Applied::Updated { displaced_sharer }
    }

    /// Peer currently sharing a screen, if any.
    pub fn screen_sharer(&self) -> Option<&Peer> {
        self.peers.values().find(|p| p.media.sharing_screen)
    }

    /// Record an announced producer. Returns false when it was already known.
    pub fn add_producer(&mut self, producer: RemoteProducer) -> bool {
        if self.producers.contains_key(&producer.producer_id) {
            return false;
        }
        self.producers.insert(producer.producer_id.clone(), producer);
        true
    }

    pub fn replace_producers(&mut self, producers: Vec<RemoteProducer>) {
        self.producers = producers
            .into_iter()
            .map(|p| (p.producer_id.clone(), p))
            .collect();
    }

    pub fn remove_producer(&mut self, producer_id: &str) -> Option<RemoteProducer> {
        self.producers.remove(producer_id)
    }

    pub fn has_producer(&self, producer_id: &str) -> bool {
        self.producers.contains_key(producer_id)
    }

    /// Producers the local peer may consume: owned by a known, admitted peer
    /// other than self.
    pub fn consumable_producers(&self) -> Vec<RemoteProducer> {
        let Some(self_id) = self.self_id.as_deref() else {
            return Vec::new();
        };
        let mut list: Vec<RemoteProducer> = self
            .producers
            .values()
            .filter(|p| p.peer_id != self_id && self.is_admitted(&p.peer_id))
            .cloned()
            .collect();
        list.sort_by(|a, b| a.producer_id.cmp(&b.producer_id));
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: &str) -> PeerInfo {
        PeerInfo {
            id: id.into(),
            name: id.to_uppercase(),
            ..Default::default()
        }
    }

    fn producer(id: &str, peer: &str, kind: MediaKind) -> RemoteProducer {
        RemoteProducer {
            producer_id: id.into(),
            peer_id: peer.into(),
            kind,
            peer_name: None,
        }
    }

    fn room() -> Room {
        let mut room = Room::new("abc12".into());
        room.set_self_id("me".into());
        room.replace_peers(vec![info("me"), info("a"), info("b")]);
        room
    }

    #[test]
    fn test_screen_share_is_exclusive() {
        let mut room = room();
        room.apply("a", PeerUpdate::ScreenShareToggled(true));
        let applied = room.apply("b", PeerUpdate::ScreenShareToggled(true));

        assert_eq!(
            applied,
            Applied::Updated {
                displaced_sharer: Some("a".into())
            }
        );
        assert_eq!(room.screen_sharer().map(|p| p.id.as_str()), Some("b"));
        assert_eq!(room.peers().filter(|p| p.media.sharing_screen).count(), 1);
    }

    #[test]
    fn test_updates_for_unknown_peer() {
        let mut room = room();
        assert_eq!(
            room.apply("ghost", PeerUpdate::HandRaiseToggled(true)),
            Applied::UnknownPeer
        );
        room.apply(
            "a",
            PeerUpdate::MediaToggled {
                kind: TrackKind::Audio,
                enabled: true,
            },
        );
        room.apply("a", PeerUpdate::PropertyUpdated(PeerProperty::DisplayName("Ann".into())));
        let a = room.peer("a").unwrap();
        assert!(a.media.audio_on);
        assert_eq!(a.display_name, "Ann");
    }

    #[test]
    fn test_consumable_excludes_self_and_unadmitted() {
        let mut room = room();
        room.upsert_peer(PeerInfo {
            is_admitted: Some(false),
            ..info("waiting")
        });
        assert!(room.add_producer(producer("p-me", "me", MediaKind::Audio)));
        assert!(room.add_producer(producer("p-a", "a", MediaKind::Video)));
        assert!(room.add_producer(producer("p-w", "waiting", MediaKind::Audio)));
        assert!(room.add_producer(producer("p-x", "unknown", MediaKind::Audio)));
        assert!(!room.add_producer(producer("p-a", "a", MediaKind::Video)));

        let ids: Vec<_> = room
            .consumable_producers()
            .into_iter()
            .map(|p| p.producer_id)
            .collect();
        assert_eq!(ids, vec!["p-a"]);
    }

    #[test]
    fn test_departed_peers_lose_producers() {
        let mut room = room();
        room.add_producer(producer("p-a", "a", MediaKind::Audio));
        room.add_producer(producer("p-b", "b", MediaKind::Audio));

        let departed = room.replace_peers(vec![info("me"), info("b")]);
        assert_eq!(departed, vec!["a".to_string()]);
        assert!(!room.has_producer("p-a"));

        room.remove_peer("b");
        assert!(!room.has_producer("p-b"));
    }
}
