//! Local producers, at most one per [`MediaKind`].

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;
use tracing::debug;

use crate::error::ProducerError;
use crate::media::{MediaKind, TrackRef};
use crate::media_engine::ProducerRef;

#[derive(Debug)]
enum Entry {
    /// Negotiation running; the track is owned here until it completes.
    InFlight { track: TrackRef },
    Live { producer: ProducerRef, track: TrackRef },
}

impl Entry {
    fn track(&self) -> &TrackRef {
        match self {
            Entry::InFlight { track } | Entry::Live { track, .. } => track,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProducerSummary {
    pub kind: MediaKind,
    pub id: String,
    pub paused: bool,
}

#[derive(Debug, Default)]
pub struct ProducerRegistry {
    entries: BTreeMap<MediaKind, Entry>,
    /// Acquired tracks waiting for a send transport.
    staged: BTreeMap<MediaKind, TrackRef>,
}

impl ProducerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep a track until it can be produced. A previously staged track of
    /// the same kind is stopped.
    pub fn stage(&mut self, kind: MediaKind, track: TrackRef) {
        if let Some(old) = self.staged.insert(kind, track) {
            old.stop();
        }
    }

    pub fn take_staged(&mut self, kind: MediaKind) -> Option<TrackRef> {
        self.staged.remove(&kind)
    }

    pub fn staged_kinds(&self) -> Vec<MediaKind> {
        self.staged.keys().copied().collect()
    }

    /// Claim `kind` for a new producer.
    pub fn reserve(
        &mut self,
        kind: MediaKind,
        track: TrackRef,
        send_ready: bool,
    ) -> Result<(), ProducerError> {
        if !send_ready {
            return Err(ProducerError::NoSendTransport);
        }
        if self.entries.contains_key(&kind) {
            return Err(ProducerError::AlreadyProducing(kind));
        }
        self.entries.insert(kind, Entry::InFlight { track });
        Ok(())
    }

    /// Install a negotiated producer. Hands it back if `kind` was closed
    /// while negotiation ran; the caller must close it.
    pub fn complete(&mut self, kind: MediaKind, producer: ProducerRef) -> Result<(), ProducerRef> {
        match self.entries.remove(&kind) {
            Some(Entry::InFlight { track }) => {
                debug!(target: "meet.producer", %kind, id = producer.id(), "Producer live");
                self.entries.insert(kind, Entry::Live { producer, track });
                Ok(())
            }
            Some(live) => {
                self.entries.insert(kind, live);
                Err(producer)
            }
            None => Err(producer),
        }
    }

    /// Drop a failed reservation and return its track.
    pub fn abort(&mut self, kind: MediaKind) -> Option<TrackRef> {
        match self.entries.remove(&kind) {
            Some(Entry::InFlight { track }) => Some(track),
            Some(live) => {
                self.entries.insert(kind, live);
                None
            }
            None => None,
        }
    }

    pub fn is_producing(&self, kind: MediaKind) -> bool {
        self.entries.contains_key(&kind)
    }

    pub fn producer_id(&self, kind: MediaKind) -> Option<&str> {
        match self.entries.get(&kind) {
            Some(Entry::Live { producer, .. }) => Some(producer.id()),
            _ => None,
        }
    }

    pub fn track(&self, kind: MediaKind) -> Option<&TrackRef> {
        self.entries.get(&kind).map(Entry::track)
    }

    pub fn live_ids(&self) -> HashSet<String> {
        self.entries
            .values()
            .filter_map(|entry| match entry {
                Entry::Live { producer, .. } => Some(producer.id().to_string()),
                Entry::InFlight { .. } => None,
            })
            .collect()
    }

    /// Disable the track and pause the producer. Returns false when nothing
    /// of `kind` is live.
    pub fn pause(&mut self, kind: MediaKind) -> bool {
        match self.entries.get(&kind) {
            Some(Entry::Live { producer, track }) => {
                track.set_enabled(false);
                producer.pause();
                true
            }
            _ => false,
        }
    }

    pub fn resume(&mut self, kind: MediaKind) -> bool {
        match self.entries.get(&kind) {
            Some(Entry::Live { producer, track }) => {
                track.set_enabled(true);
                producer.resume();
                true
            }
            _ => false,
        }
    }

    /// Release everything held for `kind`. No-op when nothing is held.
    pub fn close(&mut self, kind: MediaKind) -> bool {
        let staged = self.staged.remove(&kind);
        if let Some(track) = &staged {
            track.stop();
        }
        match self.entries.remove(&kind) {
            Some(Entry::Live { producer, track }) => {
                producer.close();
                track.stop();
                debug!(target: "meet.producer", %kind, id = producer.id(), "Producer closed");
                true
            }
            Some(Entry::InFlight { track }) => {
                track.stop();
                true
            }
            None => staged.is_some(),
        }
    }

    pub fn summaries(&self) -> Vec<ProducerSummary> {
        self.entries
            .iter()
            .filter_map(|(kind, entry)| match entry {
                Entry::Live { producer, .. } => Some(ProducerSummary {
                    kind: *kind,
                    id: producer.id().to_string(),
                    paused: producer.is_paused(),
                }),
                Entry::InFlight { .. } => None,
            })
            .collect()
    }

    /// Stop every track the registry holds without closing producers.
    pub fn stop_all_tracks(&self) -> usize {
        let mut stopped = 0;
        for track in self
            .entries
            .values()
            .map(Entry::track)
            .chain(self.staged.values())
        {
            if !track.is_stopped() {
                track.stop();
                stopped += 1;
            }
        }
        stopped
    }

    /// Close every producer and forget every track.
    pub fn close_all(&mut self) -> usize {
        let mut closed = 0;
        for (kind, entry) in std::mem::take(&mut self.entries) {
            if let Entry::Live { producer, .. } = entry {
                producer.close();
                closed += 1;
                debug!(target: "meet.producer", %kind, id = producer.id(), "Producer closed");
            }
        }
        self.staged.clear();
        closed
    }

    /// Close producers whose transport went away, keeping their tracks staged
    /// for re-production.
    pub fn detach_for_resync(&mut self) -> Vec<MediaKind> {
        let mut kinds = Vec::new();
        for (kind, entry) in std::mem::take(&mut self.entries) {
            let track = match entry {
                Entry::Live { producer, track } => {
                    producer.close();
                    track
                }
                Entry::InFlight { track } => track,
            };
            if kind == MediaKind::Screen {
                track.stop();
                continue;
            }
            self.staged.insert(kind, track);
            kinds.push(kind);
        }
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaTrack, TrackKind};
    use crate::media_engine::EngineProducer;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Default)]
    struct Track {
        enabled: AtomicBool,
        stopped: AtomicBool,
    }

    impl MediaTrack for Track {
        fn id(&self) -> &str {
            "track"
        }
        fn kind(&self) -> TrackKind {
            TrackKind::Audio
        }
        fn set_enabled(&self, enabled: bool) {
            self.enabled.store(enabled, Ordering::SeqCst);
        }
        fn is_enabled(&self) -> bool {
            self.enabled.load(Ordering::SeqCst)
        }
        fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
        fn is_stopped(&self) -> bool {
            self.stopped.load(Ordering::SeqCst)
        }
    }

    #[derive(Debug, Default)]
    struct Producer {
        paused: AtomicBool,
        closed: AtomicBool,
    }

    impl EngineProducer for Producer {
        fn id(&self) -> &str {
            "pr1"
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
            self.closed.store(true, Ordering::SeqCst);
        }
        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_reserve_rules() {
        let mut registry = ProducerRegistry::new();
        let track: TrackRef = Arc::new(Track::default());

        assert_eq!(
            registry.reserve(MediaKind::Audio, track.clone(), false),
            Err(ProducerError::NoSendTransport)
        );
        registry.reserve(MediaKind::Audio, track.clone(), true).unwrap();
        assert_eq!(
            registry.reserve(MediaKind::Audio, track, true),
            Err(ProducerError::AlreadyProducing(MediaKind::Audio))
        );
    }

    #[test]
    fn test_pause_resume_and_close() {
        let mut registry = ProducerRegistry::new();
        let track = Arc::new(Track::default());
        let producer = Arc::new(Producer::default());

        registry.reserve(MediaKind::Audio, track.clone(), true).unwrap();
        registry.complete(MediaKind::Audio, producer.clone()).unwrap();

        assert!(registry.pause(MediaKind::Audio));
        assert!(producer.is_paused());
        assert!(!track.is_enabled());
        assert!(registry.resume(MediaKind::Audio));
        assert!(track.is_enabled());
        assert!(!registry.pause(MediaKind::Video));

        assert!(registry.close(MediaKind::Audio));
        assert!(producer.is_closed());
        assert!(track.is_stopped());
        assert!(!registry.close(MediaKind::Audio));
    }

    #[test]
    fn test_completion_after_close_is_handed_back() {
        let mut registry = ProducerRegistry::new();
        let track = Arc::new(Track::default());
        registry.reserve(MediaKind::Video, track.clone(), true).unwrap();
        registry.close(MediaKind::Video);
        assert!(track.is_stopped());

        let producer = Arc::new(Producer::default());
        assert!(registry.complete(MediaKind::Video, producer).is_err());
        assert!(registry.live_ids().is_empty());
    }

    #[test]
    fn test_detach_keeps_camera_tracks_staged() {
        let mut registry = ProducerRegistry::new();
        let mic = Arc::new(Track::default());
        let screen = Arc::new(Track::default());
        let mic_producer = Arc::new(Producer::default());

        registry.reserve(MediaKind::Audio, mic.clone(), true).unwrap();
        registry.complete(MediaKind::Audio, mic_producer.clone()).unwrap();
        registry.reserve(MediaKind::Screen, screen.clone(), true).unwrap();

        let kinds = registry.detach_for_resync();
        assert_eq!(kinds, vec![MediaKind::Audio]);
        assert!(mic_producer.is_closed());
        assert!(!mic.is_stopped());
        assert!(screen.is_stopped());
        assert_eq!(registry.staged_kinds(), vec![MediaKind::Audio]);
    }
}
