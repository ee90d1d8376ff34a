//! Consumers of remote producers, keyed by producer id.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tracing::debug;

use crate::media::{MediaKind, MediaStream};
use crate::media_engine::ConsumerRef;

#[derive(Debug)]
pub struct Consumer {
    pub producer_id: String,
    pub peer_id: String,
    pub kind: MediaKind,
    pub stream: MediaStream,
    handle: ConsumerRef,
}

impl Consumer {
    pub fn new(peer_id: String, kind: MediaKind, handle: ConsumerRef) -> Self {
        Self {
            producer_id: handle.producer_id().to_string(),
            stream: MediaStream::with_track(handle.track()),
            peer_id,
            kind,
            handle,
        }
    }

    pub fn id(&self) -> &str {
        self.handle.id()
    }

    /// Close the engine consumer and stop its track.
    pub fn close(&self) {
        self.handle.close();
        self.stream.stop();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumerSummary {
    pub id: String,
    pub producer_id: String,
    pub peer_id: String,
    pub kind: MediaKind,
    pub stream_id: String,
}

#[derive(Debug)]
enum Slot {
    InFlight { peer_id: String },
    Live(Consumer),
}

#[derive(Debug, Default)]
pub struct ConsumerRegistry {
    entries: HashMap<String, Slot>,
    /// Producers whose negotiation failed; skipped until the next resync.
    failed: HashSet<String>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `producer_id`. Returns false if a consumer for it exists, is
    /// being negotiated, or already failed.
    pub fn reserve(&mut self, producer_id: &str, peer_id: &str) -> bool {
        if self.entries.contains_key(producer_id) || self.failed.contains(producer_id) {
            return false;
        }
        self.entries.insert(
            producer_id.to_string(),
            Slot::InFlight {
                peer_id: peer_id.to_string(),
            },
        );
        true
    }

    /// Install a negotiated consumer. Hands it back if its reservation was
    /// dropped meanwhile; the caller must close it.
    pub fn complete(&mut self, consumer: Consumer) -> Result<(), Consumer> {
        let reserved = matches!(
            self.entries.get(&consumer.producer_id),
            Some(Slot::InFlight { peer_id }) if *peer_id == consumer.peer_id
        );
        if !reserved {
            return Err(consumer);
        }
        debug!(
            target: "meet.consumer",
            producer_id = %consumer.producer_id,
            consumer_id = consumer.id(),
            "Consumer live"
        );
        self.entries
            .insert(consumer.producer_id.clone(), Slot::Live(consumer));
        Ok(())
    }

    /// Drop a reservation whose negotiation failed.
    pub fn fail(&mut self, producer_id: &str) {
        if matches!(self.entries.get(producer_id), Some(Slot::InFlight { .. })) {
            self.entries.remove(producer_id);
            self.failed.insert(producer_id.to_string());
        }
    }

    /// Close a live consumer the relay refused to resume. Its producer is
    /// skipped until the next resync. Returns false if `consumer_id` is no
    /// longer the live consumer of `producer_id`.
    pub fn fail_live(&mut self, producer_id: &str, consumer_id: &str) -> bool {
        if !matches!(
            self.entries.get(producer_id),
            Some(Slot::Live(consumer)) if consumer.id() == consumer_id
        ) {
            return false;
        }
        self.remove(producer_id);
        self.failed.insert(producer_id.to_string());
        true
    }

    pub fn clear_failures(&mut self) {
        self.failed.clear();
    }

    /// The live consumer of `producer_id`; `None` while still negotiating.
    pub fn get(&self, producer_id: &str) -> Option<&Consumer> {
        match self.entries.get(producer_id) {
            Some(Slot::Live(consumer)) => Some(consumer),
            _ => None,
        }
    }

    pub fn consumers(&self) -> impl Iterator<Item = &Consumer> {
        self.entries.values().filter_map(|slot| match slot {
            Slot::Live(consumer) => Some(consumer),
            Slot::InFlight { .. } => None,
        })
    }

    /// Close and forget the consumer of `producer_id`. An in-flight
    /// reservation is dropped so that its completion is refused.
    pub fn remove(&mut self, producer_id: &str) -> bool {
        match self.entries.remove(producer_id) {
            Some(Slot::Live(consumer)) => {
                consumer.close();
                debug!(target: "meet.consumer", %producer_id, "Consumer closed");
                true
            }
            Some(Slot::InFlight { .. }) => true,
            None => false,
        }
    }

    /// Returns the producer id of the removed consumer.
    pub fn remove_by_consumer_id(&mut self, consumer_id: &str) -> Option<String> {
        let producer_id = self
            .consumers()
            .find(|c| c.id() == consumer_id)
            .map(|c| c.producer_id.clone())?;
        self.remove(&producer_id);
        Some(producer_id)
    }

    /// Remove every consumer (live or in flight) belonging to `peer_id`.
    pub fn remove_peer(&mut self, peer_id: &str) -> usize {
        let doomed: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, slot)| match slot {
                Slot::InFlight { peer_id: owner } => owner == peer_id,
                Slot::Live(consumer) => consumer.peer_id == peer_id,
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &doomed {
            self.remove(id);
        }
        doomed.len()
    }

    /// Remove consumers whose producer is no longer live.
    pub fn retain_producers(&mut self, is_live: impl Fn(&str) -> bool) -> usize {
        let doomed: Vec<String> = self
            .entries
            .keys()
            .filter(|id| !is_live(id))
            .cloned()
            .collect();
        for id in &doomed {
            self.remove(id);
        }
        doomed.len()
    }

    pub fn summaries(&self) -> Vec<ConsumerSummary> {
        let mut list: Vec<ConsumerSummary> = self
            .consumers()
            .map(|c| ConsumerSummary {
                id: c.id().to_string(),
                producer_id: c.producer_id.clone(),
                peer_id: c.peer_id.clone(),
                kind: c.kind,
                stream_id: c.stream.id().to_string(),
            })
            .collect();
        list.sort_by(|a, b| a.producer_id.cmp(&b.producer_id));
        list
    }

    /// Close everything, including reservations.
    pub fn close_all(&mut self) -> usize {
        let mut closed = 0;
        for (_, slot) in self.entries.drain() {
            if let Slot::Live(consumer) = slot {
                consumer.close();
                closed += 1;
            }
        }
        self.failed.clear();
        closed
    }
}
