//! Deterministic host election
//!
//! Every peer sorts the ids it knows about and takes the smallest. Peers
//! that observe the same presence set converge on the same host without
//! exchanging any messages; disagreement during churn is tolerated.

use std::collections::BTreeSet;
use tracing::debug;

use crate::protocol::PeerId;

pub struct LeaderElector {
    local_id: PeerId,
    known: BTreeSet<PeerId>,
    last_emitted: Option<PeerId>,
}

impl LeaderElector {
    pub fn new(local_id: PeerId) -> Self {
        let mut known = BTreeSet::new();
        known.insert(local_id.clone());
        Self {
            local_id,
            known,
            last_emitted: None,
        }
    }

    /// The host for the current set, without emitting anything
    pub fn current_host(&self) -> &PeerId {
        // `known` always contains the local id
        self.known.iter().next().unwrap_or(&self.local_id)
    }

    /// Recompute; returns the new host only if it differs from the last one emitted
    ///
    /// The first call after construction or [`reset`](Self::reset) always emits.
    pub fn elect(&mut self) -> Option<PeerId> {
        let host = self.current_host().clone();
        if self.last_emitted.as_ref() == Some(&host) {
            return None;
        }
        debug!(host = %host, peers = self.known.len(), "Host elected");
        self.last_emitted = Some(host.clone());
        Some(host)
    }

    pub fn peer_joined(&mut self, id: PeerId) -> Option<PeerId> {
        self.known.insert(id);
        self.elect()
    }

    pub fn peer_left(&mut self, id: &PeerId) -> Option<PeerId> {
        if *id != self.local_id {
            self.known.remove(id);
        }
        self.elect()
    }

    /// Forget every remote peer and the last emitted host
    pub fn reset(&mut self) {
        let local = self.local_id.clone();
        self.known.retain(|id| *id == local);
        self.last_emitted = None;
    }

    pub fn known(&self) -> impl Iterator<Item = &PeerId> {
        self.known.iter()
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }
}
