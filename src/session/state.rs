//! Room state shared (read-only) with every component
//!
//! Only the session coordinator mutates a [`RoomState`]; everyone else reads
//! `Arc` snapshots of it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use typeshare::typeshare;

use crate::protocol::{LanguageConfig, PeerId};

#[typeshare]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Guest,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Host => write!(f, "host"),
            Role::Guest => write!(f, "guest"),
        }
    }
}

/// A participant as seen by the local peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
    pub id: PeerId,
    pub display_name: String,
    pub role: Role,
    pub online: bool,
    /// Unix milliseconds of the first presence notification
    pub joined_at: i64,
}

impl Peer {
    pub fn new(id: PeerId, display_name: impl Into<String>, joined_at: i64) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            role: Role::Guest,
            online: true,
            joined_at,
        }
    }

    /// Placeholder until the peer announces its display name
    pub fn unnamed(id: PeerId, joined_at: i64) -> Self {
        let name = format!("peer-{}", id.short());
        Self::new(id, name, joined_at)
    }
}

/// The room as the local peer currently understands it
///
/// Invariants maintained by the coordinator: at most one `speaker_id`, and
/// `host_id` is the smallest id in `peers`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomState {
    pub room_id: String,
    pub local_id: PeerId,
    pub host_id: PeerId,
    pub speaker_id: Option<PeerId>,
    pub language_config: LanguageConfig,
    pub peers: BTreeMap<PeerId, Peer>,
    /// Whether the local microphone may transmit
    pub mic_enabled: bool,
}

impl RoomState {
    /// A room containing only the local peer, who is therefore host
    pub fn new(
        room_id: impl Into<String>,
        local_id: PeerId,
        display_name: impl Into<String>,
        language_config: LanguageConfig,
        joined_at: i64,
    ) -> Self {
        let mut local = Peer::new(local_id.clone(), display_name, joined_at);
        local.role = Role::Host;
        let mut peers = BTreeMap::new();
        peers.insert(local_id.clone(), local);

        Self {
            room_id: room_id.into(),
            host_id: local_id.clone(),
            local_id,
            speaker_id: None,
            language_config,
            peers,
            mic_enabled: true,
        }
    }

    pub fn is_host(&self) -> bool {
        self.host_id == self.local_id
    }

    pub fn is_host_peer(&self, id: &PeerId) -> bool {
        &self.host_id == id
    }

    /// Whether the local peer holds the floor token
    pub fn holds_floor(&self) -> bool {
        self.speaker_id.as_ref() == Some(&self.local_id)
    }

    pub fn local_peer(&self) -> Option<&Peer> {
        self.peers.get(&self.local_id)
    }

    pub fn display_name(&self, id: &PeerId) -> String {
        if id.is_bot() {
            return "translator".to_string();
        }
        self.peers
            .get(id)
            .map(|p| p.display_name.clone())
            .unwrap_or_else(|| format!("peer-{}", id.short()))
    }

    /// Make `host` the host and update every peer's role
    pub fn set_host(&mut self, host: PeerId) {
        for (id, peer) in self.peers.iter_mut() {
            peer.role = if *id == host { Role::Host } else { Role::Guest };
        }
        self.host_id = host;
    }

    /// Insert a peer seen for the first time; returns `false` if already known
    pub fn add_peer(&mut self, id: PeerId, joined_at: i64) -> bool {
        if self.peers.contains_key(&id) {
            return false;
        }
        let mut peer = Peer::unnamed(id.clone(), joined_at);
        if id == self.host_id {
            peer.role = Role::Host;
        }
        self.peers.insert(id, peer);
        true
    }

    pub fn rename_peer(&mut self, id: &PeerId, display_name: &str) -> bool {
        match self.peers.get_mut(id) {
            Some(peer) if peer.display_name != display_name => {
                peer.display_name = display_name.to_string();
                true
            }
            _ => false,
        }
    }

    pub fn remove_peer(&mut self, id: &PeerId) -> Option<Peer> {
        if *id == self.local_id {
            return None;
        }
        self.peers.remove(id)
    }

    /// Forget every remote peer (used after a transport failure)
    pub fn reset_to_self(&mut self) {
        let local_id = self.local_id.clone();
        self.peers.retain(|id, _| *id == local_id);
    }

    /// Ids of every peer currently known, including self
    pub fn peer_ids(&self) -> impl Iterator<Item = &PeerId> {
        self.peers.keys()
    }
}
