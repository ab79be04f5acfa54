//! Session event types
//!
//! Local notifications published by the session coordinator. Serialized
//! with a dotted event name so a UI can subscribe over any JSON channel.

use serde::{Deserialize, Serialize};

use crate::protocol::PeerId;
use crate::session::TranscriptEntry;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SessionEvent {
    /// Joined the mesh (room id normalized)
    #[serde(rename = "session.joined")]
    Joined { room_id: String, local_id: PeerId },

    /// Left the room; no further events follow
    #[serde(rename = "session.left")]
    Left { room_id: String },

    #[serde(rename = "session.host_changed")]
    HostChanged { host_id: PeerId, is_local: bool },

    /// Speaking token changed hands (`None` = floor free)
    #[serde(rename = "floor.changed")]
    FloorChanged { speaker_id: Option<PeerId> },

    #[serde(rename = "peer.joined")]
    PeerJoined { peer_id: PeerId },

    #[serde(rename = "peer.left")]
    PeerLeft { peer_id: PeerId },

    /// A peer announced its display name
    #[serde(rename = "peer.updated")]
    PeerUpdated { peer_id: PeerId, display_name: String },

    /// Local voice activity edge
    #[serde(rename = "audio.voice_activity")]
    VoiceActivity { speaking: bool },

    #[serde(rename = "audio.mic_changed")]
    MicChanged {
        enabled: bool,
        /// Set when the host muted us
        by_host: bool,
    },

    #[serde(rename = "transcript.appended")]
    TranscriptAppended { entry: TranscriptEntry },

    #[serde(rename = "session.languages_changed")]
    LanguagesChanged {
        source_language: String,
        target_language: String,
    },

    /// Translation bridge started or stopped
    #[serde(rename = "translation.status")]
    TranslationStatus { active: bool },

    #[serde(rename = "translation.error")]
    TranslationError { message: String },

    /// Transport failed; membership was reset to only this peer
    #[serde(rename = "transport.lost")]
    TransportLost { reason: String },

    /// The host removed us from the room
    #[serde(rename = "session.kicked")]
    Kicked { by: PeerId },
}

impl SessionEvent {
    /// Dotted event name as serialized
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Joined { .. } => "session.joined",
            SessionEvent::Left { .. } => "session.left",
            SessionEvent::HostChanged { .. } => "session.host_changed",
            SessionEvent::FloorChanged { .. } => "floor.changed",
            SessionEvent::PeerJoined { .. } => "peer.joined",
            SessionEvent::PeerLeft { .. } => "peer.left",
            SessionEvent::PeerUpdated { .. } => "peer.updated",
            SessionEvent::VoiceActivity { .. } => "audio.voice_activity",
            SessionEvent::MicChanged { .. } => "audio.mic_changed",
            SessionEvent::TranscriptAppended { .. } => "transcript.appended",
            SessionEvent::LanguagesChanged { .. } => "session.languages_changed",
            SessionEvent::TranslationStatus { .. } => "translation.status",
            SessionEvent::TranslationError { .. } => "translation.error",
            SessionEvent::TransportLost { .. } => "transport.lost",
            SessionEvent::Kicked { .. } => "session.kicked",
        }
    }
}
