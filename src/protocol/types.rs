//! Wire-level event types
//!
//! Every message exchanged between peers (other than the transport heartbeat)
//! is a [`TranslationEvent`]. Its payload is a closed enum keyed by
//! [`EventKind`], so dispatch is an exhaustive `match`.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use typeshare::typeshare;
use uuid::Uuid;

use super::codec::{decode_samples, encode_samples};

/// Reserved sender id for events produced by the translation bridge
pub const BOT_PEER_ID: &str = "translator-bot";

/// Peer identifier assigned by the transport at join time
///
/// Ordering is plain lexicographic string ordering, which is what host
/// election relies on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random id (UUID v4)
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The translation bot identity
    pub fn bot() -> Self {
        Self(BOT_PEER_ID.to_string())
    }

    pub fn is_bot(&self) -> bool {
        self.0 == BOT_PEER_ID
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, for log lines and placeholder names
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Borrow<str> for PeerId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Source/target language pair for the translation bridge
#[typeshare]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LanguageConfig {
    /// BCP-47 tag of the spoken language (e.g. "en-US")
    pub source_language: String,
    /// BCP-47 tag of the translation output
    pub target_language: String,
}

impl Default for LanguageConfig {
    fn default() -> Self {
        Self {
            source_language: "en-US".to_string(),
            target_language: "es-ES".to_string(),
        }
    }
}

/// Event type discriminant as it appears in the `type` field on the wire
#[typeshare]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    AudioChunk,
    Transcription,
    Translation,
    Control,
    StateUpdate,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::AudioChunk => "AUDIO_CHUNK",
            EventKind::Transcription => "TRANSCRIPTION",
            EventKind::Translation => "TRANSLATION",
            EventKind::Control => "CONTROL",
            EventKind::StateUpdate => "STATE_UPDATE",
        }
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "AUDIO_CHUNK" => Some(EventKind::AudioChunk),
            "TRANSCRIPTION" => Some(EventKind::Transcription),
            "TRANSLATION" => Some(EventKind::Translation),
            "CONTROL" => Some(EventKind::Control),
            "STATE_UPDATE" => Some(EventKind::StateUpdate),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw mono audio frame
///
/// On the wire the samples travel as base64 of little-endian f32 bytes in
/// the `data` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "AudioChunkWire", try_from = "AudioChunkWire")]
pub struct AudioChunkPayload {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// Monotonic within one sender
    pub sequence_id: u64,
}

impl AudioChunkPayload {
    /// Frame length in seconds
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AudioChunkWire {
    data: String,
    sample_rate: u32,
    sequence_id: u64,
}

impl From<AudioChunkPayload> for AudioChunkWire {
    fn from(p: AudioChunkPayload) -> Self {
        Self {
            data: encode_samples(&p.samples),
            sample_rate: p.sample_rate,
            sequence_id: p.sequence_id,
        }
    }
}

impl TryFrom<AudioChunkWire> for AudioChunkPayload {
    type Error = String;

    fn try_from(w: AudioChunkWire) -> std::result::Result<Self, Self::Error> {
        if w.sample_rate == 0 {
            return Err("audio chunk with zero sample rate".to_string());
        }
        let samples = decode_samples(&w.data).map_err(|e| e.to_string())?;
        Ok(Self {
            samples,
            sample_rate: w.sample_rate,
            sequence_id: w.sequence_id,
        })
    }
}

/// Speech-to-text result; also used for the translated text
#[typeshare]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptionPayload {
    pub text: String,
    #[serde(default)]
    pub is_final: bool,
    #[serde(default)]
    pub original_language: String,
}

/// Floor-control and moderation signals
#[typeshare]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlSignal {
    RequestToken,
    ReleaseToken,
    GrantToken,
    MutePeer,
    KickPeer,
}

impl ControlSignal {
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "REQUEST_TOKEN" => Some(ControlSignal::RequestToken),
            "RELEASE_TOKEN" => Some(ControlSignal::ReleaseToken),
            "GRANT_TOKEN" => Some(ControlSignal::GrantToken),
            "MUTE_PEER" => Some(ControlSignal::MutePeer),
            "KICK_PEER" => Some(ControlSignal::KickPeer),
            _ => None,
        }
    }
}

#[typeshare]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlPayload {
    pub signal: ControlSignal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_peer_id: Option<PeerId>,
}

impl ControlPayload {
    pub fn new(signal: ControlSignal, target: Option<PeerId>) -> Self {
        Self {
            signal,
            target_peer_id: target,
        }
    }
}

/// A peer's self-announcement (display name; the host adds the room languages)
#[typeshare]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateUpdatePayload {
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language_config: Option<LanguageConfig>,
}

/// Closed set of payloads, one per [`EventKind`]
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    AudioChunk(AudioChunkPayload),
    Transcription(TranscriptionPayload),
    Translation(TranscriptionPayload),
    Control(ControlPayload),
    StateUpdate(StateUpdatePayload),
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::AudioChunk(_) => EventKind::AudioChunk,
            EventPayload::Transcription(_) => EventKind::Transcription,
            EventPayload::Translation(_) => EventKind::Translation,
            EventPayload::Control(_) => EventKind::Control,
            EventPayload::StateUpdate(_) => EventKind::StateUpdate,
        }
    }
}

/// One inter-peer event. Immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct TranslationEvent {
    id: Uuid,
    sender_id: PeerId,
    timestamp: i64,
    payload: EventPayload,
}

impl TranslationEvent {
    /// Build an event with a fresh id
    pub fn new(sender_id: PeerId, timestamp: i64, payload: EventPayload) -> Self {
        Self::with_id(Uuid::new_v4(), sender_id, timestamp, payload)
    }

    pub(crate) fn with_id(
        id: Uuid,
        sender_id: PeerId,
        timestamp: i64,
        payload: EventPayload,
    ) -> Self {
        Self {
            id,
            sender_id,
            timestamp,
            payload,
        }
    }

    pub fn control(
        sender_id: PeerId,
        timestamp: i64,
        signal: ControlSignal,
        target: Option<PeerId>,
    ) -> Self {
        Self::new(
            sender_id,
            timestamp,
            EventPayload::Control(ControlPayload::new(signal, target)),
        )
    }

    pub fn audio(
        sender_id: PeerId,
        timestamp: i64,
        samples: Vec<f32>,
        sample_rate: u32,
        sequence_id: u64,
    ) -> Self {
        Self::new(
            sender_id,
            timestamp,
            EventPayload::AudioChunk(AudioChunkPayload {
                samples,
                sample_rate,
                sequence_id,
            }),
        )
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    pub fn sender_id(&self) -> &PeerId {
        &self.sender_id
    }

    /// Capture time in unix milliseconds
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn payload(&self) -> &EventPayload {
        &self.payload
    }

    pub fn into_payload(self) -> EventPayload {
        self.payload
    }

    /// Same event attributed to another sender (the bridge output is
    /// always re-attributed to the bot identity)
    pub fn with_sender(self, sender_id: PeerId) -> Self {
        Self { sender_id, ..self }
    }
}
