//! Inter-peer event protocol
//!
//! Defines the [`TranslationEvent`] schema shared by every peer and the
//! translation bridge, plus its JSON frame codec.

pub mod codec;
pub mod types;

pub use codec::{
    decode, decode_event, decode_samples, encode_event, encode_heartbeat, encode_samples,
    Inbound, ProtocolError,
};
pub use types::{
    AudioChunkPayload, ControlPayload, ControlSignal, EventKind, EventPayload, LanguageConfig,
    PeerId, StateUpdatePayload, TranscriptionPayload, TranslationEvent, BOT_PEER_ID,
};
