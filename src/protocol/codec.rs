//! JSON wire codec
//!
//! Frame layout: `{"id", "type", "senderId", "timestamp", "payload"}`.
//! Heartbeats share the envelope with `"type": "HEARTBEAT"` and no payload.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use super::types::{
    ControlPayload, ControlSignal, EventKind, EventPayload, PeerId, StateUpdatePayload,
    TranscriptionPayload, TranslationEvent,
};
use crate::error::AppError;

/// Wire name of the heartbeat frame
pub const HEARTBEAT_TYPE: &str = "HEARTBEAT";

/// Decode failures
///
/// `Unknown` covers well-formed frames this build does not understand (new
/// event types, new control signals); callers drop both kinds silently.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("unknown {0}")]
    Unknown(String),

    #[error("malformed frame: {0}")]
    Malformed(String),
}

impl From<ProtocolError> for AppError {
    fn from(e: ProtocolError) -> Self {
        AppError::Protocol(e.to_string())
    }
}

/// Result of decoding one inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Event(TranslationEvent),
    Heartbeat { sender_id: PeerId, timestamp: i64 },
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<Uuid>,
    #[serde(rename = "type")]
    kind: String,
    sender_id: PeerId,
    timestamp: i64,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    payload: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawControl {
    signal: String,
    #[serde(default)]
    target_peer_id: Option<PeerId>,
}

/// Base64 of the little-endian f32 bytes
pub fn encode_samples(samples: &[f32]) -> String {
    let mut raw = Vec::with_capacity(samples.len() * 4);
    for s in samples {
        raw.extend_from_slice(&s.to_le_bytes());
    }
    BASE64.encode(raw)
}

pub fn decode_samples(data: &str) -> Result<Vec<f32>, ProtocolError> {
    let raw = BASE64
        .decode(data)
        .map_err(|e| ProtocolError::Malformed(format!("audio data: {}", e)))?;
    if raw.len() % 4 != 0 {
        return Err(ProtocolError::Malformed(format!(
            "audio data length {} is not a multiple of 4",
            raw.len()
        )));
    }
    Ok(raw
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

fn payload_value(payload: &EventPayload) -> serde_json::Result<Value> {
    match payload {
        EventPayload::AudioChunk(p) => serde_json::to_value(p),
        EventPayload::Transcription(p) | EventPayload::Translation(p) => serde_json::to_value(p),
        EventPayload::Control(p) => serde_json::to_value(p),
        EventPayload::StateUpdate(p) => serde_json::to_value(p),
    }
}

/// Serialize an event into one transport frame
pub fn encode_event(event: &TranslationEvent) -> crate::Result<Bytes> {
    let envelope = Envelope {
        id: Some(event.id()),
        kind: event.kind().as_str().to_string(),
        sender_id: event.sender_id().clone(),
        timestamp: event.timestamp(),
        payload: payload_value(event.payload())?,
    };
    Ok(Bytes::from(serde_json::to_vec(&envelope)?))
}

pub fn encode_heartbeat(sender_id: &PeerId, timestamp: i64) -> crate::Result<Bytes> {
    let envelope = Envelope {
        id: None,
        kind: HEARTBEAT_TYPE.to_string(),
        sender_id: sender_id.clone(),
        timestamp,
        payload: Value::Null,
    };
    Ok(Bytes::from(serde_json::to_vec(&envelope)?))
}

fn from_payload<T: for<'de> Deserialize<'de>>(
    kind: EventKind,
    payload: Value,
) -> Result<T, ProtocolError> {
    serde_json::from_value(payload)
        .map_err(|e| ProtocolError::Malformed(format!("{} payload: {}", kind, e)))
}

fn decode_control(payload: Value) -> Result<ControlPayload, ProtocolError> {
    let raw: RawControl = from_payload(EventKind::Control, payload)?;
    let signal = ControlSignal::from_wire(&raw.signal)
        .ok_or_else(|| ProtocolError::Unknown(format!("control signal {}", raw.signal)))?;
    Ok(ControlPayload::new(signal, raw.target_peer_id))
}

/// Parse one inbound frame
pub fn decode(frame: &[u8]) -> Result<Inbound, ProtocolError> {
    let envelope: Envelope =
        serde_json::from_slice(frame).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    if envelope.kind == HEARTBEAT_TYPE {
        return Ok(Inbound::Heartbeat {
            sender_id: envelope.sender_id,
            timestamp: envelope.timestamp,
        });
    }

    let kind = EventKind::from_wire(&envelope.kind)
        .ok_or_else(|| ProtocolError::Unknown(format!("event type {}", envelope.kind)))?;
    let id = envelope
        .id
        .ok_or_else(|| ProtocolError::Malformed(format!("{} frame without id", kind)))?;

    let payload = match kind {
        EventKind::AudioChunk => EventPayload::AudioChunk(from_payload(kind, envelope.payload)?),
        EventKind::Transcription => {
            EventPayload::Transcription(from_payload::<TranscriptionPayload>(kind, envelope.payload)?)
        }
        EventKind::Translation => {
            EventPayload::Translation(from_payload::<TranscriptionPayload>(kind, envelope.payload)?)
        }
        EventKind::Control => EventPayload::Control(decode_control(envelope.payload)?),
        EventKind::StateUpdate => {
            EventPayload::StateUpdate(from_payload::<StateUpdatePayload>(kind, envelope.payload)?)
        }
    };

    Ok(Inbound::Event(TranslationEvent::with_id(
        id,
        envelope.sender_id,
        envelope.timestamp,
        payload,
    )))
}

/// Decode and require a conversational event (heartbeats are rejected)
pub fn decode_event(frame: &[u8]) -> Result<TranslationEvent, ProtocolError> {
    match decode(frame)? {
        Inbound::Event(event) => Ok(event),
        Inbound::Heartbeat { .. } => Err(ProtocolError::Unknown("heartbeat".to_string())),
    }
}
