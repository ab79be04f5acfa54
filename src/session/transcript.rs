//! In-memory conversation transcript
//!
//! Append-only, in arrival order, for the lifetime of the session.

use serde::{Deserialize, Serialize};
use typeshare::typeshare;

use crate::protocol::{EventPayload, PeerId, TranscriptionPayload, TranslationEvent};

#[typeshare]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptKind {
    Transcription,
    Translation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEntry {
    /// Position in the transcript (0-based)
    pub index: usize,
    pub kind: TranscriptKind,
    pub sender_id: PeerId,
    pub text: String,
    pub is_final: bool,
    pub original_language: String,
    /// Sender's capture timestamp (unix ms)
    pub timestamp: i64,
    /// Local arrival time (unix ms)
    pub received_at: i64,
}

#[derive(Debug, Default, Clone)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the text carried by `event`
    ///
    /// Returns `None` for events without text (audio, control, state).
    pub fn record(&mut self, event: &TranslationEvent, received_at: i64) -> Option<&TranscriptEntry> {
        let (kind, payload) = match event.payload() {
            EventPayload::Transcription(p) => (TranscriptKind::Transcription, p),
            EventPayload::Translation(p) => (TranscriptKind::Translation, p),
            _ => return None,
        };
        Some(self.push(kind, event.sender_id().clone(), payload, event.timestamp(), received_at))
    }

    fn push(
        &mut self,
        kind: TranscriptKind,
        sender_id: PeerId,
        payload: &TranscriptionPayload,
        timestamp: i64,
        received_at: i64,
    ) -> &TranscriptEntry {
        let index = self.entries.len();
        self.entries.push(TranscriptEntry {
            index,
            kind,
            sender_id,
            text: payload.text.clone(),
            is_final: payload.is_final,
            original_language: payload.original_language.clone(),
            timestamp,
            received_at,
        });
        &self.entries[index]
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    /// The last `n` entries, oldest first
    pub fn tail(&self, n: usize) -> &[TranscriptEntry] {
        let start = self.entries.len().saturating_sub(n);
        &self.entries[start..]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ControlSignal;

    fn text_event(kind: TranscriptKind, text: &str, ts: i64) -> TranslationEvent {
        let payload = TranscriptionPayload {
            text: text.to_string(),
            is_final: true,
            original_language: "en-US".to_string(),
        };
        let payload = match kind {
            TranscriptKind::Transcription => EventPayload::Transcription(payload),
            TranscriptKind::Translation => EventPayload::Translation(payload),
        };
        TranslationEvent::new(PeerId::bot(), ts, payload)
    }

    #[test]
    fn test_appends_in_arrival_order() {
        let mut transcript = Transcript::new();
        // arrival order wins over sender timestamps
        transcript.record(&text_event(TranscriptKind::Transcription, "hola", 200), 1000);
        transcript.record(&text_event(TranscriptKind::Translation, "hello", 100), 1001);

        let entries = transcript.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].index, 0);
        assert_eq!(entries[0].text, "hola");
        assert_eq!(entries[0].kind, TranscriptKind::Transcription);
        assert_eq!(entries[1].kind, TranscriptKind::Translation);
        assert_eq!(entries[1].timestamp, 100);
        assert_eq!(entries[1].received_at, 1001);
        assert!(entries[1].sender_id.is_bot());
    }

    #[test]
    fn test_ignores_non_text_events() {
        let mut transcript = Transcript::new();
        let control = TranslationEvent::control(PeerId::from("a"), 0, ControlSignal::ReleaseToken, None);
        assert!(transcript.record(&control, 0).is_none());
        let audio = TranslationEvent::audio(PeerId::from("a"), 0, vec![0.0; 4], 16000, 1);
        assert!(transcript.record(&audio, 0).is_none());
        assert!(transcript.is_empty());
    }

    #[test]
    fn test_tail() {
        let mut transcript = Transcript::new();
        for i in 0..5 {
            transcript.record(&text_event(TranscriptKind::Translation, &i.to_string(), i), i);
        }
        let tail = transcript.tail(2);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].text, "3");
        assert_eq!(transcript.tail(10).len(), 5);
    }
}
