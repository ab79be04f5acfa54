//! Translation engine seam
//!
//! Only the host runs a bridge. It pushes the floor-holder's audio at the
//! wire rate and receives transcription, translation and synthesized audio
//! back as [`TranslationEvent`]s from the bot identity.

pub mod ws;

pub use ws::{WsBridgeConfig, WsTranslationBridge};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::protocol::{LanguageConfig, TranslationEvent};

/// Notifications from a running bridge
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    /// An event from the engine; sender is always the bot id
    Event(TranslationEvent),
    /// Non-fatal failure reported by the engine
    Error(String),
    /// Connection ended; the bridge must be started again
    Closed(Option<String>),
}

#[async_trait]
pub trait TranslationBridge: Send + Sync {
    /// Connect and configure the session
    async fn start(
        &self,
        languages: LanguageConfig,
        events: mpsc::Sender<BridgeEvent>,
    ) -> Result<()>;

    /// Queue wire-rate mono samples; never blocks
    fn push_audio(&self, samples: &[f32]) -> Result<()>;

    /// Close the session; idempotent
    async fn stop(&self) -> Result<()>;

    fn is_active(&self) -> bool;
}
