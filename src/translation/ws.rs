//! WebSocket translation bridge
//!
//! Protocol (JSON text frames):
//! - client → engine: `{"type":"setup","sourceLanguage","targetLanguage","sampleRate"}`
//!   once after connecting, then `{"type":"audio","data","sampleRate"}` per chunk
//!   with `data` = base64 of little-endian f32 samples
//! - engine → client: wire [`TranslationEvent`] frames

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{BridgeEvent, TranslationBridge};
use crate::audio::WIRE_SAMPLE_RATE;
use crate::error::{AppError, Result};
use crate::protocol::{codec, LanguageConfig, PeerId};
use crate::utils::LogThrottler;

/// Pending audio chunks between the host and the socket writer
const AUDIO_QUEUE: usize = 128;
/// How long a stop waits for the engine to accept the close frame
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct WsBridgeConfig {
    /// Engine endpoint, e.g. `wss://engine.example/v1/stream`
    pub url: String,
    pub sample_rate: u32,
    pub connect_timeout: Duration,
}

impl Default for WsBridgeConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9000/translate".to_string(),
            sample_rate: WIRE_SAMPLE_RATE,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientMessage<'a> {
    #[serde(rename_all = "camelCase")]
    Setup {
        source_language: &'a str,
        target_language: &'a str,
        sample_rate: u32,
    },
    #[serde(rename_all = "camelCase")]
    Audio { data: String, sample_rate: u32 },
}

impl ClientMessage<'_> {
    fn to_text(&self) -> Result<Message> {
        Ok(Message::Text(serde_json::to_string(self)?.into()))
    }
}

struct Session {
    audio_tx: mpsc::Sender<Vec<f32>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct WsTranslationBridge {
    config: WsBridgeConfig,
    session: Mutex<Option<Session>>,
    throttler: LogThrottler,
}

impl WsTranslationBridge {
    pub fn new(config: WsBridgeConfig) -> Self {
        Self {
            config,
            session: Mutex::new(None),
            throttler: LogThrottler::with_secs(5),
        }
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }
}

#[async_trait]
impl TranslationBridge for WsTranslationBridge {
    async fn start(
        &self,
        languages: LanguageConfig,
        events: mpsc::Sender<BridgeEvent>,
    ) -> Result<()> {
        if self.is_active() {
            return Ok(());
        }

        info!(
            "Connecting translation bridge to {} ({} -> {})",
            self.config.url, languages.source_language, languages.target_language
        );

        let connect = tokio_tungstenite::connect_async(self.config.url.as_str());
        let (ws_stream, _) = tokio::time::timeout(self.config.connect_timeout, connect)
            .await
            .map_err(|_| AppError::Translation("connection timed out".to_string()))?
            .map_err(|e| AppError::Translation(format!("connect failed: {}", e)))?;

        let (mut sink, stream) = ws_stream.split();

        let setup = ClientMessage::Setup {
            source_language: &languages.source_language,
            target_language: &languages.target_language,
            sample_rate: self.config.sample_rate,
        };
        sink.send(setup.to_text()?)
            .await
            .map_err(|e| AppError::Translation(format!("setup failed: {}", e)))?;

        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_QUEUE);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_session(
            sink,
            stream,
            audio_rx,
            events,
            self.config.sample_rate,
            cancel.clone(),
        ));

        let previous = self.session.lock().replace(Session {
            audio_tx,
            cancel,
            task,
        });
        if let Some(old) = previous {
            old.cancel.cancel();
        }
        Ok(())
    }

    fn push_audio(&self, samples: &[f32]) -> Result<()> {
        let session = self.session.lock();
        let Some(session) = session.as_ref() else {
            return Err(AppError::Translation("bridge not started".to_string()));
        };

        match session.audio_tx.try_send(samples.to_vec()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                if self.throttler.should_log("bridge_audio_full") {
                    warn!("Translation bridge is falling behind, dropping audio");
                }
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(AppError::Translation("bridge connection closed".to_string()))
            }
        }
    }

    async fn stop(&self) -> Result<()> {
        let Some(session) = self.session.lock().take() else {
            return Ok(());
        };
        info!("Stopping translation bridge");
        session.cancel.cancel();
        let _ = session.task.await;
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.session
            .lock()
            .as_ref()
            .map(|s| !s.task.is_finished())
            .unwrap_or(false)
    }
}

async fn run_session<S, R>(
    mut sink: S,
    mut stream: R,
    mut audio_rx: mpsc::Receiver<Vec<f32>>,
    events: mpsc::Sender<BridgeEvent>,
    sample_rate: u32,
    cancel: CancellationToken,
) where
    S: futures::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
    R: futures::Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    let bot = PeerId::bot();
    let throttler = LogThrottler::with_secs(5);

    let reason = loop {
        tokio::select! {
            // queued audio is flushed before a stop takes effect
            biased;

            Some(samples) = audio_rx.recv() => {
                let msg = ClientMessage::Audio {
                    data: codec::encode_samples(&samples),
                    sample_rate,
                };
                let frame = match msg.to_text() {
                    Ok(f) => f,
                    Err(e) => break Some(e.to_string()),
                };
                if let Err(e) = sink.send(frame).await {
                    break Some(format!("send failed: {}", e));
                }
            }
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    match codec::decode_event(text.as_bytes()) {
                        Ok(event) => {
                            let event = BridgeEvent::Event(event.with_sender(bot.clone()));
                            // a full channel must not keep stop() waiting
                            tokio::select! {
                                sent = events.send(event) => if sent.is_err() {
                                    break None;
                                },
                                _ = cancel.cancelled() => break None,
                            }
                        }
                        Err(e) => {
                            if throttler.should_log("bridge_decode") {
                                debug!("Dropping engine frame: {}", e);
                            }
                        }
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| f.reason.to_string())
                        .unwrap_or_else(|| "closed by engine".to_string());
                    break Some(reason);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break Some(format!("receive failed: {}", e)),
                None => break Some("connection ended".to_string()),
            },
            _ = cancel.cancelled() => break None,
        }
    };

    if cancel.is_cancelled() {
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.send(Message::Close(None))).await;
    }

    // best effort: nobody may be draining the channel any more
    if let Some(reason) = &reason {
        warn!("Translation bridge closed: {}", reason);
        let _ = events.try_send(BridgeEvent::Error(reason.clone()));
    }
    if events.try_send(BridgeEvent::Closed(reason)).is_err() {
        debug!("Bridge close notice dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{EventPayload, TranscriptionPayload, TranslationEvent};
    use tokio::net::TcpListener;

    async fn engine() -> (String, JoinHandle<Vec<String>>, mpsc::Sender<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (push_tx, mut push_rx) = mpsc::channel::<String>(8);

        let handle = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let (mut tx, mut rx) = ws.split();
            let mut received = Vec::new();
            loop {
                tokio::select! {
                    Some(text) = push_rx.recv() => {
                        tx.send(Message::Text(text.into())).await.unwrap();
                    }
                    msg = rx.next() => match msg {
                        Some(Ok(Message::Text(t))) => received.push(t.to_string()),
                        Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                        _ => {}
                    }
                }
            }
            received
        });

        (url, handle, push_tx)
    }

    fn languages() -> LanguageConfig {
        LanguageConfig {
            source_language: "fr-FR".to_string(),
            target_language: "en-GB".to_string(),
        }
    }

    #[tokio::test]
    async fn test_setup_audio_and_inbound_events() {
        let (url, server, push) = engine().await;
        let bridge = WsTranslationBridge::new(WsBridgeConfig {
            url,
            ..Default::default()
        });
        assert!(bridge.push_audio(&[0.0]).is_err());

        let (events_tx, mut events_rx) = mpsc::channel(8);
        bridge.start(languages(), events_tx).await.unwrap();
        assert!(bridge.is_active());

        bridge.push_audio(&[0.5, -0.25]).unwrap();

        // the engine claims to be someone else; the bridge rewrites the sender
        let event = TranslationEvent::new(
            PeerId::from("engine"),
            1_700_000_000_000,
            EventPayload::Translation(TranscriptionPayload {
                text: "hello".to_string(),
                is_final: true,
                original_language: "fr-FR".to_string(),
            }),
        );
        let frame = codec::encode_event(&event).unwrap();
        push.send(String::from_utf8(frame.to_vec()).unwrap()).await.unwrap();

        match events_rx.recv().await.unwrap() {
            BridgeEvent::Event(e) => {
                assert!(e.sender_id().is_bot());
                assert_eq!(e.id(), event.id());
            }
            other => panic!("unexpected {:?}", other),
        }

        bridge.stop().await.unwrap();
        assert!(!bridge.is_active());
        assert_eq!(events_rx.recv().await, Some(BridgeEvent::Closed(None)));

        let received = server.await.unwrap();
        assert_eq!(received.len(), 2);
        let setup: serde_json::Value = serde_json::from_str(&received[0]).unwrap();
        assert_eq!(setup["type"], "setup");
        assert_eq!(setup["sourceLanguage"], "fr-FR");
        assert_eq!(setup["targetLanguage"], "en-GB");
        assert_eq!(setup["sampleRate"], 16000);

        let audio: serde_json::Value = serde_json::from_str(&received[1]).unwrap();
        assert_eq!(audio["type"], "audio");
        assert_eq!(audio["sampleRate"], 16000);
        let samples = codec::decode_samples(audio["data"].as_str().unwrap()).unwrap();
        assert_eq!(samples, vec![0.5, -0.25]);
    }

    #[tokio::test]
    async fn test_stop_with_unread_events_does_not_hang() {
        let (url, server, push) = engine().await;
        let bridge = WsTranslationBridge::new(WsBridgeConfig {
            url,
            ..Default::default()
        });
        // never read: the session task blocks on the third event
        let (events_tx, _events_rx) = mpsc::channel(2);
        bridge.start(languages(), events_tx).await.unwrap();

        for n in 0..10 {
            let event = TranslationEvent::new(
                PeerId::from("engine"),
                1_700_000_000_000 + n,
                EventPayload::Transcription(TranscriptionPayload {
                    text: format!("line {}", n),
                    is_final: true,
                    original_language: "fr-FR".to_string(),
                }),
            );
            let frame = codec::encode_event(&event).unwrap();
            push.send(String::from_utf8(frame.to_vec()).unwrap()).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let stopped = tokio::time::timeout(Duration::from_secs(3), bridge.stop()).await;
        assert!(matches!(stopped, Ok(Ok(()))));
        assert!(!bridge.is_active());
        // the engine still sees an orderly close
        tokio::time::timeout(Duration::from_secs(3), server)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_connect_failure_is_translation_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let bridge = WsTranslationBridge::new(WsBridgeConfig {
            url: format!("ws://{}", addr),
            connect_timeout: Duration::from_secs(2),
            ..Default::default()
        });
        let (tx, _rx) = mpsc::channel(1);
        assert!(matches!(
            bridge.start(LanguageConfig::default(), tx).await,
            Err(AppError::Translation(_))
        ));
        assert!(!bridge.is_active());
        bridge.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_engine_hangup_reports_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let _setup = ws.next().await;
            let _ = ws.close(None).await;
        });

        let bridge = WsTranslationBridge::new(WsBridgeConfig {
            url,
            ..Default::default()
        });
        let (tx, mut rx) = mpsc::channel(4);
        bridge.start(LanguageConfig::default(), tx).await.unwrap();

        assert!(matches!(rx.recv().await, Some(BridgeEvent::Error(_))));
        assert!(matches!(rx.recv().await, Some(BridgeEvent::Closed(Some(_)))));
    }
}
