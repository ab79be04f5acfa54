use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use typeshare::typeshare;

use crate::audio::{CaptureConfig, PipelineConfig, VadConfig, WIRE_SAMPLE_RATE};
use crate::error::{AppError, Result};
use crate::mesh::UdpTransportConfig;
use crate::protocol::LanguageConfig;
use crate::session::SessionConfig;
use crate::translation::WsBridgeConfig;

/// Main application configuration
#[typeshare]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Identity, languages and floor behavior
    pub session: RoomConfig,
    /// Microphone capture and voice detection
    pub audio: AudioConfig,
    /// Speaker output
    pub playback: PlaybackConfig,
    /// LAN transport
    pub mesh: MeshConfig,
    /// Speech translation engine
    pub translation: TranslationConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            session: RoomConfig::default(),
            audio: AudioConfig::default(),
            playback: PlaybackConfig::default(),
            mesh: MeshConfig::default(),
            translation: TranslationConfig::default(),
        }
    }
}

/// Session settings
#[typeshare]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomConfig {
    /// Name shown to other peers
    pub display_name: String,
    /// Room joined when `--room` is not given
    pub room_id: Option<String>,
    /// Language spoken in the room (BCP-47)
    pub source_language: String,
    /// Language the engine translates into (BCP-47)
    pub target_language: String,
    /// Take the floor automatically when speech is detected
    pub auto_floor: bool,
    pub heartbeat_interval_ms: u32,
    /// Playback delay absorbing network jitter
    pub jitter_ms: u32,
    /// Largest translated-audio chunk relayed to guests
    pub bot_chunk_samples: u32,
}

impl Default for RoomConfig {
    fn default() -> Self {
        let languages = LanguageConfig::default();
        Self {
            display_name: std::env::var("USER")
                .ok()
                .filter(|user| !user.trim().is_empty())
                .unwrap_or_else(|| "guest".to_string()),
            room_id: None,
            source_language: languages.source_language,
            target_language: languages.target_language,
            auto_floor: false,
            heartbeat_interval_ms: 2000,
            jitter_ms: 50,
            bot_chunk_samples: 4096,
        }
    }
}

/// Capture configuration
#[typeshare]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Capture from the microphone at all
    pub enabled: bool,
    /// ALSA device name
    pub device: String,
    /// Native capture rate (must not be below the wire rate)
    pub sample_rate: u32,
    pub channels: u32,
    /// Capture frame length
    pub frame_ms: u32,
    /// Rate sent over the mesh and to the engine
    pub wire_rate: u32,
    /// RMS level counted as speech
    pub vad_threshold: f32,
    pub vad_hangover_ms: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            device: "default".to_string(),
            sample_rate: 48000,
            channels: 1,
            frame_ms: 20,
            wire_rate: WIRE_SAMPLE_RATE,
            vad_threshold: 0.02,
            vad_hangover_ms: 500,
        }
    }
}

#[typeshare]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub enabled: bool,
    /// ALSA device name
    pub device: String,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            device: "default".to_string(),
        }
    }
}

/// UDP mesh configuration
#[typeshare]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub bind_address: String,
    /// Shared by every peer on the LAN
    pub port: u16,
    pub broadcast_address: String,
    /// Silence after which a peer counts as gone
    pub peer_timeout_ms: u32,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 47800,
            broadcast_address: "255.255.255.255".to_string(),
            peer_timeout_ms: 8000,
        }
    }
}

#[typeshare]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslationConfig {
    /// Run the engine bridge while this peer is host
    pub enabled: bool,
    /// Engine WebSocket endpoint
    pub url: String,
    pub connect_timeout_ms: u32,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "ws://127.0.0.1:9000/translate".to_string(),
            connect_timeout_ms: 10_000,
        }
    }
}

fn parse_ip(field: &str, value: &str) -> Result<IpAddr> {
    value
        .parse()
        .map_err(|_| AppError::Config(format!("{}: invalid address {:?}", field, value)))
}

impl AppConfig {
    /// Reject settings no session could run with
    pub fn validate(&self) -> Result<()> {
        let audio = &self.audio;
        if audio.wire_rate == 0 || audio.sample_rate == 0 {
            return Err(AppError::Config("audio: sample rates must be non-zero".into()));
        }
        if audio.sample_rate < audio.wire_rate {
            return Err(AppError::Config(format!(
                "audio: capture rate {}Hz is below the wire rate {}Hz",
                audio.sample_rate, audio.wire_rate
            )));
        }
        if audio.channels == 0 {
            return Err(AppError::Config("audio: channels must be at least 1".into()));
        }
        if audio.frame_ms == 0 || audio.sample_rate * audio.frame_ms / 1000 == 0 {
            return Err(AppError::Config("audio: frame_ms must be non-zero".into()));
        }
        if !(0.0..=1.0).contains(&audio.vad_threshold) {
            return Err(AppError::Config(format!(
                "audio: vad_threshold {} is outside 0.0-1.0",
                audio.vad_threshold
            )));
        }

        let session = &self.session;
        if session.display_name.trim().is_empty() {
            return Err(AppError::Config("session: display_name is empty".into()));
        }
        if session.source_language.is_empty() || session.target_language.is_empty() {
            return Err(AppError::Config("session: languages must be set".into()));
        }
        if session.heartbeat_interval_ms == 0 {
            return Err(AppError::Config(
                "session: heartbeat_interval_ms must be non-zero".into(),
            ));
        }
        if session.bot_chunk_samples == 0 {
            return Err(AppError::Config(
                "session: bot_chunk_samples must be non-zero".into(),
            ));
        }

        if self.mesh.port == 0 {
            return Err(AppError::Config("mesh: port must be non-zero".into()));
        }
        parse_ip("mesh.bind_address", &self.mesh.bind_address)?;
        parse_ip("mesh.broadcast_address", &self.mesh.broadcast_address)?;

        if self.translation.enabled && self.translation.url.trim().is_empty() {
            return Err(AppError::Config("translation: url is empty".into()));
        }
        Ok(())
    }

    pub fn languages(&self) -> LanguageConfig {
        LanguageConfig {
            source_language: self.session.source_language.clone(),
            target_language: self.session.target_language.clone(),
        }
    }

    pub fn session_config(&self, room_id: impl Into<String>) -> SessionConfig {
        let session = &self.session;
        SessionConfig {
            room_id: room_id.into(),
            display_name: session.display_name.clone(),
            languages: self.languages(),
            heartbeat_interval: Duration::from_millis(session.heartbeat_interval_ms as u64),
            jitter_latency: Duration::from_millis(session.jitter_ms as u64),
            translation_enabled: self.translation.enabled,
            auto_floor: session.auto_floor,
            bot_chunk_samples: session.bot_chunk_samples as usize,
            wire_rate: self.audio.wire_rate,
            ..Default::default()
        }
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            device: self.audio.device.clone(),
            sample_rate: self.audio.sample_rate,
            channels: self.audio.channels,
            ..Default::default()
        }
        .with_frame_ms(self.audio.frame_ms)
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            source_rate: self.audio.sample_rate,
            wire_rate: self.audio.wire_rate,
            vad: VadConfig {
                threshold: self.audio.vad_threshold,
                hangover: Duration::from_millis(self.audio.vad_hangover_ms as u64),
            },
        }
    }

    pub fn transport_config(&self) -> Result<UdpTransportConfig> {
        let bind = parse_ip("mesh.bind_address", &self.mesh.bind_address)?;
        let broadcast = parse_ip("mesh.broadcast_address", &self.mesh.broadcast_address)?;
        Ok(UdpTransportConfig {
            bind_addr: SocketAddr::new(bind, self.mesh.port),
            broadcast_addr: SocketAddr::new(broadcast, self.mesh.port),
            peer_timeout: Duration::from_millis(self.mesh.peer_timeout_ms as u64),
        })
    }

    pub fn bridge_config(&self) -> WsBridgeConfig {
        WsBridgeConfig {
            url: self.translation.url.clone(),
            sample_rate: self.audio.wire_rate,
            connect_timeout: Duration::from_millis(self.translation.connect_timeout_ms as u64),
        }
    }
}
