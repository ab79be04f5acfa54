use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Not joined to a room")]
    NotJoined,

    #[error("Audio error: {0}")]
    AudioError(String),

    #[error("Unsupported resampling from {from}Hz to {to}Hz (upsampling is not supported)")]
    UnsupportedResample { from: u32, to: u32 },

    #[error("Translation bridge error: {0}")]
    Translation(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation requires the host role")]
    NotHost,

    #[error("Session is closed")]
    SessionClosed,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AppError {
    /// Short machine-readable code, used in bus events and log fields
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Transport(_) => "transport",
            AppError::NotJoined => "not_joined",
            AppError::AudioError(_) => "audio",
            AppError::UnsupportedResample { .. } => "unsupported_resample",
            AppError::Translation(_) => "translation",
            AppError::Protocol(_) => "protocol",
            AppError::Config(_) => "config",
            AppError::NotHost => "not_host",
            AppError::SessionClosed => "session_closed",
            AppError::BadRequest(_) => "bad_request",
            AppError::Io(_) => "io",
            AppError::Serialization(_) => "serialization",
        }
    }
}

/// Result type alias used across the crate
pub type Result<T> = std::result::Result<T, AppError>;
