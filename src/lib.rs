//! talkstick - push-to-talk voice rooms with live translation
//!
//! Peers on a LAN form a mesh, elect a host and pass a single speaking
//! token around. The host optionally streams the speaker's audio to a
//! translation engine and relays what comes back to everyone.

pub mod audio;
pub mod config;
pub mod error;
pub mod events;
pub mod mesh;
pub mod protocol;
pub mod session;
pub mod translation;
pub mod utils;

pub use error::{AppError, Result};
