//! Room session
//!
//! This module provides:
//! - [`RoomState`], the local view of the room
//! - [`SessionCoordinator`], the task that owns and mutates it
//! - The conversation [`Transcript`]
//! - Room code helpers

pub mod coordinator;
pub mod room;
pub mod state;
pub mod transcript;

pub use coordinator::{AudioSender, SessionConfig, SessionCoordinator, SessionDeps, SessionHandle};
pub use room::{generate_room_code, normalize_room_id, ROOM_CODE_LEN};
pub use state::{Peer, Role, RoomState};
pub use transcript::{Transcript, TranscriptEntry, TranscriptKind};
