//! Peer transport capability
//!
//! The transport is opaque to the rest of the crate: it moves encoded frames
//! between peers of one room and reports presence. Inbound traffic is
//! delivered in arrival order on a single channel handed out by `join`.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::protocol::PeerId;

/// Capacity of the inbound channel returned by [`PeerTransport::join`]
pub const TRANSPORT_CHANNEL_CAPACITY: usize = 512;

/// Presence and message notifications from the mesh
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    PeerJoined(PeerId),
    PeerLeft(PeerId),
    Message { from: PeerId, frame: Bytes },
    /// The transport lost the mesh; no further events follow
    Disconnected(String),
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Id assigned to the local peer
    fn local_id(&self) -> PeerId;

    /// Join a room; the returned receiver is the only inbound event stream
    async fn join(&self, room_id: &str) -> Result<mpsc::Receiver<TransportEvent>>;

    /// Leave the current room. Idempotent.
    async fn leave(&self) -> Result<()>;

    /// Send a frame to every other peer in the room
    async fn broadcast(&self, frame: Bytes) -> Result<()>;

    /// Send a frame to a single peer
    async fn send_to(&self, peer: &PeerId, frame: Bytes) -> Result<()>;
}
