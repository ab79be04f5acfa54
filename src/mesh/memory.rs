//! In-process mesh
//!
//! Connects any number of [`MemoryTransport`]s living in one process. Used
//! by the test suite and for local loopback sessions.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::transport::{PeerTransport, TransportEvent, TRANSPORT_CHANNEL_CAPACITY};
use crate::error::{AppError, Result};
use crate::protocol::PeerId;

/// One frame as it left a peer (`to == None` for broadcasts)
#[derive(Debug, Clone)]
pub struct SentFrame {
    pub from: PeerId,
    pub to: Option<PeerId>,
    pub frame: Bytes,
}

#[derive(Default)]
struct MeshInner {
    rooms: HashMap<String, BTreeMap<PeerId, mpsc::Sender<TransportEvent>>>,
    sent: Option<Vec<SentFrame>>,
}

impl MeshInner {
    fn deliver(tx: &mpsc::Sender<TransportEvent>, event: TransportEvent) {
        if let Err(e) = tx.try_send(event) {
            warn!("Memory mesh dropped an event: {}", e);
        }
    }

    fn room_of(&self, id: &PeerId) -> Option<String> {
        self.rooms
            .iter()
            .find(|(_, peers)| peers.contains_key(id))
            .map(|(room, _)| room.clone())
    }

    /// Remove `id` from its room and tell the others; returns its sender
    fn remove(&mut self, id: &PeerId) -> Option<mpsc::Sender<TransportEvent>> {
        let room = self.room_of(id)?;
        let peers = self.rooms.get_mut(&room)?;
        let tx = peers.remove(id);
        for other in peers.values() {
            Self::deliver(other, TransportEvent::PeerLeft(id.clone()));
        }
        if peers.is_empty() {
            self.rooms.remove(&room);
        }
        tx
    }
}

/// Shared hub; clone it to hand out transports
#[derive(Clone, Default)]
pub struct MemoryMesh {
    inner: Arc<Mutex<MeshInner>>,
}

impl MemoryMesh {
    pub fn new() -> Self {
        Self::default()
    }

    /// A mesh that records every frame sent, for inspection with [`sent_frames`](Self::sent_frames)
    pub fn with_recording() -> Self {
        let mesh = Self::new();
        mesh.inner.lock().sent = Some(Vec::new());
        mesh
    }

    pub fn transport(&self, id: impl Into<PeerId>) -> MemoryTransport {
        MemoryTransport {
            mesh: self.clone(),
            id: id.into(),
        }
    }

    /// Frames sent by `from` so far (empty unless recording)
    pub fn sent_frames(&self, from: &PeerId) -> Vec<SentFrame> {
        self.inner
            .lock()
            .sent
            .as_ref()
            .map(|sent| sent.iter().filter(|f| &f.from == from).cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear_recording(&self) {
        if let Some(sent) = self.inner.lock().sent.as_mut() {
            sent.clear();
        }
    }

    /// Ids currently present in `room_id`
    pub fn members(&self, room_id: &str) -> Vec<PeerId> {
        self.inner
            .lock()
            .rooms
            .get(room_id)
            .map(|peers| peers.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Simulate a network failure of `id`: it gets `Disconnected`, the rest see it leave
    pub fn disconnect(&self, id: &PeerId, reason: &str) {
        let mut inner = self.inner.lock();
        if let Some(tx) = inner.remove(id) {
            MeshInner::deliver(&tx, TransportEvent::Disconnected(reason.to_string()));
        }
    }

    fn record(inner: &mut MeshInner, from: &PeerId, to: Option<&PeerId>, frame: &Bytes) {
        if let Some(sent) = inner.sent.as_mut() {
            sent.push(SentFrame {
                from: from.clone(),
                to: to.cloned(),
                frame: frame.clone(),
            });
        }
    }
}

/// One peer's handle onto a [`MemoryMesh`]
pub struct MemoryTransport {
    mesh: MemoryMesh,
    id: PeerId,
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    fn local_id(&self) -> PeerId {
        self.id.clone()
    }

    async fn join(&self, room_id: &str) -> Result<mpsc::Receiver<TransportEvent>> {
        let mut inner = self.mesh.inner.lock();
        if inner.room_of(&self.id).is_some() {
            return Err(AppError::Transport(format!(
                "{} already joined a room",
                self.id
            )));
        }

        let (tx, rx) = mpsc::channel(TRANSPORT_CHANNEL_CAPACITY);
        let peers = inner.rooms.entry(room_id.to_string()).or_default();
        for (other_id, other_tx) in peers.iter() {
            MeshInner::deliver(other_tx, TransportEvent::PeerJoined(self.id.clone()));
            MeshInner::deliver(&tx, TransportEvent::PeerJoined(other_id.clone()));
        }
        peers.insert(self.id.clone(), tx);
        debug!(peer = %self.id, room = room_id, "Joined memory mesh");
        Ok(rx)
    }

    async fn leave(&self) -> Result<()> {
        self.mesh.inner.lock().remove(&self.id);
        Ok(())
    }

    async fn broadcast(&self, frame: Bytes) -> Result<()> {
        let mut inner = self.mesh.inner.lock();
        let room = inner.room_of(&self.id).ok_or(AppError::NotJoined)?;
        MemoryMesh::record(&mut inner, &self.id, None, &frame);
        if let Some(peers) = inner.rooms.get(&room) {
            for (_, tx) in peers.iter().filter(|(id, _)| **id != self.id) {
                MeshInner::deliver(
                    tx,
                    TransportEvent::Message {
                        from: self.id.clone(),
                        frame: frame.clone(),
                    },
                );
            }
        }
        Ok(())
    }

    async fn send_to(&self, peer: &PeerId, frame: Bytes) -> Result<()> {
        let mut inner = self.mesh.inner.lock();
        let room = inner.room_of(&self.id).ok_or(AppError::NotJoined)?;
        let tx = inner
            .rooms
            .get(&room)
            .and_then(|peers| peers.get(peer))
            .cloned()
            .ok_or_else(|| AppError::Transport(format!("peer {} is not in the room", peer)))?;
        MemoryMesh::record(&mut inner, &self.id, Some(peer), &frame);
        MeshInner::deliver(
            &tx,
            TransportEvent::Message {
                from: self.id.clone(),
                frame,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> PeerId {
        PeerId::from(s)
    }

    #[tokio::test]
    async fn test_presence_notifications() {
        let mesh = MemoryMesh::new();
        let a = mesh.transport("a");
        let b = mesh.transport("b");

        let mut rx_a = a.join("ROOM").await.unwrap();
        let mut rx_b = b.join("ROOM").await.unwrap();

        assert_eq!(rx_a.recv().await.unwrap(), TransportEvent::PeerJoined(id("b")));
        assert_eq!(rx_b.recv().await.unwrap(), TransportEvent::PeerJoined(id("a")));

        b.leave().await.unwrap();
        assert_eq!(rx_a.recv().await.unwrap(), TransportEvent::PeerLeft(id("b")));
        assert_eq!(mesh.members("ROOM"), vec![id("a")]);
    }

    #[tokio::test]
    async fn test_broadcast_and_unicast() {
        let mesh = MemoryMesh::with_recording();
        let a = mesh.transport("a");
        let b = mesh.transport("b");
        let c = mesh.transport("c");
        let _rx_a = a.join("R").await.unwrap();
        let mut rx_b = b.join("R").await.unwrap();
        let mut rx_c = c.join("R").await.unwrap();
        // drain presence
        rx_b.recv().await.unwrap();
        rx_b.recv().await.unwrap();
        rx_c.recv().await.unwrap();
        rx_c.recv().await.unwrap();

        a.broadcast(Bytes::from_static(b"hi")).await.unwrap();
        a.send_to(&id("c"), Bytes::from_static(b"psst")).await.unwrap();

        assert_eq!(
            rx_b.recv().await.unwrap(),
            TransportEvent::Message { from: id("a"), frame: Bytes::from_static(b"hi") }
        );
        assert_eq!(
            rx_c.recv().await.unwrap(),
            TransportEvent::Message { from: id("a"), frame: Bytes::from_static(b"hi") }
        );
        assert_eq!(
            rx_c.recv().await.unwrap(),
            TransportEvent::Message { from: id("a"), frame: Bytes::from_static(b"psst") }
        );

        let sent = mesh.sent_frames(&id("a"));
        assert_eq!(sent.len(), 2);
        assert!(sent[0].to.is_none());
        assert_eq!(sent[1].to, Some(id("c")));
    }

    #[tokio::test]
    async fn test_errors_when_not_joined() {
        let mesh = MemoryMesh::new();
        let a = mesh.transport("a");
        assert!(matches!(
            a.broadcast(Bytes::new()).await,
            Err(AppError::NotJoined)
        ));
        let _rx = a.join("R").await.unwrap();
        assert!(a.join("R").await.is_err());
        assert!(a.send_to(&id("ghost"), Bytes::new()).await.is_err());
        a.leave().await.unwrap();
        a.leave().await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect() {
        let mesh = MemoryMesh::new();
        let a = mesh.transport("a");
        let b = mesh.transport("b");
        let mut rx_a = a.join("R").await.unwrap();
        let mut rx_b = b.join("R").await.unwrap();
        rx_a.recv().await.unwrap();
        rx_b.recv().await.unwrap();

        mesh.disconnect(&id("b"), "cable pulled");
        assert_eq!(rx_a.recv().await.unwrap(), TransportEvent::PeerLeft(id("b")));
        assert_eq!(
            rx_b.recv().await.unwrap(),
            TransportEvent::Disconnected("cable pulled".to_string())
        );
    }
}
