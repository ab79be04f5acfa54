//! LAN mesh over UDP broadcast
//!
//! Every datagram is a one-line JSON header, a `\n`, then the opaque frame.
//! Peers are discovered from the first datagram they send (a `hello` on
//! join, then the session heartbeats) and dropped after `peer_timeout` of
//! silence or on an explicit `bye`.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::transport::{PeerTransport, TransportEvent, TRANSPORT_CHANNEL_CAPACITY};
use crate::error::{AppError, Result};
use crate::protocol::PeerId;
use crate::utils::{bind_udp_socket, LogThrottler};

/// Largest datagram we attempt to receive
const MAX_DATAGRAM: usize = 65_507;

#[derive(Debug, Clone)]
pub struct UdpTransportConfig {
    /// Local bind address (e.g. 0.0.0.0:47800)
    pub bind_addr: SocketAddr,
    /// Where broadcasts go (e.g. 255.255.255.255:47800)
    pub broadcast_addr: SocketAddr,
    /// Silence after which a peer is considered gone
    pub peer_timeout: Duration,
}

impl Default for UdpTransportConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 47800)),
            broadcast_addr: SocketAddr::from(([255, 255, 255, 255], 47800)),
            peer_timeout: Duration::from_secs(8),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum DatagramKind {
    Hello,
    Data,
    Bye,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct DatagramHeader {
    room: String,
    from: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    to: Option<PeerId>,
    kind: DatagramKind,
}

fn encode_datagram(header: &DatagramHeader, frame: &[u8]) -> Result<Vec<u8>> {
    let mut out = serde_json::to_vec(header)?;
    out.push(b'\n');
    out.extend_from_slice(frame);
    Ok(out)
}

fn decode_datagram(buf: &[u8]) -> Option<(DatagramHeader, &[u8])> {
    let split = buf.iter().position(|b| *b == b'\n')?;
    let header = serde_json::from_slice(&buf[..split]).ok()?;
    Some((header, &buf[split + 1..]))
}

struct PeerEntry {
    addr: SocketAddr,
    last_seen: Instant,
}

type PeerTable = Arc<Mutex<HashMap<PeerId, PeerEntry>>>;

struct Joined {
    room: String,
    socket: Arc<UdpSocket>,
    peers: PeerTable,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// UDP broadcast implementation of [`PeerTransport`]
pub struct UdpTransport {
    id: PeerId,
    config: UdpTransportConfig,
    joined: tokio::sync::Mutex<Option<Joined>>,
    throttler: Arc<LogThrottler>,
}

impl UdpTransport {
    pub fn new(config: UdpTransportConfig) -> Self {
        Self::with_id(PeerId::random(), config)
    }

    pub fn with_id(id: PeerId, config: UdpTransportConfig) -> Self {
        Self {
            id,
            config,
            joined: tokio::sync::Mutex::new(None),
            throttler: Arc::new(LogThrottler::with_secs(5)),
        }
    }

    /// Address the socket is bound to while joined
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let joined = self.joined.lock().await;
        joined.as_ref().and_then(|j| j.socket.local_addr().ok())
    }

    fn header(&self, room: &str, to: Option<PeerId>, kind: DatagramKind) -> DatagramHeader {
        DatagramHeader {
            room: room.to_string(),
            from: self.id.clone(),
            to,
            kind,
        }
    }
}

async fn send_datagram(socket: &UdpSocket, datagram: &[u8], addr: SocketAddr) -> Result<()> {
    socket
        .send_to(datagram, addr)
        .await
        .map_err(|e| AppError::Transport(format!("send to {} failed: {}", addr, e)))?;
    Ok(())
}

struct RecvContext {
    local_id: PeerId,
    room: String,
    socket: Arc<UdpSocket>,
    peers: PeerTable,
    events: mpsc::Sender<TransportEvent>,
    throttler: Arc<LogThrottler>,
}

impl RecvContext {
    async fn handle(&self, buf: &[u8], src: SocketAddr) {
        let Some((header, frame)) = decode_datagram(buf) else {
            if self.throttler.should_log("udp_bad_datagram") {
                debug!("Dropping undecodable datagram from {}", src);
            }
            return;
        };
        if header.from == self.local_id || header.room != self.room {
            return;
        }
        if header.to.as_ref().is_some_and(|to| *to != self.local_id) {
            return;
        }

        if header.kind == DatagramKind::Bye {
            let known = self.peers.lock().remove(&header.from).is_some();
            if known {
                debug!(peer = %header.from, "Peer said bye");
                let _ = self.events.send(TransportEvent::PeerLeft(header.from)).await;
            }
            return;
        }

        let is_new = self
            .peers
            .lock()
            .insert(
                header.from.clone(),
                PeerEntry {
                    addr: src,
                    last_seen: Instant::now(),
                },
            )
            .is_none();

        match header.kind {
            DatagramKind::Hello if is_new => {
                // Answer so the newcomer learns about us without waiting for a heartbeat
                let reply = DatagramHeader {
                    room: self.room.clone(),
                    from: self.local_id.clone(),
                    to: Some(header.from.clone()),
                    kind: DatagramKind::Hello,
                };
                if let Ok(datagram) = encode_datagram(&reply, &[]) {
                    let _ = self.socket.send_to(&datagram, src).await;
                }
            }
            _ => {}
        }

        if is_new {
            info!(peer = %header.from, addr = %src, "Peer discovered");
            let _ = self
                .events
                .send(TransportEvent::PeerJoined(header.from.clone()))
                .await;
        }

        if header.kind == DatagramKind::Data && !frame.is_empty() {
            let _ = self
                .events
                .send(TransportEvent::Message {
                    from: header.from,
                    frame: Bytes::copy_from_slice(frame),
                })
                .await;
        }
    }
}

async fn recv_loop(ctx: RecvContext, cancel: CancellationToken) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = ctx.socket.recv_from(&mut buf) => match result {
                Ok((len, src)) => {
                    // Delivery may wait on a full channel; leaving must still interrupt it
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ctx.handle(&buf[..len], src) => {}
                    }
                }
                Err(e) => {
                    warn!("UDP mesh receive failed: {}", e);
                    let _ = ctx.events.send(TransportEvent::Disconnected(e.to_string())).await;
                    break;
                }
            }
        }
    }
}

async fn sweep_loop(
    peers: PeerTable,
    timeout: Duration,
    events: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval((timeout / 4).max(Duration::from_millis(100)));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let expired: Vec<PeerId> = {
                    let mut peers = peers.lock();
                    let now = Instant::now();
                    let gone: Vec<PeerId> = peers
                        .iter()
                        .filter(|(_, p)| now.duration_since(p.last_seen) > timeout)
                        .map(|(id, _)| id.clone())
                        .collect();
                    for id in &gone {
                        peers.remove(id);
                    }
                    gone
                };
                for id in expired {
                    info!(peer = %id, "Peer timed out");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = events.send(TransportEvent::PeerLeft(id)) => {}
                    }
                }
            }
        }
    }
}

#[async_trait]
impl PeerTransport for UdpTransport {
    fn local_id(&self) -> PeerId {
        self.id.clone()
    }

    async fn join(&self, room_id: &str) -> Result<mpsc::Receiver<TransportEvent>> {
        let mut joined = self.joined.lock().await;
        if joined.is_some() {
            return Err(AppError::Transport("already joined a room".to_string()));
        }

        let std_socket = bind_udp_socket(self.config.bind_addr).map_err(|e| {
            AppError::Transport(format!("bind {} failed: {}", self.config.bind_addr, e))
        })?;
        let socket = Arc::new(
            UdpSocket::from_std(std_socket)
                .map_err(|e| AppError::Transport(format!("socket setup failed: {}", e)))?,
        );

        let (tx, rx) = mpsc::channel(TRANSPORT_CHANNEL_CAPACITY);
        let peers: PeerTable = Arc::new(Mutex::new(HashMap::new()));
        let cancel = CancellationToken::new();

        let recv = tokio::spawn(recv_loop(
            RecvContext {
                local_id: self.id.clone(),
                room: room_id.to_string(),
                socket: socket.clone(),
                peers: peers.clone(),
                events: tx.clone(),
                throttler: self.throttler.clone(),
            },
            cancel.clone(),
        ));
        let sweep = tokio::spawn(sweep_loop(
            peers.clone(),
            self.config.peer_timeout,
            tx,
            cancel.clone(),
        ));

        let hello = encode_datagram(&self.header(room_id, None, DatagramKind::Hello), &[])?;
        if let Err(e) = send_datagram(&socket, &hello, self.config.broadcast_addr).await {
            cancel.cancel();
            return Err(e);
        }

        info!(
            peer = %self.id,
            room = room_id,
            bind = %self.config.bind_addr,
            "Joined LAN mesh"
        );

        *joined = Some(Joined {
            room: room_id.to_string(),
            socket,
            peers,
            cancel,
            tasks: vec![recv, sweep],
        });
        Ok(rx)
    }

    async fn leave(&self) -> Result<()> {
        let Some(joined) = self.joined.lock().await.take() else {
            return Ok(());
        };

        let bye = encode_datagram(&self.header(&joined.room, None, DatagramKind::Bye), &[])?;
        if let Err(e) = send_datagram(&joined.socket, &bye, self.config.broadcast_addr).await {
            debug!("Could not announce departure: {}", e);
        }

        joined.cancel.cancel();
        for task in joined.tasks {
            let _ = task.await;
        }
        joined.peers.lock().clear();
        info!(room = %joined.room, "Left LAN mesh");
        Ok(())
    }

    async fn broadcast(&self, frame: Bytes) -> Result<()> {
        let joined = self.joined.lock().await;
        let joined = joined.as_ref().ok_or(AppError::NotJoined)?;
        let datagram = encode_datagram(&self.header(&joined.room, None, DatagramKind::Data), &frame)?;
        send_datagram(&joined.socket, &datagram, self.config.broadcast_addr).await
    }

    async fn send_to(&self, peer: &PeerId, frame: Bytes) -> Result<()> {
        let joined = self.joined.lock().await;
        let joined = joined.as_ref().ok_or(AppError::NotJoined)?;
        let addr = joined
            .peers
            .lock()
            .get(peer)
            .map(|p| p.addr)
            .ok_or_else(|| AppError::Transport(format!("unknown peer {}", peer)))?;
        let datagram = encode_datagram(
            &self.header(&joined.room, Some(peer.clone()), DatagramKind::Data),
            &frame,
        )?;
        send_datagram(&joined.socket, &datagram, addr).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datagram_round_trip() {
        let header = DatagramHeader {
            room: "ABC".to_string(),
            from: PeerId::from("p1"),
            to: Some(PeerId::from("p2")),
            kind: DatagramKind::Data,
        };
        let frame = br#"{"type":"HEARTBEAT","senderId":"p1","timestamp":1}"#;
        let datagram = encode_datagram(&header, frame).unwrap();

        let (decoded, body) = decode_datagram(&datagram).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(body, frame);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_datagram(b"no newline here").is_none());
        assert!(decode_datagram(b"{not json}\nbody").is_none());
    }

    #[tokio::test]
    async fn test_join_and_leave_lifecycle() {
        let transport = UdpTransport::with_id(
            PeerId::from("solo"),
            UdpTransportConfig {
                bind_addr: "127.0.0.1:0".parse().unwrap(),
                broadcast_addr: "127.0.0.1:9".parse().unwrap(),
                peer_timeout: Duration::from_secs(1),
            },
        );

        assert!(matches!(
            transport.broadcast(Bytes::new()).await,
            Err(AppError::NotJoined)
        ));

        let _rx = transport.join("ROOM").await.unwrap();
        assert!(transport.local_addr().await.is_some());
        assert!(transport.join("ROOM").await.is_err());
        assert!(transport.send_to(&PeerId::from("ghost"), Bytes::new()).await.is_err());

        transport.leave().await.unwrap();
        assert!(transport.local_addr().await.is_none());
        transport.leave().await.unwrap();
    }
}
