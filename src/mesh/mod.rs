//! Peer mesh coordination
//!
//! This module provides:
//! - The [`PeerTransport`] capability and two implementations
//!   (in-process [`MemoryMesh`], LAN [`UdpTransport`])
//! - Deterministic host election ([`LeaderElector`])
//! - The floor-control state machine ([`FloorControl`])

pub mod election;
pub mod floor;
pub mod memory;
pub mod transport;
pub mod udp;

pub use election::LeaderElector;
pub use floor::{FloorControl, FloorOutcome, Moderation, Outgoing};
pub use memory::{MemoryMesh, MemoryTransport, SentFrame};
pub use transport::{PeerTransport, TransportEvent, TRANSPORT_CHANNEL_CAPACITY};
pub use udp::{UdpTransport, UdpTransportConfig};
