//! Floor control (the "talking stick")
//!
//! The floor token is nothing more than `RoomState::speaker_id`. Only the
//! host grants it; every peer applies grants and releases it observes.
//! Each operation mutates the room in place and reports what, if anything,
//! must be sent to other peers.

use tracing::{debug, info};

use crate::protocol::{ControlPayload, ControlSignal, PeerId};
use crate::session::state::RoomState;

/// A control message the caller must send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Broadcast(ControlPayload),
    Unicast(PeerId, ControlPayload),
}

/// Local consequence of a host moderation signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Moderation {
    /// The host muted our microphone
    Muted,
    /// The host removed us from the room
    Kicked,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FloorOutcome {
    pub send: Option<Outgoing>,
    pub speaker_changed: bool,
    pub moderation: Option<Moderation>,
}

impl FloorOutcome {
    fn broadcast(control: ControlPayload, speaker_changed: bool) -> Self {
        Self {
            send: Some(Outgoing::Broadcast(control)),
            speaker_changed,
            moderation: None,
        }
    }
}

fn set_speaker(room: &mut RoomState, speaker: Option<PeerId>) -> bool {
    if room.speaker_id == speaker {
        return false;
    }
    room.speaker_id = speaker;
    true
}

/// Host-mediated floor-control state machine
pub struct FloorControl;

impl FloorControl {
    /// The local peer wants to speak
    ///
    /// A host grants itself immediately (one broadcast, no request); a guest
    /// unicasts a request to the host and waits for the grant.
    pub fn request(room: &mut RoomState) -> FloorOutcome {
        if room.holds_floor() {
            return FloorOutcome::default();
        }

        let local = room.local_id.clone();
        if room.is_host() {
            let changed = set_speaker(room, Some(local.clone()));
            info!("Host took the floor");
            return FloorOutcome::broadcast(
                ControlPayload::new(ControlSignal::GrantToken, Some(local)),
                changed,
            );
        }

        debug!(host = %room.host_id, "Requesting floor");
        FloorOutcome {
            send: Some(Outgoing::Unicast(
                room.host_id.clone(),
                ControlPayload::new(ControlSignal::RequestToken, Some(local)),
            )),
            ..Default::default()
        }
    }

    /// The local speaker hands the floor back
    pub fn release(room: &mut RoomState) -> FloorOutcome {
        if !room.holds_floor() {
            return FloorOutcome::default();
        }
        set_speaker(room, None);
        info!("Released the floor");
        FloorOutcome::broadcast(ControlPayload::new(ControlSignal::ReleaseToken, None), true)
    }

    /// Apply a control signal received from `sender`
    pub fn on_signal(room: &mut RoomState, sender: &PeerId, control: &ControlPayload) -> FloorOutcome {
        match control.signal {
            ControlSignal::RequestToken => {
                if !room.is_host() {
                    debug!(from = %sender, "Ignoring floor request: not host");
                    return FloorOutcome::default();
                }
                let requester = control
                    .target_peer_id
                    .clone()
                    .unwrap_or_else(|| sender.clone());
                let changed = set_speaker(room, Some(requester.clone()));
                info!(speaker = %requester, "Granting floor");
                FloorOutcome::broadcast(
                    ControlPayload::new(ControlSignal::GrantToken, Some(requester)),
                    changed,
                )
            }
            ControlSignal::GrantToken => match &control.target_peer_id {
                Some(target) => FloorOutcome {
                    speaker_changed: set_speaker(room, Some(target.clone())),
                    ..Default::default()
                },
                None => FloorOutcome::default(),
            },
            ControlSignal::ReleaseToken => FloorOutcome {
                speaker_changed: set_speaker(room, None),
                ..Default::default()
            },
            ControlSignal::MutePeer => {
                if !Self::targets_local(room, sender, control) {
                    return FloorOutcome::default();
                }
                let mut outcome = Self::release(room);
                outcome.moderation = Some(Moderation::Muted);
                outcome
            }
            ControlSignal::KickPeer => {
                if !Self::targets_local(room, sender, control) {
                    return FloorOutcome::default();
                }
                FloorOutcome {
                    moderation: Some(Moderation::Kicked),
                    ..Default::default()
                }
            }
        }
    }

    /// Departure of the speaker is an implicit release
    pub fn on_peer_left(room: &mut RoomState, id: &PeerId) -> bool {
        if room.speaker_id.as_ref() == Some(id) {
            room.speaker_id = None;
            return true;
        }
        false
    }

    /// Moderation signals only count when sent by the current host at us
    fn targets_local(room: &RoomState, sender: &PeerId, control: &ControlPayload) -> bool {
        room.is_host_peer(sender) && control.target_peer_id.as_ref() == Some(&room.local_id)
    }
}
