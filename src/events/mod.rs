//! Local session notifications
//!
//! The coordinator publishes [`SessionEvent`]s on an [`EventBus`]; the
//! console (or any other front end) subscribes. Events are fire-and-forget:
//! nothing in the session waits on a subscriber.

pub mod types;

pub use types::SessionEvent;

use tokio::sync::broadcast;

/// Events a subscriber may fall behind by before it starts missing them
const BUS_CAPACITY: usize = 256;

/// Fan-out channel for [`SessionEvent`]s. Cloning shares the channel.
///
/// ```no_run
/// use talkstick::events::{EventBus, SessionEvent};
///
/// # async fn demo() {
/// let bus = EventBus::new();
/// let mut floor = bus.subscribe();
/// bus.publish(SessionEvent::FloorChanged { speaker_id: None });
/// assert_eq!(floor.recv().await.unwrap().name(), "floor.changed");
/// # }
/// ```
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    /// Deliver to current subscribers; returns how many will see it
    pub fn publish(&self, event: SessionEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Receive events published from now on (a lagging receiver gets `Lagged`)
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
