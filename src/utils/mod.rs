//! Shared utilities: time sources, log throttling, socket helpers.

pub mod clock;
pub mod net;
pub mod throttle;

pub use clock::{Clock, ManualClock, SystemClock};
pub use net::bind_udp_socket;
pub use throttle::LogThrottler;
