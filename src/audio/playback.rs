//! Per-sender playback scheduling
//!
//! Each remote stream keeps a cursor on the local clock. Frames are placed
//! back to back; when a stream has fallen behind (or is new) the cursor is
//! pulled forward to `now + jitter_latency` to absorb network jitter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::protocol::PeerId;
use crate::utils::Clock;

/// Where a frame lands on the local playback timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledFrame {
    pub start: Duration,
    pub duration: Duration,
}

impl ScheduledFrame {
    pub fn end(&self) -> Duration {
        self.start + self.duration
    }
}

/// Playback duration of `samples` at `sample_rate`
pub fn frame_duration(samples: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(samples as u64 * 1_000_000_000 / sample_rate as u64)
}

pub struct PlaybackScheduler {
    clock: Arc<dyn Clock>,
    jitter_latency: Duration,
    cursors: HashMap<PeerId, Duration>,
}

impl PlaybackScheduler {
    pub fn new(clock: Arc<dyn Clock>, jitter_latency: Duration) -> Self {
        Self {
            clock,
            jitter_latency,
            cursors: HashMap::new(),
        }
    }

    pub fn jitter_latency(&self) -> Duration {
        self.jitter_latency
    }

    /// Reserve the next slot for `stream` and advance its cursor
    pub fn schedule(&mut self, stream: &PeerId, samples: usize, sample_rate: u32) -> ScheduledFrame {
        let now = self.clock.now();
        let duration = frame_duration(samples, sample_rate);

        let cursor = self.cursors.entry(stream.clone()).or_insert(now);
        if *cursor <= now {
            *cursor = now + self.jitter_latency;
        }

        let start = *cursor;
        *cursor = start + duration;

        ScheduledFrame { start, duration }
    }

    /// Current cursor of a stream, if it has played anything
    pub fn cursor(&self, stream: &PeerId) -> Option<Duration> {
        self.cursors.get(stream).copied()
    }

    /// Drop a stream's cursor (peer left)
    pub fn forget(&mut self, stream: &PeerId) {
        self.cursors.remove(stream);
    }

    pub fn clear(&mut self) {
        self.cursors.clear();
    }

    pub fn stream_count(&self) -> usize {
        self.cursors.len()
    }
}
