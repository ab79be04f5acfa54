//! Energy-based voice activity detection
//!
//! A frame whose RMS exceeds the threshold switches to "speaking" at once;
//! switching back needs the signal to stay below threshold for longer than
//! the hangover window, so short pauses between words do not flap.

use std::time::Duration;

/// VAD tuning
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadConfig {
    /// RMS level (0.0-1.0) above which a frame counts as speech
    pub threshold: f32,
    /// Silence needed before reporting "not speaking"
    pub hangover: Duration,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 0.02,
            hangover: Duration::from_millis(500),
        }
    }
}

/// Root-mean-square level of a frame (0.0 for an empty frame)
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    (sum / samples.len() as f64).sqrt() as f32
}

/// Per-frame result
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadResult {
    pub rms: f32,
    pub speaking: bool,
    /// `Some(state)` only on a transition edge
    pub transition: Option<bool>,
}

pub struct VoiceActivityDetector {
    config: VadConfig,
    speaking: bool,
    last_activity: Option<Duration>,
}

impl VoiceActivityDetector {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            speaking: false,
            last_activity: None,
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    pub fn config(&self) -> &VadConfig {
        &self.config
    }

    /// Classify one frame captured at `now`
    pub fn process(&mut self, samples: &[f32], now: Duration) -> VadResult {
        let level = rms(samples);
        let transition = self.update(level, now);
        VadResult {
            rms: level,
            speaking: self.speaking,
            transition,
        }
    }

    /// Feed a precomputed RMS level; returns the new state on an edge
    pub fn update(&mut self, level: f32, now: Duration) -> Option<bool> {
        if level > self.config.threshold {
            self.last_activity = Some(now);
            if !self.speaking {
                self.speaking = true;
                return Some(true);
            }
            return None;
        }

        if self.speaking {
            let quiet_for = self
                .last_activity
                .map(|t| now.saturating_sub(t))
                .unwrap_or(Duration::MAX);
            if quiet_for > self.config.hangover {
                self.speaking = false;
                return Some(false);
            }
        }
        None
    }

    pub fn reset(&mut self) {
        self.speaking = false;
        self.last_activity = None;
    }
}
