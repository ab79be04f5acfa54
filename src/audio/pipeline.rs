//! Capture-side processing: VAD, then resampling to the wire rate
//!
//! Runs synchronously inside the capture loop, once per frame. Nothing here
//! blocks; the only allocation per frame is the emitted sample buffer.

use std::sync::Arc;

use super::resample::Resampler;
use super::vad::{VadConfig, VoiceActivityDetector};
use crate::error::Result;
use crate::utils::Clock;

/// Sample rate of audio on the wire and into the translation bridge
pub const WIRE_SAMPLE_RATE: u32 = 16000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineConfig {
    /// Native capture rate
    pub source_rate: u32,
    /// Output rate (normally [`WIRE_SAMPLE_RATE`])
    pub wire_rate: u32,
    pub vad: VadConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            source_rate: 48000,
            wire_rate: WIRE_SAMPLE_RATE,
            vad: VadConfig::default(),
        }
    }
}

/// A frame ready for transmission
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// RMS of the captured frame, for level meters
    pub volume: f32,
    pub speaking: bool,
}

type FrameCallback = Box<dyn FnMut(ProcessedFrame) + Send>;
type ActivityCallback = Box<dyn FnMut(bool) + Send>;

pub struct AudioPipeline {
    resampler: Resampler,
    vad: VoiceActivityDetector,
    clock: Arc<dyn Clock>,
    on_frame: Option<FrameCallback>,
    on_activity: Option<ActivityCallback>,
}

impl AudioPipeline {
    /// Fails with `UnsupportedResample` if the wire rate exceeds the source rate
    pub fn new(config: PipelineConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        Ok(Self {
            resampler: Resampler::new(config.source_rate, config.wire_rate)?,
            vad: VoiceActivityDetector::new(config.vad),
            clock,
            on_frame: None,
            on_activity: None,
        })
    }

    pub fn on_frame(mut self, f: impl FnMut(ProcessedFrame) + Send + 'static) -> Self {
        self.on_frame = Some(Box::new(f));
        self
    }

    /// Called only on speaking/not-speaking edges
    pub fn on_activity(mut self, f: impl FnMut(bool) + Send + 'static) -> Self {
        self.on_activity = Some(Box::new(f));
        self
    }

    pub fn source_rate(&self) -> u32 {
        self.resampler.source_rate()
    }

    pub fn is_speaking(&self) -> bool {
        self.vad.is_speaking()
    }

    /// Process one captured mono frame at the native rate
    pub fn process(&mut self, samples: &[f32]) {
        let vad = self.vad.process(samples, self.clock.now());

        if let (Some(speaking), Some(cb)) = (vad.transition, self.on_activity.as_mut()) {
            cb(speaking);
        }

        if let Some(cb) = self.on_frame.as_mut() {
            let out = self.resampler.process(samples);
            cb(ProcessedFrame {
                samples: out.to_vec(),
                sample_rate: self.resampler.target_rate(),
                volume: vad.rms,
                speaking: vad.speaking,
            });
        }
    }

    pub fn reset(&mut self) {
        self.vad.reset();
    }
}

/// Downmix interleaved S16LE PCM into mono f32 in [-1, 1]
pub fn s16le_to_mono_f32(data: &[u8], channels: usize, out: &mut Vec<f32>) {
    out.clear();
    let channels = channels.max(1);
    let frame_bytes = channels * 2;
    for frame in data.chunks_exact(frame_bytes) {
        let sum: f32 = frame
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
            .sum();
        out.push(sum / channels as f32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ManualClock;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[test]
    fn test_rejects_upsampling_config() {
        let clock = Arc::new(ManualClock::new());
        let config = PipelineConfig {
            source_rate: 8000,
            ..Default::default()
        };
        assert!(matches!(
            AudioPipeline::new(config, clock),
            Err(crate::error::AppError::UnsupportedResample { .. })
        ));
    }

    #[test]
    fn test_emits_resampled_frames_and_edges() {
        let clock = Arc::new(ManualClock::new());
        let frames = Arc::new(Mutex::new(Vec::new()));
        let edges = Arc::new(Mutex::new(Vec::new()));

        let mut pipeline = AudioPipeline::new(PipelineConfig::default(), clock.clone())
            .unwrap()
            .on_frame({
                let frames = frames.clone();
                move |f| frames.lock().push(f)
            })
            .on_activity({
                let edges = edges.clone();
                move |s| edges.lock().push(s)
            });

        let quiet = vec![0.0f32; 960];
        let loud = vec![0.3f32; 960];
        for frame in [&quiet, &loud, &loud, &quiet] {
            clock.advance(Duration::from_millis(20));
            pipeline.process(frame);
        }
        for _ in 0..40 {
            clock.advance(Duration::from_millis(20));
            pipeline.process(&quiet);
        }

        let frames = frames.lock();
        assert_eq!(frames.len(), 44);
        assert!(frames.iter().all(|f| f.samples.len() == 320 && f.sample_rate == 16000));
        assert!((frames[1].volume - 0.3).abs() < 1e-6);
        assert!(frames[1].speaking);
        assert!(frames[1].samples.iter().all(|s| (*s - 0.3).abs() < 1e-6));
        assert_eq!(*edges.lock(), vec![true, false]);
    }

    #[test]
    fn test_s16le_downmix() {
        // two stereo frames: (max, min) and (half, half)
        let mut data = Vec::new();
        for s in [i16::MAX, i16::MIN, 16384, 16384] {
            data.extend_from_slice(&s.to_le_bytes());
        }
        let mut out = Vec::new();
        s16le_to_mono_f32(&data, 2, &mut out);
        assert_eq!(out.len(), 2);
        assert!(out[0].abs() < 1e-4);
        assert!((out[1] - 0.5).abs() < 1e-6);

        s16le_to_mono_f32(&data, 1, &mut out);
        assert_eq!(out.len(), 4);
        assert!((out[2] - 0.5).abs() < 1e-6);
    }
}
