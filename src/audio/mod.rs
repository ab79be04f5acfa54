//! Audio capture, processing and playback
//!
//! This module provides:
//! - ALSA microphone capture
//! - Voice activity detection and downsampling to the wire rate
//! - Per-sender playback scheduling with a jitter buffer
//! - ALSA playback output
//! - Audio device enumeration

pub mod capture;
pub mod device;
pub mod output;
pub mod pipeline;
pub mod playback;
pub mod resample;
pub mod vad;

pub use capture::{AudioCapturer, CaptureConfig, CaptureState, CaptureStats};
pub use device::{enumerate_devices, format_device_list, AudioDeviceInfo, DeviceKind};
pub use output::{AlsaOutput, AudioOutput, NullOutput, PlaybackFrame};
pub use pipeline::{AudioPipeline, PipelineConfig, ProcessedFrame, WIRE_SAMPLE_RATE};
pub use playback::{frame_duration, PlaybackScheduler, ScheduledFrame};
pub use resample::{resample_linear, Resampler};
pub use vad::{rms, VadConfig, VadResult, VoiceActivityDetector};
