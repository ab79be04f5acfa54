//! Audio output sinks
//!
//! [`AlsaOutput`] opens one playback PCM per remote stream. Each stream is
//! served by a blocking worker that waits for the scheduled start time,
//! pads scheduling gaps with silence and writes S16 mono samples.

use alsa::pcm::{Access, Format, Frames, HwParams, State, IO};
use alsa::{Direction, ValueOr, PCM};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};
use crate::protocol::PeerId;
use crate::utils::{Clock, LogThrottler, SystemClock};

/// A decoded frame with its slot on the local timeline
#[derive(Debug, Clone)]
pub struct PlaybackFrame {
    pub stream: PeerId,
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// Start time relative to the shared clock origin
    pub start: Duration,
}

pub trait AudioOutput: Send + Sync {
    /// Queue a frame for playback; must not block
    fn play(&self, frame: PlaybackFrame) -> Result<()>;

    /// Release resources held for a stream
    fn close_stream(&self, _stream: &PeerId) {}

    fn close(&self) {}
}

/// Output that discards everything (`--no-playback`)
#[derive(Debug, Default, Clone, Copy)]
pub struct NullOutput;

impl AudioOutput for NullOutput {
    fn play(&self, _frame: PlaybackFrame) -> Result<()> {
        Ok(())
    }
}

const STREAM_QUEUE: usize = 64;
/// Write this far ahead of the scheduled start to cover ALSA startup
const WRITE_LEAD: Duration = Duration::from_millis(10);
/// Larger gaps mean the sender paused; the stream just resumes
const MAX_SILENCE_FILL: Duration = Duration::from_millis(500);

struct StreamWorker {
    sample_rate: u32,
    tx: mpsc::Sender<PlaybackFrame>,
}

pub struct AlsaOutput {
    device: String,
    clock: SystemClock,
    streams: Mutex<HashMap<PeerId, StreamWorker>>,
    throttler: LogThrottler,
}

impl AlsaOutput {
    /// `clock` must be the same clock the scheduler uses
    pub fn new(device: impl Into<String>, clock: SystemClock) -> Self {
        Self {
            device: device.into(),
            clock,
            streams: Mutex::new(HashMap::new()),
            throttler: LogThrottler::with_secs(5),
        }
    }

    fn spawn_worker(&self, stream: &PeerId, sample_rate: u32) -> StreamWorker {
        let (tx, rx) = mpsc::channel(STREAM_QUEUE);
        let device = self.device.clone();
        let clock = self.clock.clone();
        let name = stream.clone();

        info!(
            "Opening playback stream for {} on {} at {}Hz",
            name.short(),
            device,
            sample_rate
        );

        tokio::task::spawn_blocking(move || {
            if let Err(e) = playback_loop(&device, sample_rate, rx, &clock) {
                warn!("Playback stream for {} ended: {}", name.short(), e);
            } else {
                debug!("Playback stream for {} closed", name.short());
            }
        });

        StreamWorker { sample_rate, tx }
    }
}

impl AudioOutput for AlsaOutput {
    fn play(&self, frame: PlaybackFrame) -> Result<()> {
        let mut streams = self.streams.lock();

        let restart = streams
            .get(&frame.stream)
            .map(|w| w.sample_rate != frame.sample_rate || w.tx.is_closed())
            .unwrap_or(true);
        if restart {
            let worker = self.spawn_worker(&frame.stream, frame.sample_rate);
            streams.insert(frame.stream.clone(), worker);
        }

        let Some(worker) = streams.get(&frame.stream) else {
            return Ok(());
        };
        match worker.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(frame)) => {
                let key = format!("playback_full_{}", frame.stream);
                if self.throttler.should_log(&key) {
                    warn!("Playback queue full for {}, dropping frame", frame.stream.short());
                }
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(AppError::AudioError("playback stream closed".to_string()))
            }
        }
    }

    fn close_stream(&self, stream: &PeerId) {
        // dropping the sender ends the worker
        self.streams.lock().remove(stream);
    }

    fn close(&self) {
        self.streams.lock().clear();
    }
}

fn open_playback(device: &str, sample_rate: u32) -> Result<PCM> {
    let pcm = PCM::new(device, Direction::Playback, false).map_err(|e| {
        AppError::AudioError(format!("Failed to open playback device {}: {}", device, e))
    })?;

    {
        let hwp = HwParams::any(&pcm)
            .map_err(|e| AppError::AudioError(format!("Failed to get HwParams: {}", e)))?;
        hwp.set_channels(1)
            .map_err(|e| AppError::AudioError(format!("Failed to set channels: {}", e)))?;
        hwp.set_rate(sample_rate, ValueOr::Nearest)
            .map_err(|e| AppError::AudioError(format!("Failed to set sample rate: {}", e)))?;
        hwp.set_format(Format::s16())
            .map_err(|e| AppError::AudioError(format!("Failed to set format: {}", e)))?;
        hwp.set_access(Access::RWInterleaved)
            .map_err(|e| AppError::AudioError(format!("Failed to set access: {}", e)))?;
        hwp.set_buffer_size_near((sample_rate / 5) as Frames)
            .map_err(|e| AppError::AudioError(format!("Failed to set buffer size: {}", e)))?;
        pcm.hw_params(&hwp)
            .map_err(|e| AppError::AudioError(format!("Failed to apply hw params: {}", e)))?;
    }

    pcm.prepare()
        .map_err(|e| AppError::AudioError(format!("Failed to prepare PCM: {}", e)))?;
    Ok(pcm)
}

fn to_s16(samples: &[f32], out: &mut Vec<i16>) {
    out.clear();
    out.extend(
        samples
            .iter()
            .map(|s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16),
    );
}

fn write_all(pcm: &PCM, io: &IO<i16>, mut buf: &[i16]) -> Result<()> {
    while !buf.is_empty() {
        if pcm.state() == State::XRun {
            debug!("Playback underrun, recovering");
            let _ = pcm.prepare();
        }
        match io.writei(buf) {
            Ok(n) => buf = &buf[n..],
            Err(e) => {
                pcm.try_recover(e, true)
                    .map_err(|e| AppError::AudioError(format!("Playback write failed: {}", e)))?;
            }
        }
    }
    Ok(())
}

fn playback_loop(
    device: &str,
    sample_rate: u32,
    mut rx: mpsc::Receiver<PlaybackFrame>,
    clock: &SystemClock,
) -> Result<()> {
    let pcm = open_playback(device, sample_rate)?;
    let io = pcm.io_i16().map_err(|e| AppError::AudioError(e.to_string()))?;

    let mut pcm_buf = Vec::new();
    let mut written_until: Option<Duration> = None;

    while let Some(frame) = rx.blocking_recv() {
        if frame.sample_rate != sample_rate {
            continue;
        }

        // Pad a short gap so the device keeps running; a long one is a pause
        let gap = written_until.map(|until| frame.start.saturating_sub(until));
        match gap {
            Some(gap) if !gap.is_zero() && gap <= MAX_SILENCE_FILL => {
                let silent = (gap.as_secs_f64() * sample_rate as f64) as usize;
                write_all(&pcm, &io, &vec![0i16; silent])?;
            }
            _ => {
                let wake = frame.start.saturating_sub(WRITE_LEAD);
                let now = clock.now();
                if wake > now {
                    std::thread::sleep(wake - now);
                }
            }
        }

        to_s16(&frame.samples, &mut pcm_buf);
        write_all(&pcm, &io, &pcm_buf)?;
        written_until = Some(
            frame.start + super::playback::frame_duration(frame.samples.len(), sample_rate),
        );
    }

    let _ = pcm.drain();
    Ok(())
}
