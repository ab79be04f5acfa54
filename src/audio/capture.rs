//! ALSA microphone capture
//!
//! Frames are read on a blocking thread, downmixed to mono f32 and handed
//! to an [`AudioPipeline`]. Opening the device happens before `start`
//! returns so a missing microphone surfaces as an error to the caller.

use alsa::pcm::{Access, Format, Frames, HwParams, State, IO};
use alsa::{Direction, ValueOr, PCM};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::pipeline::{s16le_to_mono_f32, AudioPipeline};
use crate::error::{AppError, Result};
use crate::utils::LogThrottler;

const S16_BYTES: usize = 2;

/// Back-to-back read failures tolerated before the device is declared gone
const MAX_CONSECUTIVE_READ_ERRORS: u32 = 50;
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// ALSA PCM name, e.g. "default" or "plughw:1,0"
    pub device: String,
    pub sample_rate: u32,
    /// Interleaved channels delivered by the device (downmixed to mono)
    pub channels: u32,
    /// Samples per channel handed to the pipeline at a time
    pub frame_samples: u32,
    pub buffer_size: u32,
    pub period_size: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: "default".to_string(),
            sample_rate: 48000,
            channels: 1,
            frame_samples: 960,
            buffer_size: 4096,
            period_size: 960,
        }
    }
}

impl CaptureConfig {
    /// Size frames (and the ALSA period) to `ms` milliseconds
    pub fn with_frame_ms(mut self, ms: u32) -> Self {
        self.frame_samples = self.sample_rate * ms / 1000;
        self.period_size = self.frame_samples;
        self
    }

    /// Raw S16LE bytes in one frame across all channels
    pub fn frame_bytes(&self) -> usize {
        self.frame_samples as usize * self.channels as usize * S16_BYTES
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Running,
    /// The device failed after opening; see logs
    Failed,
}

/// Counters snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub frames: u64,
    pub overruns: u64,
    pub read_errors: u64,
}

#[derive(Default)]
struct Counters {
    frames: AtomicU64,
    overruns: AtomicU64,
    read_errors: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn snapshot(&self) -> CaptureStats {
        CaptureStats {
            frames: self.frames.load(AtomicOrdering::Relaxed),
            overruns: self.overruns.load(AtomicOrdering::Relaxed),
            read_errors: self.read_errors.load(AtomicOrdering::Relaxed),
        }
    }
}

/// Tracks back-to-back read failures; any good read resets it
#[derive(Default)]
struct ReadFailures {
    consecutive: u32,
}

impl ReadFailures {
    fn succeeded(&mut self) {
        self.consecutive = 0;
    }

    /// Record a failure; `Err` once the streak reaches the limit
    fn failed(&mut self, error: impl Display) -> Result<()> {
        self.consecutive += 1;
        if self.consecutive >= MAX_CONSECUTIVE_READ_ERRORS {
            return Err(AppError::AudioError(format!(
                "microphone read failed {} times in a row: {}",
                self.consecutive, error
            )));
        }
        Ok(())
    }
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct AudioCapturer {
    config: CaptureConfig,
    state_tx: Arc<watch::Sender<CaptureState>>,
    counters: Arc<Counters>,
    running: AsyncMutex<Option<Running>>,
}

impl AudioCapturer {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            state_tx: Arc::new(watch::Sender::new(CaptureState::Idle)),
            counters: Arc::new(Counters::default()),
            running: AsyncMutex::new(None),
        }
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn state(&self) -> CaptureState {
        *self.state_tx.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<CaptureState> {
        self.state_tx.subscribe()
    }

    pub fn stats(&self) -> CaptureStats {
        self.counters.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.state() == CaptureState::Running
    }

    /// Open the device and start feeding `pipeline`
    ///
    /// Device errors are returned here rather than logged from the thread.
    pub async fn start(&self, pipeline: AudioPipeline) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            debug!("Capture already running");
            return Ok(());
        }
        if pipeline.source_rate() != self.config.sample_rate {
            return Err(AppError::AudioError(format!(
                "pipeline expects {}Hz but {} captures at {}Hz",
                pipeline.source_rate(),
                self.config.device,
                self.config.sample_rate
            )));
        }

        let cancel = CancellationToken::new();
        let (opened_tx, opened_rx) = oneshot::channel();
        let worker = CaptureWorker {
            config: self.config.clone(),
            pipeline,
            state_tx: self.state_tx.clone(),
            counters: self.counters.clone(),
            cancel: cancel.clone(),
        };
        let task = tokio::task::spawn_blocking(move || worker.run(opened_tx));

        let opened = opened_rx
            .await
            .unwrap_or_else(|_| Err(AppError::AudioError("capture thread exited".to_string())));
        if let Err(e) = opened {
            let _ = task.await;
            return Err(e);
        }

        info!(
            device = %self.config.device,
            "Microphone open: {}Hz, {} channel(s)",
            self.config.sample_rate, self.config.channels
        );
        *running = Some(Running { cancel, task });
        Ok(())
    }

    /// Stop capturing; the device is closed when this returns
    pub async fn stop(&self) -> Result<()> {
        let Some(Running { cancel, task }) = self.running.lock().await.take() else {
            return Ok(());
        };
        cancel.cancel();
        task.await
            .map_err(|e| AppError::AudioError(format!("capture thread panicked: {}", e)))?;
        self.state_tx.send_replace(CaptureState::Idle);
        info!("Microphone closed");
        Ok(())
    }
}

/// Everything the blocking capture thread owns
struct CaptureWorker {
    config: CaptureConfig,
    pipeline: AudioPipeline,
    state_tx: Arc<watch::Sender<CaptureState>>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
}

impl CaptureWorker {
    fn run(mut self, opened: oneshot::Sender<Result<()>>) {
        let pcm = match open_pcm(&self.config) {
            Ok(pcm) => pcm,
            Err(e) => {
                let _ = opened.send(Err(e));
                return;
            }
        };
        let _ = opened.send(Ok(()));
        self.state_tx.send_replace(CaptureState::Running);

        let next = match self.read_until_cancelled(&pcm) {
            Ok(()) => CaptureState::Idle,
            Err(e) => {
                error!("Microphone capture failed: {}", e);
                CaptureState::Failed
            }
        };
        self.state_tx.send_replace(next);
        // pcm is dropped (and the device closed) before the task completes
    }

    fn read_until_cancelled(&mut self, pcm: &PCM) -> Result<()> {
        let channels = self.config.channels as usize;
        let mut raw = vec![0u8; self.config.frame_bytes()];
        let mut mono = Vec::with_capacity(self.config.frame_samples as usize);
        // non-mmap IO; USB microphones rarely support mmap access
        let io: IO<u8> = pcm.io_bytes();
        let mut failures = ReadFailures::default();
        let throttler = LogThrottler::with_secs(5);

        while !self.cancel.is_cancelled() {
            match pcm.state() {
                State::XRun => {
                    self.recover_overrun(pcm);
                    continue;
                }
                State::Suspended => {
                    warn!("Microphone suspended, resuming");
                    if pcm.resume().is_err() {
                        let _ = pcm.prepare();
                    }
                    continue;
                }
                State::Disconnected => {
                    return Err(AppError::AudioError("microphone disconnected".to_string()));
                }
                _ => {}
            }

            match io.readi(&mut raw) {
                Ok(0) => {}
                Ok(frames) => {
                    failures.succeeded();
                    let bytes = frames * channels * S16_BYTES;
                    s16le_to_mono_f32(&raw[..bytes], channels, &mut mono);
                    self.pipeline.process(&mono);
                    Counters::bump(&self.counters.frames);
                }
                Err(e) if e.errno() == nix::errno::Errno::EPIPE as i32 => {
                    self.recover_overrun(pcm);
                }
                Err(e) => {
                    Counters::bump(&self.counters.read_errors);
                    if let Some(suppressed) = throttler.check("capture_read") {
                        warn!("Microphone read failed: {} ({} similar suppressed)", e, suppressed);
                    }
                    failures.failed(&e)?;
                    std::thread::sleep(READ_ERROR_BACKOFF);
                }
            }
        }
        Ok(())
    }

    fn recover_overrun(&self, pcm: &PCM) {
        Counters::bump(&self.counters.overruns);
        debug!("Capture overrun, re-preparing device");
        let _ = pcm.prepare();
    }
}

fn open_pcm(config: &CaptureConfig) -> Result<PCM> {
    let alsa_err = |what: &str, e: alsa::Error| {
        AppError::AudioError(format!("{} ({}): {}", what, config.device, e))
    };

    let pcm = PCM::new(&config.device, Direction::Capture, false)
        .map_err(|e| alsa_err("open capture device", e))?;
    {
        let hwp = HwParams::any(&pcm).map_err(|e| alsa_err("query hw params", e))?;
        hwp.set_access(Access::RWInterleaved)
            .map_err(|e| alsa_err("interleaved access", e))?;
        hwp.set_format(Format::s16())
            .map_err(|e| alsa_err("S16 format", e))?;
        hwp.set_channels(config.channels)
            .map_err(|e| alsa_err("channel count", e))?;
        hwp.set_rate(config.sample_rate, ValueOr::Nearest)
            .map_err(|e| alsa_err("sample rate", e))?;
        hwp.set_period_size_near(config.period_size as Frames, ValueOr::Nearest)
            .map_err(|e| alsa_err("period size", e))?;
        hwp.set_buffer_size_near(config.buffer_size as Frames)
            .map_err(|e| alsa_err("buffer size", e))?;
        pcm.hw_params(&hwp).map_err(|e| alsa_err("apply hw params", e))?;
    }

    // Nearest may have picked another rate; the pipeline cannot follow it
    let rate = pcm
        .hw_params_current()
        .and_then(|hwp| hwp.get_rate())
        .map_err(|e| alsa_err("read back rate", e))?;
    if rate != config.sample_rate {
        return Err(AppError::AudioError(format!(
            "{} only offers {}Hz (wanted {}Hz)",
            config.device, rate, config.sample_rate
        )));
    }

    pcm.prepare().map_err(|e| alsa_err("prepare", e))?;
    Ok(pcm)
}
