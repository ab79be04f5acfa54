//! Audio device enumeration using ALSA

use alsa::device_name::HintIter;
use alsa::pcm::HwParams;
use alsa::{Direction, PCM};
use serde::Serialize;
use std::ffi::CStr;
use tracing::{debug, info};

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Capture,
    Playback,
}

impl DeviceKind {
    fn direction(self) -> Direction {
        match self {
            DeviceKind::Capture => Direction::Capture,
            DeviceKind::Playback => Direction::Playback,
        }
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceKind::Capture => write!(f, "capture"),
            DeviceKind::Playback => write!(f, "playback"),
        }
    }
}

/// Audio device information
#[derive(Debug, Clone, Serialize)]
pub struct AudioDeviceInfo {
    /// ALSA PCM name (e.g., "hw:0,0" or "default")
    pub name: String,
    pub description: String,
    pub kind: DeviceKind,
    /// Supported sample rates (empty if the device is busy)
    pub sample_rates: Vec<u32>,
    pub channels: Vec<u32>,
}

impl AudioDeviceInfo {
    pub fn supports_rate(&self, rate: u32) -> bool {
        self.sample_rates.contains(&rate)
    }
}

/// Enumerate PCM devices usable in the given direction
pub fn enumerate_devices(kind: DeviceKind) -> Result<Vec<AudioDeviceInfo>> {
    let pcm_iface = CStr::from_bytes_with_nul(b"pcm\0")
        .map_err(|e| AppError::AudioError(e.to_string()))?;
    let hints = HintIter::new(None, pcm_iface)
        .map_err(|e| AppError::AudioError(format!("Failed to list ALSA devices: {}", e)))?;

    let mut devices = Vec::new();
    for hint in hints {
        let Some(name) = hint.name else { continue };
        if name == "null" {
            continue;
        }
        // Hints without a direction work both ways
        if let Some(dir) = hint.direction {
            if dir != kind.direction() {
                continue;
            }
        }

        let description = hint
            .desc
            .map(|d| d.replace('\n', " - "))
            .unwrap_or_else(|| name.clone());

        let (sample_rates, channels) = match PCM::new(&name, kind.direction(), true) {
            Ok(pcm) => query_device_caps(&pcm),
            Err(e) => {
                debug!("Cannot open {} for {}: {}", name, kind, e);
                (vec![], vec![])
            }
        };

        devices.push(AudioDeviceInfo {
            name,
            description,
            kind,
            sample_rates,
            channels,
        });
    }

    info!("Found {} audio {} devices", devices.len(), kind);
    Ok(devices)
}

fn query_device_caps(pcm: &PCM) -> (Vec<u32>, Vec<u32>) {
    let hwp = match HwParams::any(pcm) {
        Ok(h) => h,
        Err(_) => return (vec![], vec![]),
    };

    let common_rates = [8000, 16000, 22050, 44100, 48000, 96000];
    let rates = common_rates
        .iter()
        .copied()
        .filter(|r| hwp.test_rate(*r).is_ok())
        .collect();

    let channels = (1..=8).filter(|ch| hwp.test_channels(*ch).is_ok()).collect();

    (rates, channels)
}

/// Human-readable listing for `--list-devices`
pub fn format_device_list(devices: &[AudioDeviceInfo]) -> String {
    let mut out = String::new();
    for d in devices {
        let rates = if d.sample_rates.is_empty() {
            "busy".to_string()
        } else {
            d.sample_rates
                .iter()
                .map(|r| r.to_string())
                .collect::<Vec<_>>()
                .join("/")
        };
        out.push_str(&format!("  [{}] {}  ({}; {})\n", d.kind, d.name, d.description, rates));
    }
    out
}
