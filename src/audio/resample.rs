//! Linear-interpolation downsampler
//!
//! Converts captured frames to the wire rate. Only downsampling (or a
//! pass-through at equal rates) is supported; asking to upsample is a
//! configuration error reported up front.

use crate::error::{AppError, Result};

fn check_rates(from: u32, to: u32) -> Result<()> {
    if from == 0 || to == 0 {
        return Err(AppError::Config(format!(
            "invalid sample rates {}Hz -> {}Hz",
            from, to
        )));
    }
    if to > from {
        return Err(AppError::UnsupportedResample { from, to });
    }
    Ok(())
}

/// Number of output samples produced for `input_len` input samples
pub fn output_len(input_len: usize, from: u32, to: u32) -> usize {
    ((input_len as u64 * to as u64) / from as u64) as usize
}

fn resample_into(input: &[f32], from: u32, to: u32, out: &mut Vec<f32>) {
    out.clear();
    if from == to {
        out.extend_from_slice(input);
        return;
    }

    let len = output_len(input.len(), from, to);
    let ratio = from as f64 / to as f64;
    let last = input.len().saturating_sub(1);
    for i in 0..len {
        let pos = i as f64 * ratio;
        let idx = pos.floor() as usize;
        let frac = (pos - idx as f64) as f32;
        let a = input[idx.min(last)];
        let b = input[(idx + 1).min(last)];
        out.push(a + (b - a) * frac);
    }
}

/// One-shot conversion of a buffer from `from` Hz to `to` Hz
pub fn resample_linear(input: &[f32], from: u32, to: u32) -> Result<Vec<f32>> {
    check_rates(from, to)?;
    let mut out = Vec::with_capacity(output_len(input.len(), from, to));
    resample_into(input, from, to, &mut out);
    Ok(out)
}

/// Fixed-ratio resampler reusing its output buffer between frames
pub struct Resampler {
    from: u32,
    to: u32,
    out: Vec<f32>,
}

impl Resampler {
    pub fn new(from: u32, to: u32) -> Result<Self> {
        check_rates(from, to)?;
        Ok(Self {
            from,
            to,
            out: Vec::new(),
        })
    }

    pub fn source_rate(&self) -> u32 {
        self.from
    }

    pub fn target_rate(&self) -> u32 {
        self.to
    }

    /// Resample one frame; the slice is valid until the next call
    pub fn process(&mut self, input: &[f32]) -> &[f32] {
        resample_into(input, self.from, self.to, &mut self.out);
        &self.out
    }
}
