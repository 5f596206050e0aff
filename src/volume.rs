//! Input level metering for the "listening" indicator.
//!
//! Mirrors a browser analyser node: Hann-windowed FFT, magnitudes mapped
//! from a -100..-30 dB window onto `[0, 1]`, averaged across bins.

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

pub const DEFAULT_FFT_SIZE: usize = 256;

const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;

pub struct VolumeMeter {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    scratch: Vec<Complex<f32>>,
    level: f32,
}

impl VolumeMeter {
    pub fn new(fft_size: usize) -> Self {
        let size = fft_size.max(2);
        let fft = FftPlanner::<f32>::new().plan_fft_forward(size);
        let window = (0..size)
            .map(|i| {
                let phase = 2.0 * std::f32::consts::PI * i as f32 / size as f32;
                0.5 * (1.0 - phase.cos())
            })
            .collect();
        Self {
            fft,
            window,
            scratch: vec![Complex::new(0.0, 0.0); size],
            level: 0.0,
        }
    }

    /// Analyse the most recent samples of `frame` and return the new level.
    pub fn measure(&mut self, frame: &[f32]) -> f32 {
        let size = self.window.len();
        let tail = &frame[frame.len().saturating_sub(size)..];

        for (i, slot) in self.scratch.iter_mut().enumerate() {
            let sample = tail.get(i).copied().unwrap_or(0.0);
            *slot = Complex::new(sample * self.window[i], 0.0);
        }
        self.fft.process(&mut self.scratch);

        let bins = size / 2;
        let total: f32 = self.scratch[..bins]
            .iter()
            .map(|bin| {
                let magnitude = bin.norm() / size as f32;
                if magnitude <= 0.0 {
                    return 0.0;
                }
                let db = 20.0 * magnitude.log10();
                ((db - MIN_DECIBELS) / (MAX_DECIBELS - MIN_DECIBELS)).clamp(0.0, 1.0)
            })
            .sum();

        self.level = total / bins as f32;
        self.level
    }

    /// Level from the last [`measure`](Self::measure) call.
    pub fn level(&self) -> f32 {
        self.level
    }

    pub fn reset(&mut self) {
        self.level = 0.0;
    }
}

impl Default for VolumeMeter {
    fn default() -> Self {
        Self::new(DEFAULT_FFT_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(amplitude: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| amplitude * (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 16_000.0).sin())
            .collect()
    }

    #[test]
    fn test_silence_is_zero() {
        let mut meter = VolumeMeter::default();
        assert_eq!(meter.measure(&[0.0; 4096]), 0.0);
        assert_eq!(meter.measure(&[]), 0.0);
    }

    #[test]
    fn test_louder_input_reads_higher() {
        let mut meter = VolumeMeter::default();
        let quiet = meter.measure(&tone(0.01, 4096));
        let loud = meter.measure(&tone(0.8, 4096));
        assert!(quiet >= 0.0);
        assert!(loud > quiet, "loud {loud} <= quiet {quiet}");
        assert!(loud <= 1.0);
    }

    #[test]
    fn test_reset_clears_level() {
        let mut meter = VolumeMeter::default();
        meter.measure(&tone(0.5, 1024));
        assert!(meter.level() > 0.0);
        meter.reset();
        assert_eq!(meter.level(), 0.0);
    }
}
