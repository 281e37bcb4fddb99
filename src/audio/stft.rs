//! Short-time Fourier analysis and overlap-add synthesis.
//!
//! Frames start at multiples of `hop_size` with no centering pad; the trailing
//! partial frame is dropped, so resynthesis can come out shorter than the
//! input. Signals shorter than one frame are zero-padded to a single frame.
//!
//! The analysis window is normalized so that overlapping windows sum to ~1,
//! which lets synthesis be a plain overlap-add of the inverse transforms.

use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use crate::{Error, Result};

/// Periodic Hamming window scaled for constant overlap-add at `hop`.
pub fn hamming_window(length: usize, hop: usize) -> Vec<f64> {
    let window: Vec<f64> = (0..length)
        .map(|i| {
            let phase = 2.0 * std::f64::consts::PI * i as f64 / length as f64;
            0.54 - 0.46 * phase.cos()
        })
        .collect();
    let sum: f64 = window.iter().sum();
    if sum <= 0.0 {
        return window;
    }
    let scale = hop as f64 / sum;
    window.into_iter().map(|w| w * scale).collect()
}

/// STFT processor with precomputed window and FFT plans.
pub struct Stft {
    fft_size: usize,
    hop_size: usize,
    window: Vec<f64>,
    forward: Arc<dyn Fft<f64>>,
    inverse: Arc<dyn Fft<f64>>,
}

impl Stft {
    /// Fails unless `fft_size >= 2` and `1 <= hop_size <= fft_size`.
    pub fn new(fft_size: usize, hop_size: usize) -> Result<Self> {
        if fft_size < 2 || hop_size == 0 || hop_size > fft_size {
            return Err(Error::Audio(format!(
                "invalid STFT geometry: fft_size {fft_size}, hop_size {hop_size}"
            )));
        }
        let mut planner = FftPlanner::new();
        Ok(Self {
            fft_size,
            hop_size,
            window: hamming_window(fft_size, hop_size),
            forward: planner.plan_fft_forward(fft_size),
            inverse: planner.plan_fft_inverse(fft_size),
        })
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    pub fn hop_size(&self) -> usize {
        self.hop_size
    }

    /// Number of one-sided bins, `fft_size / 2 + 1`.
    pub fn num_bins(&self) -> usize {
        self.fft_size / 2 + 1
    }

    /// Number of analysis frames for a signal of `len` samples.
    pub fn num_frames(&self, len: usize) -> usize {
        if len <= self.fft_size {
            1
        } else {
            (len - self.fft_size) / self.hop_size + 1
        }
    }

    /// Full complex spectrum of every windowed frame.
    pub fn analyze(&self, signal: &[f64]) -> Vec<Vec<Complex<f64>>> {
        let n = self.fft_size;
        (0..self.num_frames(signal.len()))
            .map(|frame_idx| {
                let start = frame_idx * self.hop_size;
                let mut buffer: Vec<Complex<f64>> = (0..n)
                    .map(|i| {
                        let sample = signal.get(start + i).copied().unwrap_or(0.0);
                        Complex::new(sample * self.window[i], 0.0)
                    })
                    .collect();
                self.forward.process(&mut buffer);
                buffer
            })
            .collect()
    }

    /// Inverse-transform each spectrum and overlap-add.
    ///
    /// Output length is `(frames - 1) · hop + fft_size`.
    pub fn synthesize(&self, spectra: &[Vec<Complex<f64>>]) -> Vec<f64> {
        let n = self.fft_size;
        if spectra.is_empty() {
            return Vec::new();
        }
        let mut output = vec![0.0; (spectra.len() - 1) * self.hop_size + n];
        let scale = 1.0 / n as f64;
        for (frame_idx, spectrum) in spectra.iter().enumerate() {
            let mut buffer = spectrum.clone();
            self.inverse.process(&mut buffer);
            let start = frame_idx * self.hop_size;
            for (i, c) in buffer.iter().enumerate() {
                output[start + i] += c.re * scale;
            }
        }
        output
    }
}

/// `|X[k]|²` for the one-sided bins of a full spectrum.
pub fn power_spectrum(spectrum: &[Complex<f64>], num_bins: usize) -> Vec<f64> {
    spectrum[..num_bins].iter().map(|c| c.norm_sqr()).collect()
}
