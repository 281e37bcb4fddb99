//! Signal-processing utilities for waveform defenses.
//!
//! - [`stft`] — Hamming-windowed STFT analysis and overlap-add resynthesis

pub mod stft;

pub use stft::{Stft, hamming_window};
