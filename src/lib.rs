//! Adversarial robustness for Wav2Vec2 pretraining in pure Rust.
//!
//! A candle-based Wav2Vec2 pretraining model whose contrastive objective can
//! be trained and evaluated under perturbations of the raw waveform.
//! Gradients reach the input samples, and quantized targets can be frozen so
//! an attack moves the predictions and leaves the targets alone.
//!
//! ## Architecture
//!
//! ```text
//! waveform ─→ [filter] ─→ feature encoder ─→ projection ─→ mask ─→ transformer ─→ project_hid ─┐
//!                                  │                                                          ├→ contrastive + diversity loss
//!                                  └──→ Gumbel quantizer (or frozen targets) ─→ project_q ───┘
//! ```
//!
//! ## Modules
//!
//! - [`model`] — feature encoder, transformer, quantizer, contrastive loss, lobe
//! - [`training`] — stage-dispatching brain, metrics, Noam, checkpoints, logging
//! - [`attack`] — contrastive PGD on the waveform
//! - [`defense`] — Wiener noise-reduction input filter
//! - [`audio`] — STFT analysis and overlap-add synthesis
//! - [`config`] — model, source and training configuration

pub mod attack;
pub mod audio;
pub mod config;
pub mod defense;
pub mod model;
pub mod training;

mod error;

pub use error::{Error, Result};
