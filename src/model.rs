//! Wav2Vec2 pretraining model.
//!
//! ## Components
//!
//! - [`feature_encoder`] — strided Conv1d stack (waveform → latent frames)
//! - [`encoder`] — feature projection, positional conv, transformer, [`Wav2Vec2Model`]
//! - [`quantizer`] — Gumbel product quantizer and codevector perplexity
//! - [`masking`] — span masking and negative sampling
//! - [`contrastive`] — contrastive + diversity loss
//! - [`pretraining`] — projection heads around a [`PretrainingBackbone`]
//! - [`lobe`] — Hub loading, waveform normalization, per-call sampling

pub mod contrastive;
pub mod encoder;
pub mod feature_encoder;
pub mod lobe;
pub mod masking;
pub mod norm;
pub mod pretraining;
pub mod quantizer;

pub use encoder::{BackboneOutput, Wav2Vec2Model};
pub use lobe::Wav2Vec2Pretrain;
pub use pretraining::{
    PreTrainingOutput, PretrainingBackbone, PretrainingInputs, QuantizedRepresentation,
    Wav2Vec2ForPreTraining,
};
