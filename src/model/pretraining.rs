//! Wav2Vec2 pretraining head: projections, quantizer and contrastive loss
//! around an injected backbone.
//!
//! ```text
//! input_values ─→ backbone ─┬─ last_hidden_state ─→ project_hid ─→ c
//!                           └─ extract_features ─→ dropout ─→ quantizer ─→ project_q ─→ q
//!                                                     (skipped when q is supplied)
//! (c, q, perplexity, mask, negatives) ─→ ContrastiveLoss
//! ```
//!
//! A caller that already holds `(q, perplexity)` for this waveform passes it in
//! as a [`QuantizedRepresentation`]; the quantizer then does not run, so the
//! targets stay fixed while the input is being perturbed.

use candle_core::{Module, Tensor};
use candle_nn::VarBuilder;

use super::contrastive::{ContrastiveLoss, ContrastiveLossOutput};
use super::encoder::{BackboneOutput, Wav2Vec2Model, dropout};
use super::quantizer::GumbelVectorQuantizer;
use crate::config::Wav2Vec2Config;
use crate::{Error, Result};

/// Projected quantized targets and their perplexity, computed once and reused.
#[derive(Debug, Clone)]
pub struct QuantizedRepresentation {
    /// `[B, T, proj_codevector_dim]`, already passed through `project_q`.
    pub quantized_features: Tensor,
    /// Scalar codevector perplexity.
    pub codevector_perplexity: Tensor,
}

impl QuantizedRepresentation {
    /// Copy cut from the autograd graph.
    pub fn detach(&self) -> Self {
        Self {
            quantized_features: self.quantized_features.detach(),
            codevector_perplexity: self.codevector_perplexity.detach(),
        }
    }
}

/// Feature extraction and context network used by the pretraining head.
pub trait PretrainingBackbone: Send + Sync {
    /// Run the backbone.
    ///
    /// - `input_values`: `[B, L]` waveform, leaf or not
    /// - `attention_mask`: `[B, L]` sample validity
    /// - `mask_time_indices`: `[B, T]` u8 time mask
    fn forward(
        &self,
        input_values: &Tensor,
        attention_mask: Option<&Tensor>,
        mask_time_indices: Option<&Tensor>,
        train: bool,
    ) -> Result<BackboneOutput>;

    /// Feature frames produced for `input_length` samples.
    fn feat_extract_output_length(&self, input_length: usize) -> usize;

    /// Stop the feature encoder from opting leaf inputs into tracking.
    fn freeze_feature_encoder(&mut self);
}

impl PretrainingBackbone for Wav2Vec2Model {
    fn forward(
        &self,
        input_values: &Tensor,
        attention_mask: Option<&Tensor>,
        mask_time_indices: Option<&Tensor>,
        train: bool,
    ) -> Result<BackboneOutput> {
        Wav2Vec2Model::forward(self, input_values, attention_mask, mask_time_indices, train)
    }

    fn feat_extract_output_length(&self, input_length: usize) -> usize {
        self.config().feat_extract_output_length(input_length)
    }

    fn freeze_feature_encoder(&mut self) {
        self.feature_extractor_mut().freeze();
    }
}

/// Optional inputs of [`Wav2Vec2ForPreTraining::forward`].
#[derive(Debug, Clone, Default)]
pub struct PretrainingInputs<'a> {
    pub attention_mask: Option<&'a Tensor>,
    /// `[B, T]` u8, non-zero = masked.
    pub mask_time_indices: Option<&'a Tensor>,
    /// `[B, T, K]` u32; the loss is only computed when present.
    pub sampled_negative_indices: Option<&'a Tensor>,
    pub quantized_representation: Option<&'a QuantizedRepresentation>,
}

/// Result of one pretraining forward pass.
#[derive(Debug, Clone)]
pub struct PreTrainingOutput {
    pub loss: Option<Tensor>,
    pub contrastive_loss: Option<Tensor>,
    pub diversity_loss: Option<Tensor>,
    /// `[B, T, P]` projected context states.
    pub projected_states: Tensor,
    /// `[B, T, P]` projected quantized targets.
    pub projected_quantized_states: Tensor,
    pub codevector_perplexity: Tensor,
    pub last_hidden_state: Tensor,
    pub extract_features: Tensor,
}

impl PreTrainingOutput {
    /// The quantized targets of this pass, for reuse in later passes.
    pub fn quantized_representation(&self) -> QuantizedRepresentation {
        QuantizedRepresentation {
            quantized_features: self.projected_quantized_states.clone(),
            codevector_perplexity: self.codevector_perplexity.clone(),
        }
    }
}

/// Wav2Vec2 with the contrastive pretraining head.
pub struct Wav2Vec2ForPreTraining {
    backbone: Box<dyn PretrainingBackbone>,
    quantizer: GumbelVectorQuantizer,
    project_hid: candle_nn::Linear,
    project_q: candle_nn::Linear,
    feat_quantizer_dropout: f32,
    loss: ContrastiveLoss,
    config: Wav2Vec2Config,
    training: bool,
}

impl Wav2Vec2ForPreTraining {
    /// Load the standard layout (`wav2vec2.*`, `quantizer.*`, `project_*`).
    pub fn load(vb: VarBuilder, cfg: &Wav2Vec2Config) -> Result<Self> {
        let backbone = Wav2Vec2Model::load(vb.pp("wav2vec2"), cfg)?;
        Self::with_backbone(Box::new(backbone), vb, cfg)
    }

    /// Load the heads around an already constructed backbone.
    pub fn with_backbone(
        backbone: Box<dyn PretrainingBackbone>,
        vb: VarBuilder,
        cfg: &Wav2Vec2Config,
    ) -> Result<Self> {
        let quantizer = GumbelVectorQuantizer::load(vb.pp("quantizer"), cfg)?;
        let project_hid =
            candle_nn::linear(cfg.hidden_size, cfg.proj_codevector_dim, vb.pp("project_hid"))?;
        let project_q = candle_nn::linear(
            cfg.codevector_dim,
            cfg.proj_codevector_dim,
            vb.pp("project_q"),
        )?;
        Ok(Self {
            backbone,
            quantizer,
            project_hid,
            project_q,
            feat_quantizer_dropout: cfg.feat_quantizer_dropout,
            loss: ContrastiveLoss::from_config(cfg),
            config: cfg.clone(),
            training: true,
        })
    }

    pub fn config(&self) -> &Wav2Vec2Config {
        &self.config
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Training mode enables dropout and Gumbel sampling.
    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    pub fn set_gumbel_temperature(&mut self, temperature: f64) {
        self.quantizer.set_temperature(temperature);
    }

    pub fn freeze_feature_encoder(&mut self) {
        self.backbone.freeze_feature_encoder();
    }

    pub fn feat_extract_output_length(&self, input_length: usize) -> usize {
        self.backbone.feat_extract_output_length(input_length)
    }

    /// Forward pass on `[B, L]` waveforms.
    pub fn forward(
        &self,
        input_values: &Tensor,
        inputs: &PretrainingInputs<'_>,
    ) -> Result<PreTrainingOutput> {
        let train = self.training;
        let outputs = self.backbone.forward(
            input_values,
            inputs.attention_mask,
            inputs.mask_time_indices,
            train,
        )?;

        let projected_states = self.project_hid.forward(&outputs.last_hidden_state)?;

        let (projected_quantized_states, codevector_perplexity) =
            match inputs.quantized_representation {
                Some(rep) => (
                    rep.quantized_features.clone(),
                    rep.codevector_perplexity.clone(),
                ),
                None => {
                    let features =
                        dropout(&outputs.extract_features, self.feat_quantizer_dropout, train)?;
                    let (quantized, perplexity) =
                        self.quantizer
                            .forward(&features, inputs.mask_time_indices, train)?;
                    (self.project_q.forward(&quantized)?, perplexity)
                }
            };

        let (loss, contrastive_loss, diversity_loss) = match inputs.sampled_negative_indices {
            Some(negatives) => {
                let mask = inputs.mask_time_indices.ok_or_else(|| {
                    Error::Masking("negative sampling requires mask_time_indices".into())
                })?;
                let ContrastiveLossOutput {
                    loss,
                    contrastive_loss,
                    diversity_loss,
                } = self.loss.compute(
                    &projected_quantized_states,
                    &projected_states,
                    &codevector_perplexity,
                    mask,
                    negatives,
                )?;
                (Some(loss), Some(contrastive_loss), Some(diversity_loss))
            }
            None => (None, None, None),
        };

        Ok(PreTrainingOutput {
            loss,
            contrastive_loss,
            diversity_loss,
            projected_states,
            projected_quantized_states,
            codevector_perplexity,
            last_hidden_state: outputs.last_hidden_state,
            extract_features: outputs.extract_features,
        })
    }
}
