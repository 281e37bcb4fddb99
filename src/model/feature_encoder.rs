//! Convolutional feature encoder: raw waveform → latent frames.
//!
//! ## Architecture (wav2vec2-base)
//!
//! ```text
//! [B, L] ─→ unsqueeze ─→ [B, 1, L]
//!   ─→ Conv1d(1, 512, k=10, s=5) + GroupNorm(512 groups) + GELU
//!   ─→ 4 × Conv1d(512, 512, k=3, s=2) + GELU
//!   ─→ 2 × Conv1d(512, 512, k=2, s=2) + GELU
//!   ─→ [B, 512, T]      (T ≈ L / 320, 20 ms frames at 16 kHz)
//! ```
//!
//! With `feat_extract_norm = "layer"` every conv is followed by a LayerNorm
//! over channels instead.
//!
//! ## Gradient tracking
//!
//! During attacks the waveform handed to the encoder is usually *not* a leaf:
//! it is `clean + δ` or the output of an input transform. Replacing such a
//! tensor with a fresh variable would cut the graph and leave δ without a
//! gradient, so the encoder only opts strict leaves into tracking.
//!
//! ## Weight key paths (under `wav2vec2.feature_extractor.`)
//!
//! ```text
//! conv_layers.{i}.conv.weight            [C_out, C_in, k]
//! conv_layers.{i}.conv.bias              (only with conv_bias)
//! conv_layers.{i}.layer_norm.{weight,bias}
//! ```

use candle_core::{Module, Tensor, Var};
use candle_nn::{Conv1d, Conv1dConfig, VarBuilder};

use super::norm::{ChannelGroupNorm, LayerNorm};
use crate::Result;
use crate::config::{FeatExtractNorm, Wav2Vec2Config};

/// Normalization attached to one conv layer.
#[derive(Debug, Clone)]
enum ConvNorm {
    None,
    Group(ChannelGroupNorm),
    Layer(LayerNorm),
}

/// Conv1d → optional norm → GELU.
#[derive(Debug, Clone)]
pub struct FeatureConvLayer {
    conv: Conv1d,
    norm: ConvNorm,
}

impl FeatureConvLayer {
    pub fn load(vb: VarBuilder, cfg: &Wav2Vec2Config, layer_id: usize) -> Result<Self> {
        let in_dim = if layer_id == 0 {
            1
        } else {
            cfg.conv_dim[layer_id - 1]
        };
        let out_dim = cfg.conv_dim[layer_id];
        let kernel = cfg.conv_kernel[layer_id];
        let conv_cfg = Conv1dConfig {
            stride: cfg.conv_stride[layer_id],
            ..Default::default()
        };
        let conv = if cfg.conv_bias {
            candle_nn::conv1d(in_dim, out_dim, kernel, conv_cfg, vb.pp("conv"))?
        } else {
            candle_nn::conv1d_no_bias(in_dim, out_dim, kernel, conv_cfg, vb.pp("conv"))?
        };
        let norm = match cfg.feat_extract_norm {
            FeatExtractNorm::Group if layer_id == 0 => {
                ConvNorm::Group(ChannelGroupNorm::load(vb.pp("layer_norm"), out_dim, 1e-5)?)
            }
            FeatExtractNorm::Group => ConvNorm::None,
            FeatExtractNorm::Layer => {
                ConvNorm::Layer(LayerNorm::load(vb.pp("layer_norm"), out_dim, 1e-5)?)
            }
        };
        Ok(Self { conv, norm })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.conv.forward(x)?;
        let x = match &self.norm {
            ConvNorm::None => x,
            ConvNorm::Group(norm) => norm.forward(&x)?,
            ConvNorm::Layer(norm) => norm.forward_channels_first(&x)?,
        };
        Ok(x.gelu_erf()?)
    }
}

/// Stack of temporal convolutions turning a waveform into latent frames.
#[derive(Debug, Clone)]
pub struct FeatureEncoder {
    conv_layers: Vec<FeatureConvLayer>,
    requires_grad: bool,
}

impl FeatureEncoder {
    /// Load from a `VarBuilder` scoped to `feature_extractor`.
    pub fn load(vb: VarBuilder, cfg: &Wav2Vec2Config) -> Result<Self> {
        let mut conv_layers = Vec::with_capacity(cfg.conv_dim.len());
        for i in 0..cfg.conv_dim.len() {
            conv_layers.push(FeatureConvLayer::load(
                vb.pp(format!("conv_layers.{i}")),
                cfg,
                i,
            )?);
        }
        Ok(Self {
            conv_layers,
            requires_grad: true,
        })
    }

    /// Stop opting leaf inputs into gradient tracking.
    pub fn freeze(&mut self) {
        self.requires_grad = false;
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    /// Forward pass.
    ///
    /// - `input_values`: `[B, L]` waveform, leaf or not
    /// - `train`: training mode
    ///
    /// Returns `[B, C, T]`.
    pub fn forward(&self, input_values: &Tensor, train: bool) -> Result<Tensor> {
        let mut hidden_states = input_values.unsqueeze(1)?;

        // Only a tensor that tracks nothing may be promoted to a variable.
        // Anything already on a graph keeps its history untouched.
        if self.requires_grad && train && !input_values.track_op() {
            hidden_states = Var::from_tensor(&hidden_states)?.into_inner();
        }

        for layer in &self.conv_layers {
            hidden_states = layer.forward(&hidden_states)?;
        }
        Ok(hidden_states)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn tiny_config(norm: FeatExtractNorm) -> Wav2Vec2Config {
        Wav2Vec2Config {
            feat_extract_norm: norm,
            conv_dim: vec![8, 8, 8],
            conv_stride: vec![5, 2, 2],
            conv_kernel: vec![10, 3, 2],
            ..Default::default()
        }
    }

    #[test]
    fn output_shape_matches_length_formula() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let cfg = tiny_config(FeatExtractNorm::Group);
        let encoder = FeatureEncoder::load(vb, &cfg).unwrap();

        let wav = Tensor::randn(0.0_f32, 1.0, (2, 400), &device).unwrap();
        let out = encoder.forward(&wav, false).unwrap();
        assert_eq!(out.dims(), &[2, 8, cfg.feat_extract_output_length(400)]);
    }

    #[test]
    fn layer_norm_variant_loads_and_runs() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let cfg = tiny_config(FeatExtractNorm::Layer);
        let encoder = FeatureEncoder::load(vb, &cfg).unwrap();

        let wav = Tensor::randn(0.0_f32, 1.0, (1, 300), &device).unwrap();
        let out = encoder.forward(&wav, true).unwrap();
        assert_eq!(out.dim(1).unwrap(), 8);
    }

    #[test]
    fn gradient_reaches_leaf_behind_upstream_transform() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let cfg = tiny_config(FeatExtractNorm::Group);
        let encoder = FeatureEncoder::load(vb, &cfg).unwrap();

        let clean = Tensor::randn(0.0_f32, 1.0, (2, 400), &device).unwrap();
        let delta = Var::zeros((2, 400), DType::F32, &device).unwrap();
        // Non-leaf: the result of a differentiable upstream transform.
        let perturbed = ((&clean + delta.as_tensor()).unwrap() * 0.5).unwrap();
        assert!(perturbed.track_op());

        let out = encoder.forward(&perturbed, true).unwrap();
        let loss = out.sqr().unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        let grad = grads
            .get(delta.as_tensor())
            .expect("delta should receive a gradient");
        let norm: f32 = grad.sqr().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert!(norm > 0.0);
    }

    #[test]
    fn plain_leaf_input_is_left_unmodified() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let mut encoder = FeatureEncoder::load(vb, &tiny_config(FeatExtractNorm::Group)).unwrap();

        let wav = Tensor::randn(0.0_f32, 1.0, (1, 200), &device).unwrap();
        let before: Vec<f32> = wav.flatten_all().unwrap().to_vec1().unwrap();
        encoder.forward(&wav, true).unwrap();
        assert!(!wav.track_op());
        let after: Vec<f32> = wav.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(before, after);

        encoder.freeze();
        assert!(!encoder.requires_grad());
    }
}
