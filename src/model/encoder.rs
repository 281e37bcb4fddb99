//! Context network: feature projection + convolutional positions + transformer.
//!
//! ## Architecture
//!
//! ```text
//! FeatureProjection:
//!   LayerNorm(512) ─→ (extract_features)
//!   ─→ Linear(512, 768) ─→ Dropout
//!
//! Encoder (post-norm, wav2vec2-base):
//!   x + PosConv(x) ─→ LayerNorm ─→ Dropout
//!   ─→ 12 × [ MHA ─→ +res ─→ LayerNorm ─→ +FFN ─→ LayerNorm ]
//!
//! EncoderStableLayerNorm (pre-norm, large-lv60):
//!   x + PosConv(x) ─→ Dropout
//!   ─→ 24 × [ LayerNorm ─→ MHA ─→ +res ─→ +FFN(LayerNorm) ]
//!   ─→ LayerNorm
//! ```
//!
//! `PosConv` is a grouped Conv1d (k=128, 16 groups) with weight normalization
//! over the kernel axis, followed by a same-padding trim and GELU.
//!
//! ## Weight key paths (under `wav2vec2.`)
//!
//! ```text
//! feature_projection.layer_norm.{weight,bias}
//! feature_projection.projection.{weight,bias}
//! encoder.pos_conv_embed.conv.{weight_g,weight_v,bias}
//! encoder.layer_norm.{weight,bias}
//! encoder.layers.{i}.attention.{q,k,v,out}_proj.{weight,bias}
//! encoder.layers.{i}.layer_norm.{weight,bias}
//! encoder.layers.{i}.feed_forward.intermediate_dense.{weight,bias}
//! encoder.layers.{i}.feed_forward.output_dense.{weight,bias}
//! encoder.layers.{i}.final_layer_norm.{weight,bias}
//! ```

use candle_core::{D, DType, Module, Tensor};
use candle_nn::VarBuilder;

use super::feature_encoder::FeatureEncoder;
use super::norm::LayerNorm;
use crate::Result;
use crate::config::Wav2Vec2Config;

/// Dropout that is the identity outside training.
pub(crate) fn dropout(x: &Tensor, p: f32, train: bool) -> Result<Tensor> {
    if train && p > 0.0 {
        Ok(candle_nn::ops::dropout(x, p)?)
    } else {
        Ok(x.clone())
    }
}

// ---------------------------------------------------------------------------
// Feature projection
// ---------------------------------------------------------------------------

/// LayerNorm + Linear from conv channels into the transformer width.
#[derive(Debug, Clone)]
pub struct FeatureProjection {
    layer_norm: LayerNorm,
    projection: candle_nn::Linear,
    dropout: f32,
}

impl FeatureProjection {
    pub fn load(vb: VarBuilder, cfg: &Wav2Vec2Config) -> Result<Self> {
        let extract_dim = cfg.extract_dim();
        let layer_norm = LayerNorm::load(vb.pp("layer_norm"), extract_dim, cfg.layer_norm_eps)?;
        let projection = candle_nn::linear(extract_dim, cfg.hidden_size, vb.pp("projection"))?;
        Ok(Self {
            layer_norm,
            projection,
            dropout: cfg.feat_proj_dropout,
        })
    }

    /// `[B, T, C]` → (`[B, T, H]` projected, `[B, T, C]` normalized features).
    pub fn forward(&self, features: &Tensor, train: bool) -> Result<(Tensor, Tensor)> {
        let norm_features = self.layer_norm.forward(features)?;
        let hidden = self.projection.forward(&norm_features)?;
        let hidden = dropout(&hidden, self.dropout, train)?;
        Ok((hidden, norm_features))
    }
}

// ---------------------------------------------------------------------------
// Positional convolution
// ---------------------------------------------------------------------------

/// Grouped convolution with weight norm along the kernel axis (`dim=2`).
#[derive(Debug, Clone)]
pub struct PositionalConvEmbedding {
    weight_g: Tensor, // [1, 1, K]
    weight_v: Tensor, // [H, H / groups, K]
    bias: Tensor,     // [H]
    kernel_size: usize,
    groups: usize,
}

impl PositionalConvEmbedding {
    pub fn load(vb: VarBuilder, cfg: &Wav2Vec2Config) -> Result<Self> {
        let hidden = cfg.hidden_size;
        let kernel_size = cfg.num_conv_pos_embeddings;
        let groups = cfg.num_conv_pos_embedding_groups;
        let fan_in = (kernel_size * hidden / groups) as f64;
        let weight_v = vb.get_with_hints(
            (hidden, hidden / groups, kernel_size),
            "weight_v",
            candle_nn::Init::Randn {
                mean: 0.0,
                stdev: (2.0 / fan_in).sqrt(),
            },
        )?;
        let weight_g =
            vb.get_with_hints((1, 1, kernel_size), "weight_g", candle_nn::Init::Const(1.0))?;
        let bias = vb.get_with_hints(hidden, "bias", candle_nn::Init::Const(0.0))?;
        Ok(Self {
            weight_g,
            weight_v,
            bias,
            kernel_size,
            groups,
        })
    }

    /// Effective kernel `g · v / ‖v‖`, the norm taken over output and input
    /// channels separately for each kernel tap.
    fn weight(&self) -> Result<Tensor> {
        let norm = self
            .weight_v
            .sqr()?
            .sum_keepdim(0)?
            .sum_keepdim(1)?
            .sqrt()?;
        Ok(self
            .weight_v
            .broadcast_div(&norm)?
            .broadcast_mul(&self.weight_g)?)
    }

    /// `[B, T, H]` → `[B, T, H]` positional signal.
    pub fn forward(&self, hidden_states: &Tensor) -> Result<Tensor> {
        let x = hidden_states.transpose(1, 2)?.contiguous()?; // [B, H, T]
        let weight = self.weight()?;
        let x = x.conv1d(&weight, self.kernel_size / 2, 1, 1, self.groups)?;
        let x = x.broadcast_add(&self.bias.reshape((1, (), 1))?)?;
        // Same-padding trim for an even kernel.
        let x = if self.kernel_size % 2 == 0 {
            let t = x.dim(2)?;
            x.narrow(2, 0, t - 1)?
        } else {
            x
        };
        let x = x.gelu_erf()?;
        Ok(x.transpose(1, 2)?)
    }
}

// ---------------------------------------------------------------------------
// Attention + feed-forward
// ---------------------------------------------------------------------------

/// Multi-head self-attention with an additive padding mask.
#[derive(Debug, Clone)]
pub struct SelfAttention {
    q_proj: candle_nn::Linear,
    k_proj: candle_nn::Linear,
    v_proj: candle_nn::Linear,
    out_proj: candle_nn::Linear,
    num_heads: usize,
    head_dim: usize,
    dropout: f32,
}

impl SelfAttention {
    pub fn load(vb: VarBuilder, cfg: &Wav2Vec2Config) -> Result<Self> {
        let dim = cfg.hidden_size;
        Ok(Self {
            q_proj: candle_nn::linear(dim, dim, vb.pp("q_proj"))?,
            k_proj: candle_nn::linear(dim, dim, vb.pp("k_proj"))?,
            v_proj: candle_nn::linear(dim, dim, vb.pp("v_proj"))?,
            out_proj: candle_nn::linear(dim, dim, vb.pp("out_proj"))?,
            num_heads: cfg.num_attention_heads,
            head_dim: dim / cfg.num_attention_heads,
            dropout: cfg.attention_dropout,
        })
    }

    /// - `x`: `[B, T, H]`
    /// - `mask`: `[B, 1, 1, T]` additive bias (0 = attend, large negative = padding)
    pub fn forward(&self, x: &Tensor, mask: Option<&Tensor>, train: bool) -> Result<Tensor> {
        let (batch, seq_len, dim) = x.dims3()?;
        let split = |t: Tensor| -> Result<Tensor> {
            Ok(t.reshape((batch, seq_len, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()?)
        };
        let scale = (self.head_dim as f64).powf(-0.5);
        let q = split((self.q_proj.forward(x)? * scale)?)?;
        let k = split(self.k_proj.forward(x)?)?;
        let v = split(self.v_proj.forward(x)?)?;

        let scores = q.matmul(&k.transpose(2, 3)?.contiguous()?)?; // [B, H, T, T]
        let scores = match mask {
            Some(mask) => scores.broadcast_add(mask)?,
            None => scores,
        };
        let attn = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let attn = dropout(&attn, self.dropout, train)?;
        let out = attn.matmul(&v)?; // [B, H, T, d]
        let out = out.transpose(1, 2)?.reshape((batch, seq_len, dim))?;
        Ok(self.out_proj.forward(&out)?)
    }
}

/// Linear → GELU → Linear with activation and output dropout.
#[derive(Debug, Clone)]
pub struct FeedForward {
    intermediate_dense: candle_nn::Linear,
    output_dense: candle_nn::Linear,
    activation_dropout: f32,
    hidden_dropout: f32,
}

impl FeedForward {
    pub fn load(vb: VarBuilder, cfg: &Wav2Vec2Config) -> Result<Self> {
        Ok(Self {
            intermediate_dense: candle_nn::linear(
                cfg.hidden_size,
                cfg.intermediate_size,
                vb.pp("intermediate_dense"),
            )?,
            output_dense: candle_nn::linear(
                cfg.intermediate_size,
                cfg.hidden_size,
                vb.pp("output_dense"),
            )?,
            activation_dropout: cfg.activation_dropout,
            hidden_dropout: cfg.hidden_dropout,
        })
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x = self.intermediate_dense.forward(x)?.gelu_erf()?;
        let x = dropout(&x, self.activation_dropout, train)?;
        let x = self.output_dense.forward(&x)?;
        dropout(&x, self.hidden_dropout, train)
    }
}

// ---------------------------------------------------------------------------
// Encoder layers
// ---------------------------------------------------------------------------

/// One transformer block; `stable` selects the pre-norm layout.
#[derive(Debug, Clone)]
pub struct EncoderLayer {
    attention: SelfAttention,
    layer_norm: LayerNorm,
    feed_forward: FeedForward,
    final_layer_norm: LayerNorm,
    hidden_dropout: f32,
    stable: bool,
}

impl EncoderLayer {
    pub fn load(vb: VarBuilder, cfg: &Wav2Vec2Config) -> Result<Self> {
        let dim = cfg.hidden_size;
        Ok(Self {
            attention: SelfAttention::load(vb.pp("attention"), cfg)?,
            layer_norm: LayerNorm::load(vb.pp("layer_norm"), dim, cfg.layer_norm_eps)?,
            feed_forward: FeedForward::load(vb.pp("feed_forward"), cfg)?,
            final_layer_norm: LayerNorm::load(vb.pp("final_layer_norm"), dim, cfg.layer_norm_eps)?,
            hidden_dropout: cfg.hidden_dropout,
            stable: cfg.do_stable_layer_norm,
        })
    }

    pub fn forward(&self, x: &Tensor, mask: Option<&Tensor>, train: bool) -> Result<Tensor> {
        if self.stable {
            let residual = x.clone();
            let h = self.layer_norm.forward(x)?;
            let h = self.attention.forward(&h, mask, train)?;
            let h = dropout(&h, self.hidden_dropout, train)?;
            let h = (residual + h)?;
            let ff = self
                .feed_forward
                .forward(&self.final_layer_norm.forward(&h)?, train)?;
            Ok((h + ff)?)
        } else {
            let residual = x.clone();
            let h = self.attention.forward(x, mask, train)?;
            let h = dropout(&h, self.hidden_dropout, train)?;
            let h = self.layer_norm.forward(&(residual + h)?)?;
            let h = (&h + self.feed_forward.forward(&h, train)?)?;
            self.final_layer_norm.forward(&h)
        }
    }
}

/// Transformer context network over projected features.
#[derive(Debug, Clone)]
pub struct Encoder {
    pos_conv_embed: PositionalConvEmbedding,
    layer_norm: LayerNorm,
    layers: Vec<EncoderLayer>,
    hidden_dropout: f32,
    stable: bool,
}

impl Encoder {
    /// Load from a `VarBuilder` scoped to `encoder`.
    pub fn load(vb: VarBuilder, cfg: &Wav2Vec2Config) -> Result<Self> {
        let pos_conv_embed = PositionalConvEmbedding::load(vb.pp("pos_conv_embed.conv"), cfg)?;
        let layer_norm = LayerNorm::load(vb.pp("layer_norm"), cfg.hidden_size, cfg.layer_norm_eps)?;
        let mut layers = Vec::with_capacity(cfg.num_hidden_layers);
        for i in 0..cfg.num_hidden_layers {
            layers.push(EncoderLayer::load(vb.pp(format!("layers.{i}")), cfg)?);
        }
        Ok(Self {
            pos_conv_embed,
            layer_norm,
            layers,
            hidden_dropout: cfg.hidden_dropout,
            stable: cfg.do_stable_layer_norm,
        })
    }

    /// Forward pass.
    ///
    /// - `hidden_states`: `[B, T, H]`
    /// - `attention_mask`: `[B, T]` frame-level validity (1 = valid, 0 = padding)
    ///
    /// Returns `[B, T, H]`.
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        attention_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let (hidden_states, additive_mask) = match attention_mask {
            Some(mask) => {
                let mask = mask.to_dtype(hidden_states.dtype())?;
                // Zero padded frames, then turn validity into an additive bias.
                let hidden = hidden_states.broadcast_mul(&mask.unsqueeze(2)?)?;
                let min_val = match hidden_states.dtype() {
                    DType::F16 => f64::from(half::f16::MIN),
                    DType::BF16 => f64::from(half::bf16::MIN),
                    _ => f64::from(f32::MIN),
                };
                let bias = ((1.0 - mask)? * min_val)?.unsqueeze(1)?.unsqueeze(1)?;
                (hidden, Some(bias))
            }
            None => (hidden_states.clone(), None),
        };

        let positions = self.pos_conv_embed.forward(&hidden_states)?;
        let mut hidden = (hidden_states + positions)?;
        if !self.stable {
            hidden = self.layer_norm.forward(&hidden)?;
        }
        hidden = dropout(&hidden, self.hidden_dropout, train)?;

        for layer in &self.layers {
            hidden = layer.forward(&hidden, additive_mask.as_ref(), train)?;
        }

        if self.stable {
            hidden = self.layer_norm.forward(&hidden)?;
        }
        Ok(hidden)
    }
}

// ---------------------------------------------------------------------------
// Backbone
// ---------------------------------------------------------------------------

/// Hidden states of the backbone, before any pretraining head.
#[derive(Debug, Clone)]
pub struct BackboneOutput {
    /// `[B, T, H]` context-network output.
    pub last_hidden_state: Tensor,
    /// `[B, T, C]` layer-normalized conv features, the quantizer input.
    pub extract_features: Tensor,
}

/// Feature encoder, feature projection, time masking and context network.
///
/// Key prefix: `wav2vec2`.
#[derive(Debug, Clone)]
pub struct Wav2Vec2Model {
    feature_extractor: FeatureEncoder,
    feature_projection: FeatureProjection,
    masked_spec_embed: Tensor, // [H]
    encoder: Encoder,
    config: Wav2Vec2Config,
}

impl Wav2Vec2Model {
    pub fn load(vb: VarBuilder, cfg: &Wav2Vec2Config) -> Result<Self> {
        cfg.validate()?;
        let feature_extractor = FeatureEncoder::load(vb.pp("feature_extractor"), cfg)?;
        let feature_projection = FeatureProjection::load(vb.pp("feature_projection"), cfg)?;
        let masked_spec_embed = vb.get_with_hints(
            cfg.hidden_size,
            "masked_spec_embed",
            candle_nn::Init::Uniform { lo: 0.0, up: 1.0 },
        )?;
        let encoder = Encoder::load(vb.pp("encoder"), cfg)?;
        Ok(Self {
            feature_extractor,
            feature_projection,
            masked_spec_embed,
            encoder,
            config: cfg.clone(),
        })
    }

    pub fn config(&self) -> &Wav2Vec2Config {
        &self.config
    }

    pub fn feature_extractor_mut(&mut self) -> &mut FeatureEncoder {
        &mut self.feature_extractor
    }

    /// Replace masked frames with the learned mask embedding.
    ///
    /// `mask_time_indices` is a `[B, T]` tensor, non-zero where masked.
    fn mask_hidden_states(
        &self,
        hidden_states: &Tensor,
        mask_time_indices: Option<&Tensor>,
    ) -> Result<Tensor> {
        let Some(mask) = mask_time_indices else {
            return Ok(hidden_states.clone());
        };
        let shape = hidden_states.shape();
        let cond = mask
            .ne(0u8)?
            .unsqueeze(2)?
            .broadcast_as(shape)?
            .contiguous()?;
        let embed = self
            .masked_spec_embed
            .to_dtype(hidden_states.dtype())?
            .reshape((1, 1, ()))?
            .broadcast_as(shape)?
            .contiguous()?;
        Ok(cond.where_cond(&embed, hidden_states)?)
    }

    /// Reduce a sample-level `[B, L]` attention mask to feature frames.
    ///
    /// Frame `t` of item `b` is valid iff `t` is below the conv output length
    /// of that item's valid sample count.
    pub fn feature_vector_attention_mask(
        &self,
        feature_len: usize,
        attention_mask: &Tensor,
    ) -> Result<Tensor> {
        let lengths: Vec<f32> = attention_mask
            .to_dtype(DType::F32)?
            .sum(D::Minus1)?
            .to_vec1()?;
        let batch = lengths.len();
        let mut frames = vec![0f32; batch * feature_len];
        for (b, &len) in lengths.iter().enumerate() {
            let valid = self
                .config
                .feat_extract_output_length(len.round() as usize)
                .min(feature_len);
            frames[b * feature_len..b * feature_len + valid].fill(1.0);
        }
        Ok(Tensor::from_vec(
            frames,
            (batch, feature_len),
            attention_mask.device(),
        )?)
    }

    /// Forward pass.
    ///
    /// - `input_values`: `[B, L]` waveform
    /// - `attention_mask`: `[B, L]` sample validity
    /// - `mask_time_indices`: `[B, T]` u8 time mask
    pub fn forward(
        &self,
        input_values: &Tensor,
        attention_mask: Option<&Tensor>,
        mask_time_indices: Option<&Tensor>,
        train: bool,
    ) -> Result<BackboneOutput> {
        let features = self
            .feature_extractor
            .forward(input_values, train)?
            .transpose(1, 2)?; // [B, T, C]
        let frame_mask = match attention_mask {
            Some(mask) => Some(self.feature_vector_attention_mask(features.dim(1)?, mask)?),
            None => None,
        };

        let (hidden_states, extract_features) =
            self.feature_projection.forward(&features, train)?;
        let hidden_states = self.mask_hidden_states(&hidden_states, mask_time_indices)?;
        let last_hidden_state = self
            .encoder
            .forward(&hidden_states, frame_mask.as_ref(), train)?;

        Ok(BackboneOutput {
            last_hidden_state,
            extract_features,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn tiny_config(stable: bool) -> Wav2Vec2Config {
        Wav2Vec2Config {
            conv_dim: vec![8, 8],
            conv_stride: vec![5, 2],
            conv_kernel: vec![10, 3],
            hidden_size: 16,
            num_hidden_layers: 2,
            num_attention_heads: 2,
            intermediate_size: 32,
            num_conv_pos_embeddings: 4,
            num_conv_pos_embedding_groups: 2,
            do_stable_layer_norm: stable,
            ..Default::default()
        }
    }

    #[test]
    fn positional_conv_preserves_length_with_even_kernel() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let pos = PositionalConvEmbedding::load(vb, &tiny_config(false)).unwrap();
        let x = Tensor::randn(0.0_f32, 1.0, (2, 11, 16), &device).unwrap();
        assert_eq!(pos.forward(&x).unwrap().dims(), &[2, 11, 16]);
    }

    #[test]
    fn weight_norm_has_unit_direction() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let pos = PositionalConvEmbedding::load(vb, &tiny_config(false)).unwrap();
        // With g = 1 every kernel tap has unit Frobenius norm.
        let norms: Vec<f32> = pos
            .weight()
            .unwrap()
            .sqr()
            .unwrap()
            .sum_keepdim(0)
            .unwrap()
            .sum_keepdim(1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        for n in norms {
            assert!((n - 1.0).abs() < 1e-4, "norm = {n}");
        }
    }

    #[test]
    fn encoder_output_shape_both_layouts() {
        let device = Device::Cpu;
        for stable in [false, true] {
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
            let encoder = Encoder::load(vb, &tiny_config(stable)).unwrap();
            let x = Tensor::randn(0.0_f32, 1.0, (2, 9, 16), &device).unwrap();
            let out = encoder.forward(&x, None, false).unwrap();
            assert_eq!(out.dims(), &[2, 9, 16]);
        }
    }

    #[test]
    fn padded_frames_do_not_change_valid_outputs() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let cfg = Wav2Vec2Config {
            num_conv_pos_embeddings: 1,
            num_conv_pos_embedding_groups: 1,
            ..tiny_config(true)
        };
        let encoder = Encoder::load(vb, &cfg).unwrap();

        let x = Tensor::randn(0.0_f32, 1.0, (1, 6, 16), &device).unwrap();
        let mask = Tensor::new(&[[1f32, 1., 1., 1., 0., 0.]], &device).unwrap();
        let noise = Tensor::randn(0.0_f32, 5.0, (1, 2, 16), &device).unwrap();
        let x_noisy = Tensor::cat(&[&x.narrow(1, 0, 4).unwrap(), &noise], 1).unwrap();

        let a = encoder.forward(&x, Some(&mask), false).unwrap();
        let b = encoder.forward(&x_noisy, Some(&mask), false).unwrap();
        let diff: f32 = (a.narrow(1, 0, 4).unwrap() - b.narrow(1, 0, 4).unwrap())
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-5, "valid frames changed by {diff}");
    }

    #[test]
    fn masked_frames_take_the_mask_embedding() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = Wav2Vec2Model::load(vb, &tiny_config(false)).unwrap();

        let hidden = Tensor::randn(0.0_f32, 1.0, (1, 4, 16), &device).unwrap();
        let mask = Tensor::new(&[[0u8, 1, 0, 1]], &device).unwrap();
        let out = model.mask_hidden_states(&hidden, Some(&mask)).unwrap();

        let embed: Vec<f32> = model.masked_spec_embed.to_vec1().unwrap();
        let frame1: Vec<f32> = out.get(0).unwrap().get(1).unwrap().to_vec1().unwrap();
        let frame0: Vec<f32> = out.get(0).unwrap().get(0).unwrap().to_vec1().unwrap();
        let orig0: Vec<f32> = hidden.get(0).unwrap().get(0).unwrap().to_vec1().unwrap();
        assert_eq!(frame1, embed);
        assert_eq!(frame0, orig0);
    }

    #[test]
    fn attention_mask_reduced_to_frames() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let cfg = tiny_config(false);
        let model = Wav2Vec2Model::load(vb, &cfg).unwrap();

        let mut rows = vec![1f32; 2 * 400];
        rows[400 + 200..].fill(0.0);
        let mask = Tensor::from_vec(rows, (2, 400), &device).unwrap();
        let frames = cfg.feat_extract_output_length(400);
        let reduced: Vec<Vec<f32>> = model
            .feature_vector_attention_mask(frames, &mask)
            .unwrap()
            .to_vec2()
            .unwrap();
        let valid: Vec<usize> = reduced
            .iter()
            .map(|r| r.iter().filter(|&&v| v > 0.5).count())
            .collect();
        assert_eq!(valid, vec![frames, cfg.feat_extract_output_length(200)]);
    }

    #[test]
    fn backbone_forward_shapes() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let cfg = tiny_config(false);
        let model = Wav2Vec2Model::load(vb, &cfg).unwrap();

        let wav = Tensor::randn(0.0_f32, 1.0, (2, 400), &device).unwrap();
        let out = model.forward(&wav, None, None, false).unwrap();
        let frames = cfg.feat_extract_output_length(400);
        assert_eq!(out.last_hidden_state.dims(), &[2, frames, 16]);
        assert_eq!(out.extract_features.dims(), &[2, frames, 8]);
    }
}
