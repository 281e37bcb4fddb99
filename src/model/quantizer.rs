//! Gumbel-softmax product quantizer.
//!
//! ```text
//! extract_features [B, T, C]
//!   ─→ weight_proj Linear(C, G·V) ─→ [B·T·G, V] logits
//!   ─→ train: hard Gumbel-softmax (straight-through)
//!      eval:  one-hot argmax
//!   ─→ Σ_v p[g, v] · codevectors[g, v]  ─→ concat over groups ─→ [B, T, D]
//! ```
//!
//! Perplexity is computed from the marginal code distribution over the
//! (masked) frames and summed over groups; it reaches `G · V` when every code
//! is used uniformly.
//!
//! Key prefix: `quantizer`.

use candle_core::{D, DType, Module, Tensor};
use candle_nn::VarBuilder;

use crate::Result;
use crate::config::Wav2Vec2Config;

/// Product quantizer with `G` groups of `V` learnable codevectors each.
#[derive(Debug, Clone)]
pub struct GumbelVectorQuantizer {
    weight_proj: candle_nn::Linear,
    codevectors: Tensor, // [1, G·V, D / G]
    num_groups: usize,
    num_vars: usize,
    temperature: f64,
}

impl GumbelVectorQuantizer {
    pub fn load(vb: VarBuilder, cfg: &Wav2Vec2Config) -> Result<Self> {
        let num_groups = cfg.num_codevector_groups;
        let num_vars = cfg.num_codevectors_per_group;
        let codevectors = vb.get_with_hints(
            (1, num_groups * num_vars, cfg.codevector_dim / num_groups),
            "codevectors",
            candle_nn::Init::Uniform { lo: 0.0, up: 1.0 },
        )?;
        let weight_proj = candle_nn::linear(
            cfg.extract_dim(),
            num_groups * num_vars,
            vb.pp("weight_proj"),
        )?;
        Ok(Self {
            weight_proj,
            codevectors,
            num_groups,
            num_vars,
            temperature: 2.0,
        })
    }

    /// Gumbel-softmax temperature used in training mode.
    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    pub fn set_temperature(&mut self, temperature: f64) {
        self.temperature = temperature;
    }

    /// Quantize `[B, T, C]` features.
    ///
    /// `mask_time_indices` (`[B, T]`, non-zero = masked) restricts the
    /// perplexity marginal to masked frames.
    ///
    /// Returns (`[B, T, D]` codevectors, scalar perplexity).
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        mask_time_indices: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let (batch, seq_len, _) = hidden_states.dims3()?;
        let rows = batch * seq_len * self.num_groups;

        let logits = self
            .weight_proj
            .forward(hidden_states)?
            .to_dtype(DType::F32)?
            .reshape((rows, self.num_vars))?;

        let (probs, perplexity) = if train {
            let soft = self.gumbel_softmax(&logits)?;
            let hard = one_hot_argmax(&soft)?;
            // Straight-through: forward is one-hot, gradient is the soft sample's.
            let probs = ((hard - soft.detach())? + &soft)?;
            let marginal_src = candle_nn::ops::softmax(&logits, D::Minus1)?;
            let perplexity = self.perplexity(&marginal_src, mask_time_indices)?;
            (probs, perplexity)
        } else {
            let probs = one_hot_argmax(&logits)?;
            let perplexity = self.perplexity(&probs, mask_time_indices)?;
            (probs, perplexity)
        };

        // [B·T, G·V, 1] * [1, G·V, D/G] → [B·T, G, V, D/G] → Σ_v
        let codevectors = self.codevectors.to_dtype(DType::F32)?;
        let per_group = probs
            .reshape((batch * seq_len, self.num_groups * self.num_vars, 1))?
            .broadcast_mul(&codevectors)?;
        let sub_dim = codevectors.dim(2)?;
        let quantized = per_group
            .reshape((batch * seq_len, self.num_groups, self.num_vars, sub_dim))?
            .sum(2)?
            .reshape((batch, seq_len, self.num_groups * sub_dim))?
            .to_dtype(hidden_states.dtype())?;

        Ok((quantized, perplexity))
    }

    /// Soft Gumbel-softmax sample over the last axis.
    fn gumbel_softmax(&self, logits: &Tensor) -> Result<Tensor> {
        let uniform = Tensor::rand(1e-10f32, 1.0, logits.shape(), logits.device())?;
        let gumbel = uniform.log()?.neg()?.log()?.neg()?;
        let y = ((logits + gumbel)? / self.temperature)?;
        Ok(candle_nn::ops::softmax(&y, D::Minus1)?)
    }

    /// `Σ_g exp(-Σ_v p̄[g, v] log p̄[g, v])` over the code marginal `p̄`.
    fn perplexity(&self, probs: &Tensor, mask_time_indices: Option<&Tensor>) -> Result<Tensor> {
        let frames = probs.dim(0)? / self.num_groups;
        let probs = probs.reshape((frames, self.num_groups, self.num_vars))?;
        let marginal = match mask_time_indices {
            Some(mask) => {
                let mask = mask
                    .ne(0u8)?
                    .to_dtype(DType::F32)?
                    .reshape((frames, 1, 1))?;
                let count = mask.sum_all()?.maximum(1.0)?;
                probs
                    .broadcast_mul(&mask)?
                    .sum(0)?
                    .broadcast_div(&count)?
            }
            None => probs.mean(0)?,
        };
        let entropy = (&marginal * (&marginal + 1e-7)?.log()?)?.sum(D::Minus1)?.neg()?;
        Ok(entropy.exp()?.sum_all()?)
    }
}

/// One-hot encoding of the argmax over the last axis of a `[N, V]` tensor.
fn one_hot_argmax(x: &Tensor) -> Result<Tensor> {
    let num_vars = x.dim(D::Minus1)?;
    let idx = x.argmax_keepdim(D::Minus1)?; // [N, 1] u32
    let range = Tensor::arange(0u32, num_vars as u32, x.device())?.unsqueeze(0)?;
    Ok(range.broadcast_eq(&idx)?.to_dtype(x.dtype())?)
}
