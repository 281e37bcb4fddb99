//! Contrastive + diversity objective of wav2vec 2.0 pretraining.
//!
//! ```text
//! quantized q [B,T,H] ──┬─ gather(negative_indices) ─→ q̃ [K,B,T,H]
//!                       │
//! [q; q̃] [K+1,B,T,H] ───┴─ cos(c, ·) / κ ─→ logits [K+1,B,T]
//!   ─→ q̃ == q  ⇒  −∞
//!   ─→ [B·T, K+1], target 0 on masked frames, IGNORE_INDEX elsewhere
//!   ─→ Σ cross-entropy                              = L_m
//!
//! (V − perplexity) / V · |mask|                      = L_d
//! L = L_m + α · L_d
//! ```
//!
//! Both terms are sums, never means: an empty mask gives `L_m = 0` exactly.

use candle_core::{D, DType, Tensor};

use crate::Result;
use crate::config::Wav2Vec2Config;

/// Target value of rows excluded from the cross entropy.
pub const IGNORE_INDEX: i64 = -100;

const COSINE_EPS: f64 = 1e-8;

/// The three loss terms of one forward pass.
#[derive(Debug, Clone)]
pub struct ContrastiveLossOutput {
    /// `contrastive_loss + diversity_loss_weight · diversity_loss`.
    pub loss: Tensor,
    pub contrastive_loss: Tensor,
    pub diversity_loss: Tensor,
}

/// Loss hyper-parameters taken from the model config.
#[derive(Debug, Clone, Copy)]
pub struct ContrastiveLoss {
    pub temperature: f64,
    pub num_codevectors: usize,
    pub diversity_loss_weight: f64,
}

impl ContrastiveLoss {
    pub fn from_config(cfg: &Wav2Vec2Config) -> Self {
        Self {
            temperature: cfg.contrastive_logits_temperature,
            num_codevectors: cfg.num_codevectors(),
            diversity_loss_weight: cfg.diversity_loss_weight,
        }
    }

    /// Compute the composite loss.
    ///
    /// - `quantized_features`: `[B, T, H]` projected codevectors (positives)
    /// - `transformer_features`: `[B, T, H]` projected context states
    /// - `perplexity`: scalar codevector perplexity
    /// - `mask_time_indices`: `[B, T]` u8, non-zero = masked
    /// - `negative_indices`: `[B, T, K]` u32 into the flattened `[B·T]` table
    pub fn compute(
        &self,
        quantized_features: &Tensor,
        transformer_features: &Tensor,
        perplexity: &Tensor,
        mask_time_indices: &Tensor,
        negative_indices: &Tensor,
    ) -> Result<ContrastiveLossOutput> {
        let negatives = gather_negatives(quantized_features, negative_indices)?;
        let logits = contrastive_logits(
            quantized_features,
            &negatives,
            transformer_features,
            self.temperature,
        )?;
        let logits = mask_degenerate_negatives(&logits, quantized_features, &negatives)?;

        // [K+1, B, T] → [B, T, K+1] → [B·T, K+1]
        let num_targets = logits.dim(0)?;
        let logits = logits
            .permute((1, 2, 0))?
            .reshape(((), num_targets))?;
        let masked = mask_time_indices.ne(0u8)?.flatten_all()?;
        let rows = masked.dim(0)?;
        let target = masked.where_cond(
            &Tensor::zeros(rows, DType::I64, masked.device())?,
            &Tensor::full(IGNORE_INDEX, rows, masked.device())?,
        )?;
        let contrastive_loss = cross_entropy_sum(&logits, &target)?;

        let num_masked = mask_time_indices
            .ne(0u8)?
            .to_dtype(DType::F32)?
            .sum_all()?;
        let diversity_loss = diversity_loss(perplexity, self.num_codevectors, &num_masked)?;

        let loss = (&contrastive_loss + (&diversity_loss * self.diversity_loss_weight)?)?;
        Ok(ContrastiveLossOutput {
            loss,
            contrastive_loss,
            diversity_loss,
        })
    }
}

/// Look up `[B, T, K]` indices in the flattened `[B·T, H]` feature table.
///
/// Returns `[K, B, T, H]`.
pub fn gather_negatives(quantized_features: &Tensor, negative_indices: &Tensor) -> Result<Tensor> {
    let (batch, seq_len, hidden) = quantized_features.dims3()?;
    let num_negatives = negative_indices.dim(2)?;
    let table = quantized_features.reshape((batch * seq_len, hidden))?;
    let flat = negative_indices.flatten_all()?.to_dtype(DType::U32)?;
    let negatives = table
        .index_select(&flat, 0)?
        .reshape((batch, seq_len, num_negatives, hidden))?
        .permute((2, 0, 1, 3))?
        .contiguous()?;
    Ok(negatives)
}

/// Cosine similarity of each context state against `[positive; negatives]`,
/// divided by `temperature`.
///
/// Returns `[K+1, B, T]` in f32.
pub fn contrastive_logits(
    positive: &Tensor,
    negatives: &Tensor,
    predicted: &Tensor,
    temperature: f64,
) -> Result<Tensor> {
    let targets = Tensor::cat(&[&positive.unsqueeze(0)?, negatives], 0)?.to_dtype(DType::F32)?;
    let predicted = predicted.to_dtype(DType::F32)?.unsqueeze(0)?;
    let dot = targets.broadcast_mul(&predicted)?.sum(D::Minus1)?;
    let target_norm = targets.sqr()?.sum(D::Minus1)?.sqrt()?.maximum(COSINE_EPS)?;
    let predicted_norm = predicted
        .sqr()?
        .sum(D::Minus1)?
        .sqrt()?
        .maximum(COSINE_EPS)?;
    let cosine = dot.broadcast_div(&target_norm.broadcast_mul(&predicted_norm)?)?;
    Ok((cosine / temperature)?)
}

/// Set the logit of every negative identical to its positive to `−∞`.
///
/// `logits` is `[K+1, B, T]` with the positive in row 0.
pub fn mask_degenerate_negatives(
    logits: &Tensor,
    positive: &Tensor,
    negatives: &Tensor,
) -> Result<Tensor> {
    let num_negatives = negatives.dim(0)?;
    // All components equal ⇔ the minimum of the elementwise equality is 1.
    let neg_is_pos = negatives
        .broadcast_eq(&positive.unsqueeze(0)?)?
        .min(D::Minus1)?; // [K, B, T] u8
    let positive_logits = logits.narrow(0, 0, 1)?;
    let negative_logits = logits.narrow(0, 1, num_negatives)?;
    let neg_inf = Tensor::full(f32::NEG_INFINITY, negative_logits.shape(), logits.device())?
        .to_dtype(negative_logits.dtype())?;
    let negative_logits = neg_is_pos.where_cond(&neg_inf, &negative_logits)?;
    Ok(Tensor::cat(&[&positive_logits, &negative_logits], 0)?)
}

/// Summed cross entropy over `[N, C]` logits, skipping rows whose `i64`
/// target equals [`IGNORE_INDEX`].
pub fn cross_entropy_sum(logits: &Tensor, target: &Tensor) -> Result<Tensor> {
    let log_probs = candle_nn::ops::log_softmax(&logits.to_dtype(DType::F32)?, D::Minus1)?;
    let keep = target.ne(IGNORE_INDEX)?; // [N] u8
    let safe_target = keep
        .where_cond(target, &target.zeros_like()?)?
        .to_dtype(DType::U32)?
        .unsqueeze(1)?;
    let nll = log_probs.gather(&safe_target, 1)?.squeeze(1)?.neg()?;
    let nll = keep.where_cond(&nll, &nll.zeros_like()?)?;
    Ok(nll.sum_all()?)
}

/// `(V − perplexity) / V · num_masked`.
pub fn diversity_loss(
    perplexity: &Tensor,
    num_codevectors: usize,
    num_masked: &Tensor,
) -> Result<Tensor> {
    let v = num_codevectors as f64;
    let fraction = perplexity.to_dtype(DType::F32)?.affine(-1.0 / v, 1.0)?;
    Ok(fraction.broadcast_mul(num_masked)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};

    fn loss_fn() -> ContrastiveLoss {
        ContrastiveLoss {
            temperature: 0.1,
            num_codevectors: 8,
            diversity_loss_weight: 0.1,
        }
    }

    fn scalar(t: &Tensor) -> f32 {
        t.to_scalar::<f32>().unwrap()
    }

    #[test]
    fn degenerate_negative_gets_no_probability_mass() {
        let device = Device::Cpu;
        // T = 2: frame 0's single negative points at frame 0 itself.
        let quantized = Tensor::new(&[[[1f32, 0.], [0., 1.]]], &device).unwrap();
        let predicted = Tensor::new(&[[[1f32, 0.2], [0.3, 1.]]], &device).unwrap();
        let indices = Tensor::new(&[[[0u32], [0]]], &device).unwrap();

        let negatives = gather_negatives(&quantized, &indices).unwrap();
        let logits = contrastive_logits(&quantized, &negatives, &predicted, 0.1).unwrap();
        let logits = mask_degenerate_negatives(&logits, &quantized, &negatives).unwrap();
        let values: Vec<Vec<Vec<f32>>> = logits.to_vec3().unwrap();
        assert_eq!(values[1][0][0], f32::NEG_INFINITY);
        assert!(values[1][0][1].is_finite());

        let probs = candle_nn::ops::softmax(&logits.permute((1, 2, 0)).unwrap(), D::Minus1)
            .unwrap();
        let probs: Vec<Vec<Vec<f32>>> = probs.to_vec3().unwrap();
        assert_eq!(probs[0][0][1], 0.0);
        assert!((probs[0][0][0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn empty_mask_gives_exactly_zero_contrastive_loss() {
        let device = Device::Cpu;
        let quantized = Tensor::randn(0.0_f32, 1.0, (2, 4, 6), &device).unwrap();
        let predicted = Tensor::randn(0.0_f32, 1.0, (2, 4, 6), &device).unwrap();
        let indices = Tensor::new(
            &[
                [[1u32, 2], [0, 3], [1, 3], [0, 2]],
                [[5, 6], [4, 7], [5, 7], [4, 6]],
            ],
            &device,
        )
        .unwrap();
        let mask = Tensor::zeros((2, 4), DType::U8, &device).unwrap();
        let perplexity = Tensor::new(3.0f32, &device).unwrap();

        let out = loss_fn()
            .compute(&quantized, &predicted, &perplexity, &mask, &indices)
            .unwrap();
        assert_eq!(scalar(&out.contrastive_loss), 0.0);
        assert_eq!(scalar(&out.diversity_loss), 0.0);
        assert_eq!(scalar(&out.loss), 0.0);
    }

    #[test]
    fn diversity_loss_decreases_towards_full_usage() {
        let device = Device::Cpu;
        let num_masked = Tensor::new(10f32, &device).unwrap();
        let mut previous = f32::INFINITY;
        for p in [1f32, 2., 4., 6., 8.] {
            let perplexity = Tensor::new(p, &device).unwrap();
            let d = scalar(&diversity_loss(&perplexity, 8, &num_masked).unwrap());
            assert!(d < previous, "{d} !< {previous}");
            previous = d;
        }
        assert_eq!(previous, 0.0);
    }

    #[test]
    fn cross_entropy_skips_ignored_rows() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[0f32, 0.], [5., -5.], [100., 0.]], &device).unwrap();
        let target = Tensor::new(&[0i64, IGNORE_INDEX, IGNORE_INDEX], &device).unwrap();
        let loss = scalar(&cross_entropy_sum(&logits, &target).unwrap());
        assert!((loss - std::f32::consts::LN_2).abs() < 1e-6, "loss = {loss}");

        let target = Tensor::new(&[0i64, 1, IGNORE_INDEX], &device).unwrap();
        let loss = scalar(&cross_entropy_sum(&logits, &target).unwrap());
        // ln 2 + (10 + ln(1 + e^-10))
        assert!((loss - (std::f32::consts::LN_2 + 10.0)).abs() < 1e-3, "loss = {loss}");
    }

    #[test]
    fn masked_loss_is_positive_and_differentiable() {
        let device = Device::Cpu;
        let quantized = Tensor::randn(0.0_f32, 1.0, (1, 3, 4), &device).unwrap();
        let predicted =
            Var::from_tensor(&Tensor::randn(0.0_f32, 1.0, (1, 3, 4), &device).unwrap()).unwrap();
        let indices = Tensor::new(&[[[1u32, 2], [0, 2], [0, 1]]], &device).unwrap();
        let mask = Tensor::new(&[[1u8, 1, 0]], &device).unwrap();
        let perplexity = Tensor::new(2.0f32, &device).unwrap();

        let out = loss_fn()
            .compute(&quantized, predicted.as_tensor(), &perplexity, &mask, &indices)
            .unwrap();
        assert!(scalar(&out.contrastive_loss) > 0.0);
        // (8 − 2) / 8 · 2 masked frames
        assert!((scalar(&out.diversity_loss) - 1.5).abs() < 1e-6);

        let grads = out.loss.backward().unwrap();
        let grad = grads.get(predicted.as_tensor()).unwrap();
        let values: Vec<f32> = grad.flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|v| v.is_finite()));
        // The unmasked frame receives no gradient.
        let last: Vec<f32> = grad.get(0).unwrap().get(2).unwrap().to_vec1().unwrap();
        assert!(last.iter().all(|&v| v == 0.0));
    }
}
