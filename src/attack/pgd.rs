//! L∞ projected gradient ascent on the contrastive loss.
//!
//! The quantized targets are computed once from the clean input and frozen on
//! the batch, so every iteration scores the perturbed context states against
//! the same codevectors:
//!
//! ```text
//! q ← quantize(x)                       (detached)
//! δ ← 0 | U(−ε, ε)
//! repeat n:
//!     L = contrastive(x + δ; q)         ATTACK stage
//!     δ ← clip(δ + α · sign(∇δ L), −ε, ε)
//! return x + δ
//! ```

use candle_core::{DType, Tensor, Var};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use super::Attack;
use crate::training::{PretrainBatch, PretrainBrain, Stage};
use crate::{Error, Result};

/// PGD hyper-parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PgdConfig {
    /// L∞ radius of the perturbation.
    pub epsilon: f64,
    /// Step size α per iteration.
    pub step_size: f64,
    #[serde(default = "default_iterations")]
    pub iterations: usize,
    /// Start from uniform noise in the ε-ball instead of zero.
    #[serde(default)]
    pub random_start: bool,
    #[serde(default)]
    pub seed: u64,
}

fn default_iterations() -> usize {
    10
}

impl PgdConfig {
    pub fn validate(&self) -> Result<()> {
        if self.epsilon <= 0.0 || self.step_size <= 0.0 {
            return Err(Error::Config(
                "pgd epsilon and step_size must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Untargeted contrastive PGD.
pub struct ContrastivePgd {
    config: PgdConfig,
    rng: ChaCha8Rng,
}

impl ContrastivePgd {
    pub fn new(config: PgdConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            config,
        })
    }

    pub fn config(&self) -> &PgdConfig {
        &self.config
    }

    fn initial_delta(&mut self, like: &Tensor) -> Result<Tensor> {
        if !self.config.random_start {
            return Ok(like.zeros_like()?);
        }
        let eps = self.config.epsilon as f32;
        let values: Vec<f32> = (0..like.elem_count())
            .map(|_| self.rng.random_range(-eps..=eps))
            .collect();
        Ok(Tensor::from_vec(values, like.shape(), like.device())?.to_dtype(like.dtype())?)
    }
}

/// Elementwise sign with `sign(0) = 0`.
fn sign(x: &Tensor) -> Result<Tensor> {
    let pos = x.gt(0f64)?.to_dtype(x.dtype())?;
    let neg = x.lt(0f64)?.to_dtype(x.dtype())?;
    Ok((pos - neg)?)
}

impl Attack for ContrastivePgd {
    fn perturb(
        &mut self,
        brain: &mut PretrainBrain,
        batch: &PretrainBatch,
    ) -> Result<PretrainBatch> {
        let representation = match &batch.quantized_representation {
            Some(rep) => rep.detach(),
            None => brain.compute_quantized_representation(batch)?,
        };
        let clean = batch.sig.detach();
        let eps = self.config.epsilon;
        let mut delta = self.initial_delta(&clean)?;

        for iteration in 0..self.config.iterations {
            let delta_var = Var::from_tensor(&delta)?;
            let adversarial = batch
                .with_signal((&clean + delta_var.as_tensor())?)
                .with_quantized_representation(representation.clone());
            let predictions = brain.compute_forward(&adversarial, Stage::Attack)?;
            let loss = brain.compute_objectives(predictions, Stage::Attack, Default::default())?;

            let grads = loss.backward()?;
            let grad = grads
                .get(delta_var.as_tensor())
                .ok_or_else(|| Error::Attack("no gradient reached the perturbation".into()))?;
            let step = (sign(grad)? * self.config.step_size)?;
            delta = (delta_var.as_tensor().detach() + step)?.clamp(-eps, eps)?;

            tracing::trace!(
                iteration,
                loss = loss.to_dtype(DType::F32)?.to_scalar::<f32>()?,
                "pgd step"
            );
        }

        Ok(batch
            .with_signal((clean + delta)?.detach())
            .with_quantized_representation(representation))
    }
}
