//! Dynamic loss scaling for reduced-precision training.

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};

use crate::Result;

/// Multiplies the loss before backward and divides the gradients after.
///
/// The scale halves whenever a non-finite gradient appears (that update is
/// skipped) and doubles after `growth_interval` clean updates.
#[derive(Debug, Clone)]
pub struct LossScaler {
    scale: f64,
    growth_factor: f64,
    backoff_factor: f64,
    growth_interval: usize,
    clean_steps: usize,
}

impl Default for LossScaler {
    fn default() -> Self {
        Self {
            scale: 65536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            clean_steps: 0,
        }
    }
}

impl LossScaler {
    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn scale_loss(&self, loss: &Tensor) -> Result<Tensor> {
        Ok((loss * self.scale)?)
    }

    /// Divide every gradient of `vars` by the scale in place.
    ///
    /// Returns `true` when any unscaled gradient is non-finite.
    pub fn unscale(&self, grads: &mut GradStore, vars: &[Var]) -> Result<bool> {
        let inv = 1.0 / self.scale;
        let mut found_inf = false;
        for var in vars {
            if let Some(grad) = grads.get(var.as_tensor()) {
                let unscaled = (grad * inv)?;
                let total: f32 = unscaled
                    .to_dtype(candle_core::DType::F32)?
                    .sum_all()?
                    .to_scalar()?;
                found_inf |= !total.is_finite();
                grads.insert(var.as_tensor(), unscaled);
            }
        }
        Ok(found_inf)
    }

    /// Adjust the scale after an update attempt.
    pub fn update(&mut self, found_inf: bool) {
        if found_inf {
            self.scale *= self.backoff_factor;
            self.clean_steps = 0;
            tracing::debug!(scale = self.scale, "loss scale backed off");
        } else {
            self.clean_steps += 1;
            if self.clean_steps >= self.growth_interval {
                self.scale *= self.growth_factor;
                self.clean_steps = 0;
            }
        }
    }
}
