//! Adversarial attacks on the pretraining objective.
//!
//! An [`Attack`] receives the brain so it can run ATTACK-stage forward passes
//! (no device transfer, raw contrastive loss, gradients flowing to the
//! waveform) and returns a perturbed copy of the batch.

pub mod pgd;

use crate::Result;
use crate::training::{PretrainBatch, PretrainBrain};

pub use pgd::{ContrastivePgd, PgdConfig};

/// Produces adversarial versions of waveform batches.
pub trait Attack {
    /// Perturb `batch.sig`. The returned batch is detached from any graph.
    fn perturb(&mut self, brain: &mut PretrainBrain, batch: &PretrainBatch)
    -> Result<PretrainBatch>;
}
