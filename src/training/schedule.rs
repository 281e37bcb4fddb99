//! Noam learning-rate annealing.
//!
//! Linear warm-up followed by inverse square-root decay:
//!
//! `lr(n) = lr_initial · normalize · min(n^-0.5, n · warmup^-1.5)`
//!
//! with `normalize = warmup^0.5` (peak equals `lr_initial` at `n = warmup`) or
//! `model_size^-0.5` when a model size is configured.

use candle_nn::Optimizer;
use serde::{Deserialize, Serialize};

/// Schedule parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoamConfig {
    /// Peak learning rate.
    pub lr_initial: f64,
    /// Updates before the decay starts.
    #[serde(default = "default_n_warmup_steps")]
    pub n_warmup_steps: usize,
    /// Transformer width, replaces the warm-up normalization when set.
    #[serde(default)]
    pub model_size: Option<usize>,
}

impl Default for NoamConfig {
    fn default() -> Self {
        Self {
            lr_initial: 5e-4,
            n_warmup_steps: default_n_warmup_steps(),
            model_size: None,
        }
    }
}

fn default_n_warmup_steps() -> usize {
    25_000
}

/// Stateful Noam schedule, advanced once per optimizer update.
#[derive(Debug, Clone)]
pub struct NoamScheduler {
    config: NoamConfig,
    normalize: f64,
    n_steps: usize,
    current_lr: f64,
}

impl NoamScheduler {
    pub fn new(config: NoamConfig) -> Self {
        let normalize = match config.model_size {
            Some(size) => (size as f64).powf(-0.5),
            None => (config.n_warmup_steps as f64).sqrt(),
        };
        Self {
            current_lr: config.lr_initial,
            normalize,
            n_steps: 0,
            config,
        }
    }

    /// Number of updates annealed so far.
    pub fn n_steps(&self) -> usize {
        self.n_steps
    }

    /// Rate the optimizer ran with before the latest annealing step.
    pub fn current_lr(&self) -> f64 {
        self.current_lr
    }

    /// Rate for update number `n_steps` (1-based).
    pub fn lr_at(&self, n_steps: usize) -> f64 {
        let n = n_steps.max(1) as f64;
        let warmup = self.config.n_warmup_steps.max(1) as f64;
        let scale = self.normalize * n.powf(-0.5).min(n * warmup.powf(-1.5));
        self.config.lr_initial * scale
    }

    /// Advance one update and set the optimizer's rate.
    ///
    /// Returns `(previous_lr, new_lr)`.
    pub fn anneal<O: Optimizer>(&mut self, optimizer: &mut O) -> (f64, f64) {
        self.n_steps += 1;
        let previous = optimizer.learning_rate();
        let lr = self.lr_at(self.n_steps);
        optimizer.set_learning_rate(lr);
        self.current_lr = previous;
        tracing::trace!(step = self.n_steps, lr, "noam annealing");
        (previous, lr)
    }
}
