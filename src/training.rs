//! Pretraining procedure: stages, batches, optimizer bookkeeping.
//!
//! ## Modules
//!
//! - [`brain`] — [`PretrainBrain`], the stage-dispatching training object
//! - [`stage`] — [`Stage`] and [`AccuracyTarget`]
//! - [`metrics`] — mean accumulators for evaluation accuracy
//! - [`schedule`] — Noam learning-rate annealing
//! - [`scaler`] — dynamic loss scaling
//! - [`checkpoint`] — safetensors checkpoints with best-key retention
//! - [`logger`] — epoch statistics logging

pub mod brain;
pub mod checkpoint;
pub mod logger;
pub mod metrics;
pub mod scaler;
pub mod schedule;
pub mod stage;

use candle_core::{Device, Tensor};

use crate::Result;
use crate::model::QuantizedRepresentation;

pub use brain::{PretrainBrain, Predictions};
pub use checkpoint::{CheckpointMeta, Checkpointer, SafetensorsCheckpointer};
pub use logger::{FileTrainLogger, Stats, TrainLogger};
pub use metrics::{AccuracyMetrics, MetricAccumulator};
pub use scaler::LossScaler;
pub use schedule::{NoamConfig, NoamScheduler};
pub use stage::{AccuracyTarget, Stage};

/// A padded waveform batch.
#[derive(Debug, Clone)]
pub struct PretrainBatch {
    /// `[B, L]` waveforms.
    pub sig: Tensor,
    /// `[B]` valid length of each item relative to `L`, in `(0, 1]`.
    pub sig_lens: Tensor,
    /// Quantized targets frozen before an attack, reused by every forward on
    /// this batch.
    pub quantized_representation: Option<QuantizedRepresentation>,
}

impl PretrainBatch {
    pub fn new(sig: Tensor, sig_lens: Tensor) -> Self {
        Self {
            sig,
            sig_lens,
            quantized_representation: None,
        }
    }

    /// Same batch with every tensor on `device`.
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        let quantized_representation = match &self.quantized_representation {
            Some(rep) => Some(QuantizedRepresentation {
                quantized_features: rep.quantized_features.to_device(device)?,
                codevector_perplexity: rep.codevector_perplexity.to_device(device)?,
            }),
            None => None,
        };
        Ok(Self {
            sig: self.sig.to_device(device)?,
            sig_lens: self.sig_lens.to_device(device)?,
            quantized_representation,
        })
    }

    /// Same lengths and targets, different waveforms.
    pub fn with_signal(&self, sig: Tensor) -> Self {
        Self {
            sig,
            sig_lens: self.sig_lens.clone(),
            quantized_representation: self.quantized_representation.clone(),
        }
    }

    pub fn with_quantized_representation(mut self, rep: QuantizedRepresentation) -> Self {
        self.quantized_representation = Some(rep);
        self
    }
}
