//! Running metric accumulators.

use super::stage::AccuracyTarget;
use crate::{Error, Result};

/// Appends scalar values and reduces them to their mean.
#[derive(Debug, Clone)]
pub struct MetricAccumulator {
    name: &'static str,
    values: Vec<f64>,
}

impl MetricAccumulator {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            values: Vec::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn reset(&mut self) {
        self.values.clear();
    }

    pub fn push(&mut self, value: f64) {
        self.values.push(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Arithmetic mean of everything pushed since the last reset.
    pub fn reduce(&self) -> Result<f64> {
        if self.values.is_empty() {
            return Err(Error::EmptyAccumulator(self.name));
        }
        Ok(self.values.iter().sum::<f64>() / self.values.len() as f64)
    }
}

/// Accuracy accumulators of one evaluation stage.
#[derive(Debug, Clone)]
pub struct AccuracyMetrics {
    pub clean: MetricAccumulator,
    pub adversarial: MetricAccumulator,
    pub adversarial_targeted: MetricAccumulator,
}

impl Default for AccuracyMetrics {
    fn default() -> Self {
        Self {
            clean: MetricAccumulator::new("acc"),
            adversarial: MetricAccumulator::new("adv acc"),
            adversarial_targeted: MetricAccumulator::new("adv acc target"),
        }
    }
}

impl AccuracyMetrics {
    pub fn get_mut(&mut self, target: AccuracyTarget) -> &mut MetricAccumulator {
        match target {
            AccuracyTarget::Clean => &mut self.clean,
            AccuracyTarget::Adversarial => &mut self.adversarial,
            AccuracyTarget::AdversarialTargeted => &mut self.adversarial_targeted,
        }
    }

    pub fn reset(&mut self) {
        self.clean.reset();
        self.adversarial.reset();
        self.adversarial_targeted.reset();
    }
}
