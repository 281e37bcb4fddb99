//! Stages of the training loop.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Which pass a batch belongs to.
///
/// `Attack` marks forward passes run by an attack on a perturbed input: no
/// device transfer, and the loss is the raw contrastive term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Stage {
    Train,
    Valid,
    Test,
    Attack,
}

impl Stage {
    /// Stages that accumulate accuracy metrics.
    pub fn is_evaluation(self) -> bool {
        matches!(self, Stage::Valid | Stage::Test)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Train => "TRAIN",
            Stage::Valid => "VALID",
            Stage::Test => "TEST",
            Stage::Attack => "ATTACK",
        };
        f.write_str(name)
    }
}

/// Accumulator an evaluation accuracy is pushed into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccuracyTarget {
    /// Clean inputs.
    #[default]
    Clean,
    /// Untargeted adversarial inputs.
    Adversarial,
    /// Targeted adversarial inputs.
    AdversarialTargeted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluation_stages() {
        assert!(Stage::Valid.is_evaluation());
        assert!(Stage::Test.is_evaluation());
        assert!(!Stage::Train.is_evaluation());
        assert!(!Stage::Attack.is_evaluation());
    }

    #[test]
    fn display_and_serde_agree() {
        for stage in [Stage::Train, Stage::Valid, Stage::Test, Stage::Attack] {
            let json = serde_json::to_string(&stage).unwrap();
            assert_eq!(json, format!("\"{stage}\""));
        }
    }
}
