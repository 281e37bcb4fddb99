//! Configuration for the Wav2Vec2 pretraining model and its training procedure.
//!
//! [`Wav2Vec2Config`] deserializes a HuggingFace `config.json`; defaults match
//! `facebook/wav2vec2-base`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Normalization applied inside the convolutional feature encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatExtractNorm {
    /// Per-channel GroupNorm after the first conv layer only.
    Group,
    /// LayerNorm over channels after every conv layer.
    Layer,
}

/// Wav2Vec2 model configuration (pretraining variant).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wav2Vec2Config {
    // --- Feature encoder ---
    #[serde(default = "default_feat_extract_norm")]
    pub feat_extract_norm: FeatExtractNorm,
    #[serde(default = "default_conv_dim")]
    pub conv_dim: Vec<usize>,
    #[serde(default = "default_conv_stride")]
    pub conv_stride: Vec<usize>,
    #[serde(default = "default_conv_kernel")]
    pub conv_kernel: Vec<usize>,
    #[serde(default)]
    pub conv_bias: bool,

    // --- Context network ---
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "default_num_hidden_layers")]
    pub num_hidden_layers: usize,
    #[serde(default = "default_num_attention_heads")]
    pub num_attention_heads: usize,
    #[serde(default = "default_intermediate_size")]
    pub intermediate_size: usize,
    #[serde(default = "default_num_conv_pos_embeddings")]
    pub num_conv_pos_embeddings: usize,
    #[serde(default = "default_num_conv_pos_embedding_groups")]
    pub num_conv_pos_embedding_groups: usize,
    #[serde(default)]
    pub do_stable_layer_norm: bool,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,

    // --- Dropout ---
    #[serde(default = "default_dropout")]
    pub hidden_dropout: f32,
    #[serde(default = "default_dropout")]
    pub attention_dropout: f32,
    #[serde(default = "default_dropout")]
    pub activation_dropout: f32,
    #[serde(default)]
    pub feat_proj_dropout: f32,
    #[serde(default)]
    pub feat_quantizer_dropout: f32,

    // --- Time masking ---
    #[serde(default = "default_mask_time_prob")]
    pub mask_time_prob: f64,
    #[serde(default = "default_mask_time_length")]
    pub mask_time_length: usize,
    #[serde(default = "default_mask_time_min_masks")]
    pub mask_time_min_masks: usize,

    // --- Quantizer ---
    #[serde(default = "default_num_codevectors_per_group")]
    pub num_codevectors_per_group: usize,
    #[serde(default = "default_num_codevector_groups")]
    pub num_codevector_groups: usize,
    #[serde(default = "default_codevector_dim")]
    pub codevector_dim: usize,
    #[serde(default = "default_codevector_dim")]
    pub proj_codevector_dim: usize,

    // --- Contrastive objective ---
    #[serde(default = "default_contrastive_logits_temperature")]
    pub contrastive_logits_temperature: f64,
    #[serde(default = "default_num_negatives")]
    pub num_negatives: usize,
    #[serde(default = "default_diversity_loss_weight")]
    pub diversity_loss_weight: f64,
}

impl Default for Wav2Vec2Config {
    fn default() -> Self {
        Self {
            feat_extract_norm: default_feat_extract_norm(),
            conv_dim: default_conv_dim(),
            conv_stride: default_conv_stride(),
            conv_kernel: default_conv_kernel(),
            conv_bias: false,
            hidden_size: default_hidden_size(),
            num_hidden_layers: default_num_hidden_layers(),
            num_attention_heads: default_num_attention_heads(),
            intermediate_size: default_intermediate_size(),
            num_conv_pos_embeddings: default_num_conv_pos_embeddings(),
            num_conv_pos_embedding_groups: default_num_conv_pos_embedding_groups(),
            do_stable_layer_norm: false,
            layer_norm_eps: default_layer_norm_eps(),
            hidden_dropout: default_dropout(),
            attention_dropout: default_dropout(),
            activation_dropout: default_dropout(),
            feat_proj_dropout: 0.0,
            feat_quantizer_dropout: 0.0,
            mask_time_prob: default_mask_time_prob(),
            mask_time_length: default_mask_time_length(),
            mask_time_min_masks: default_mask_time_min_masks(),
            num_codevectors_per_group: default_num_codevectors_per_group(),
            num_codevector_groups: default_num_codevector_groups(),
            codevector_dim: default_codevector_dim(),
            proj_codevector_dim: default_codevector_dim(),
            contrastive_logits_temperature: default_contrastive_logits_temperature(),
            num_negatives: default_num_negatives(),
            diversity_loss_weight: default_diversity_loss_weight(),
        }
    }
}

impl Wav2Vec2Config {
    /// Load a HuggingFace `config.json`. Unknown keys are ignored.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the cross-field invariants the model relies on.
    pub fn validate(&self) -> Result<()> {
        let layers = self.conv_dim.len();
        if layers == 0 || self.conv_stride.len() != layers || self.conv_kernel.len() != layers {
            return Err(Error::Config(format!(
                "conv_dim/conv_stride/conv_kernel must be non-empty and of equal length, got {}/{}/{}",
                self.conv_dim.len(),
                self.conv_stride.len(),
                self.conv_kernel.len()
            )));
        }
        if self.hidden_size % self.num_attention_heads != 0 {
            return Err(Error::Config(format!(
                "hidden_size {} is not divisible by num_attention_heads {}",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if self.codevector_dim % self.num_codevector_groups != 0 {
            return Err(Error::Config(format!(
                "codevector_dim {} is not divisible by num_codevector_groups {}",
                self.codevector_dim, self.num_codevector_groups
            )));
        }
        if self.hidden_size % self.num_conv_pos_embedding_groups != 0 {
            return Err(Error::Config(format!(
                "hidden_size {} is not divisible by num_conv_pos_embedding_groups {}",
                self.hidden_size, self.num_conv_pos_embedding_groups
            )));
        }
        if self.contrastive_logits_temperature <= 0.0 {
            return Err(Error::Config(
                "contrastive_logits_temperature must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Total number of codevectors `V = G × V_g`.
    pub fn num_codevectors(&self) -> usize {
        self.num_codevectors_per_group * self.num_codevector_groups
    }

    /// Output dimension of the last conv layer.
    pub fn extract_dim(&self) -> usize {
        self.conv_dim.last().copied().unwrap_or(0)
    }

    /// Number of feature frames produced for `input_length` raw samples.
    ///
    /// Each conv layer maps `L → floor((L - k) / s) + 1`.
    pub fn feat_extract_output_length(&self, input_length: usize) -> usize {
        self.conv_kernel
            .iter()
            .zip(&self.conv_stride)
            .fold(input_length, |len, (&kernel, &stride)| {
                len.saturating_sub(kernel) / stride + 1
            })
    }
}

/// Where the pretrained model comes from and how the lobe masks it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSourceConfig {
    /// HuggingFace Hub repository, e.g. `facebook/wav2vec2-base`.
    pub source: String,
    /// Local cache directory for downloaded files.
    pub save_path: PathBuf,
    /// Probability of a frame starting a masked span.
    #[serde(default = "default_lobe_mask_prob")]
    pub mask_prob: f64,
    /// Number of consecutive frames per masked span.
    #[serde(default = "default_lobe_mask_length")]
    pub mask_length: usize,
    /// Layer-normalize the whole waveform batch before encoding.
    #[serde(default = "default_true")]
    pub normalize_wav: bool,
    /// Seed for mask and negative sampling.
    #[serde(default)]
    pub seed: u64,
}

impl ModelSourceConfig {
    pub fn new(source: impl Into<String>, save_path: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            save_path: save_path.into(),
            mask_prob: default_lobe_mask_prob(),
            mask_length: default_lobe_mask_length(),
            normalize_wav: true,
            seed: 0,
        }
    }
}

/// Hyper-parameters of the pretraining procedure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrainConfig {
    /// Micro-batches per optimizer update.
    #[serde(default = "default_gradient_accumulation")]
    pub gradient_accumulation: usize,
    /// Global gradient-norm clipping threshold.
    #[serde(default = "default_max_grad_norm")]
    pub max_grad_norm: f64,
    /// Non-finite losses tolerated over the run before aborting.
    #[serde(default = "default_nonfinite_patience")]
    pub nonfinite_patience: usize,
    /// Scale the loss before backward and unscale before stepping.
    #[serde(default)]
    pub auto_mix_prec: bool,
    /// Peak learning rate handed to the Noam schedule.
    #[serde(default = "default_lr")]
    pub lr: f64,
    /// AdamW weight decay.
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    /// Set when weights were restored through the checkpointer, so the
    /// initial save at construction is skipped.
    #[serde(default)]
    pub restored_from_checkpoint: bool,
}

impl Default for BrainConfig {
    fn default() -> Self {
        Self {
            gradient_accumulation: default_gradient_accumulation(),
            max_grad_norm: default_max_grad_norm(),
            nonfinite_patience: default_nonfinite_patience(),
            auto_mix_prec: false,
            lr: default_lr(),
            weight_decay: default_weight_decay(),
            restored_from_checkpoint: false,
        }
    }
}

impl BrainConfig {
    pub fn validate(&self) -> Result<()> {
        if self.gradient_accumulation == 0 {
            return Err(Error::Config("gradient_accumulation must be >= 1".into()));
        }
        if self.max_grad_norm <= 0.0 {
            return Err(Error::Config("max_grad_norm must be positive".into()));
        }
        Ok(())
    }
}

fn default_feat_extract_norm() -> FeatExtractNorm {
    FeatExtractNorm::Group
}
fn default_conv_dim() -> Vec<usize> {
    vec![512; 7]
}
fn default_conv_stride() -> Vec<usize> {
    vec![5, 2, 2, 2, 2, 2, 2]
}
fn default_conv_kernel() -> Vec<usize> {
    vec![10, 3, 3, 3, 3, 2, 2]
}
fn default_hidden_size() -> usize {
    768
}
fn default_num_hidden_layers() -> usize {
    12
}
fn default_num_attention_heads() -> usize {
    12
}
fn default_intermediate_size() -> usize {
    3072
}
fn default_num_conv_pos_embeddings() -> usize {
    128
}
fn default_num_conv_pos_embedding_groups() -> usize {
    16
}
fn default_layer_norm_eps() -> f64 {
    1e-5
}
fn default_dropout() -> f32 {
    0.1
}
fn default_mask_time_prob() -> f64 {
    0.05
}
fn default_mask_time_length() -> usize {
    10
}
fn default_mask_time_min_masks() -> usize {
    2
}
fn default_num_codevectors_per_group() -> usize {
    320
}
fn default_num_codevector_groups() -> usize {
    2
}
fn default_codevector_dim() -> usize {
    256
}
fn default_contrastive_logits_temperature() -> f64 {
    0.1
}
fn default_num_negatives() -> usize {
    100
}
fn default_diversity_loss_weight() -> f64 {
    0.1
}
fn default_lobe_mask_prob() -> f64 {
    0.65
}
fn default_lobe_mask_length() -> usize {
    10
}
fn default_true() -> bool {
    true
}
fn default_gradient_accumulation() -> usize {
    1
}
fn default_max_grad_norm() -> f64 {
    5.0
}
fn default_nonfinite_patience() -> usize {
    3
}
fn default_lr() -> f64 {
    5e-4
}
fn default_weight_decay() -> f64 {
    0.01
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Wav2Vec2Config::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.num_codevectors(), 640);
        assert_eq!(cfg.extract_dim(), 512);
        assert_eq!(cfg.feat_extract_norm, FeatExtractNorm::Group);
    }

    #[test]
    fn test_output_length_one_second() {
        // 16 kHz → 49 frames at the standard 20 ms stride.
        let cfg = Wav2Vec2Config::default();
        assert_eq!(cfg.feat_extract_output_length(16000), 49);
    }

    #[test]
    fn test_parse_hf_config_json() {
        let json = r#"{
            "architectures": ["Wav2Vec2ForPreTraining"],
            "feat_extract_norm": "layer",
            "do_stable_layer_norm": true,
            "hidden_size": 1024,
            "num_attention_heads": 16,
            "num_hidden_layers": 24,
            "intermediate_size": 4096,
            "codevector_dim": 768,
            "proj_codevector_dim": 768
        }"#;
        let cfg: Wav2Vec2Config = serde_json::from_str(json).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.feat_extract_norm, FeatExtractNorm::Layer);
        assert!(cfg.do_stable_layer_norm);
        assert_eq!(cfg.hidden_size, 1024);
        // Untouched keys keep their defaults.
        assert_eq!(cfg.num_negatives, 100);
        assert_eq!(cfg.conv_stride, vec![5, 2, 2, 2, 2, 2, 2]);
    }

    #[test]
    fn test_mismatched_conv_lists_rejected() {
        let cfg = Wav2Vec2Config {
            conv_kernel: vec![10, 3],
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_model_source_defaults() {
        let src = ModelSourceConfig::new("facebook/wav2vec2-base", "/tmp/w2v");
        assert!((src.mask_prob - 0.65).abs() < 1e-12);
        assert_eq!(src.mask_length, 10);
        assert!(src.normalize_wav);
    }

    #[test]
    fn test_brain_config_rejects_zero_accumulation() {
        let cfg = BrainConfig {
            gradient_accumulation: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
