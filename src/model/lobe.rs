//! Pretraining lobe: the model plus everything sampled per call.
//!
//! One call normalizes the waveform batch, draws the time mask and the
//! negative indices from the lobe's seeded RNG, and runs the pretraining
//! forward. The mask is returned next to the output so metrics use the same
//! frames the loss was computed on.
//!
//! Negatives are drawn over the whole sequence rather than over the masked
//! frames only, which keeps short utterances usable.

use std::path::PathBuf;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use super::masking::{compute_mask_indices, mask_to_tensor, sample_negative_indices};
use super::pretraining::{
    PreTrainingOutput, PretrainingInputs, QuantizedRepresentation, Wav2Vec2ForPreTraining,
};
use crate::Result;
use crate::config::{ModelSourceConfig, Wav2Vec2Config};

/// Epsilon of the whole-batch waveform normalization.
const WAV_NORM_EPS: f64 = 1e-5;

/// Wav2Vec2 pretraining model with its own mask and negative sampling.
pub struct Wav2Vec2Pretrain {
    model: Wav2Vec2ForPreTraining,
    varmap: VarMap,
    source: ModelSourceConfig,
    rng: ChaCha8Rng,
    device: Device,
}

impl Wav2Vec2Pretrain {
    /// Download `config.json` and `model.safetensors` from the Hub into
    /// `source.save_path` and load them.
    pub fn from_pretrained(source: ModelSourceConfig, device: &Device) -> Result<Self> {
        tracing::info!(repo = %source.source, cache = ?source.save_path, "fetching wav2vec2 weights");
        let api = hf_hub::api::sync::ApiBuilder::new()
            .with_cache_dir(source.save_path.clone())
            .build()?;
        let repo = api.model(source.source.clone());
        let config_path = repo.get("config.json")?;
        let weights_path = repo.get("model.safetensors")?;

        let config = Wav2Vec2Config::from_json_file(&config_path)?;
        let mut lobe = Self::from_config(&config, source, device)?;
        lobe.load_weights(weights_path)?;
        Ok(lobe)
    }

    /// Build with freshly initialized weights.
    pub fn from_config(
        config: &Wav2Vec2Config,
        source: ModelSourceConfig,
        device: &Device,
    ) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = Wav2Vec2ForPreTraining::load(vb, config)?;
        let rng = ChaCha8Rng::seed_from_u64(source.seed);
        tracing::debug!(
            vars = varmap.all_vars().len(),
            hidden = config.hidden_size,
            layers = config.num_hidden_layers,
            "wav2vec2 pretraining model built"
        );
        Ok(Self {
            model,
            varmap,
            source,
            rng,
            device: device.clone(),
        })
    }

    /// Overwrite every parameter from a safetensors file.
    pub fn load_weights(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        let path = path.into();
        self.varmap
            .load(&path)
            .map_err(|e| crate::Error::WeightLoad(format!("{}: {e}", path.display())))?;
        tracing::info!(path = %path.display(), "wav2vec2 weights loaded");
        Ok(())
    }

    pub fn model(&self) -> &Wav2Vec2ForPreTraining {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut Wav2Vec2ForPreTraining {
        &mut self.model
    }

    /// Trainable parameters.
    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Layer-normalize over the entire tensor, batch axis included.
    pub fn normalize_wav(wav: &Tensor) -> Result<Tensor> {
        let mean = wav.mean_all()?;
        let centered = wav.broadcast_sub(&mean)?;
        let variance = centered.sqr()?.mean_all()?;
        Ok(centered.broadcast_div(&(variance + WAV_NORM_EPS)?.sqrt()?)?)
    }

    /// Encode a `[B, L]` waveform batch.
    ///
    /// Returns the pretraining output (loss included) and the `[B, T]` u8 time
    /// mask it was computed with.
    pub fn forward(
        &mut self,
        wav: &Tensor,
        quantized_representation: Option<&QuantizedRepresentation>,
    ) -> Result<(PreTrainingOutput, Tensor)> {
        let (batch, raw_len) = wav.dims2()?;
        let wav = if self.source.normalize_wav {
            Self::normalize_wav(wav)?
        } else {
            wav.clone()
        };
        let seq_len = self.model.feat_extract_output_length(raw_len);

        let mask = compute_mask_indices(
            (batch, seq_len),
            self.source.mask_prob,
            self.source.mask_length,
            0,
            None,
            &mut self.rng,
        )?;
        let mask = mask_to_tensor(&mask, wav.device())?;
        let negatives = sample_negative_indices(
            (batch, seq_len),
            self.model.config().num_negatives,
            None,
            &mut self.rng,
            wav.device(),
        )?;

        let output = self.model.forward(
            &wav,
            &PretrainingInputs {
                attention_mask: None,
                mask_time_indices: Some(&mask),
                sampled_negative_indices: Some(&negatives),
                quantized_representation,
            },
        )?;
        Ok((output, mask))
    }
}
