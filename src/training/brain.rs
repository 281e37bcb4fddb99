//! Stage-dispatching pretraining procedure.
//!
//! ```text
//!              ┌──────── TRAIN ────────┐   ┌──── VALID / TEST ────┐   ┌─── ATTACK ───┐
//! batch ─→ to(device)            to(device)                  (as is)
//!   ─→ filter?                   filter?                     x + (filter(x) − x).detach()
//!   ─→ lobe(wav, batch.q?)       lobe(wav, batch.q?)         lobe(wav, batch.q?)
//!   ─→ loss                      loss, cos-acc → metrics     contrastive_loss
//!   ─→ backward / N, accumulate
//!      every N: unscale, check, clip, AdamW, Noam
//! ```
//!
//! The model runs in training mode (dropout, Gumbel sampling) only for TRAIN.
//! Every other stage is deterministic, so quantized targets computed once can
//! be reused across attack iterations.

use candle_core::backprop::GradStore;
use candle_core::{D, DType, Device, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};

use super::checkpoint::{CheckpointMeta, Checkpointer};
use super::logger::{Stats, TrainLogger};
use super::metrics::AccuracyMetrics;
use super::scaler::LossScaler;
use super::schedule::NoamScheduler;
use super::stage::{AccuracyTarget, Stage};
use super::PretrainBatch;
use crate::attack::Attack;
use crate::config::BrainConfig;
use crate::defense::SignalFilter;
use crate::model::{PreTrainingOutput, QuantizedRepresentation, Wav2Vec2Pretrain};
use crate::{Error, Result};

const COSINE_EPS: f64 = 1e-8;

/// What [`PretrainBrain::compute_forward`] hands to
/// [`PretrainBrain::compute_objectives`].
#[derive(Debug, Clone)]
pub enum Predictions {
    /// TRAIN: composite loss. ATTACK: contrastive loss.
    Loss(Tensor),
    /// VALID / TEST: composite loss with the output and time mask it came from.
    Evaluation {
        loss: Tensor,
        output: PreTrainingOutput,
        mask: Tensor,
    },
}

/// Training object for Wav2Vec2 pretraining under attack.
pub struct PretrainBrain {
    lobe: Wav2Vec2Pretrain,
    vars: Vec<Var>,
    optimizer: AdamW,
    noam: NoamScheduler,
    config: BrainConfig,
    checkpointer: Option<Box<dyn Checkpointer>>,
    train_logger: Option<Box<dyn TrainLogger>>,
    input_filter: Option<Box<dyn SignalFilter>>,
    scaler: Option<LossScaler>,
    metrics: AccuracyMetrics,
    train_stats: Option<Stats>,
    step: usize,
    pending_grads: Option<GradStore>,
    nonfinite_count: usize,
    device: Device,
}

impl PretrainBrain {
    /// Build the brain. When a checkpointer is given and the weights did not
    /// come through it, the initial weights are checkpointed right away.
    pub fn new(
        lobe: Wav2Vec2Pretrain,
        config: BrainConfig,
        noam: NoamScheduler,
        mut checkpointer: Option<Box<dyn Checkpointer>>,
        train_logger: Option<Box<dyn TrainLogger>>,
    ) -> Result<Self> {
        config.validate()?;
        let vars = lobe.varmap().all_vars();
        let optimizer = AdamW::new(
            vars.clone(),
            ParamsAdamW {
                lr: config.lr,
                weight_decay: config.weight_decay,
                ..Default::default()
            },
        )?;

        if let Some(checkpointer) = checkpointer.as_mut() {
            if !config.restored_from_checkpoint {
                checkpointer.save_checkpoint(lobe.varmap(), CheckpointMeta::new())?;
            }
        }

        tracing::info!(
            params = vars.iter().map(|v| v.elem_count()).sum::<usize>(),
            accumulation = config.gradient_accumulation,
            mixed_precision = config.auto_mix_prec,
            "pretrain brain ready"
        );

        Ok(Self {
            device: lobe.device().clone(),
            scaler: config.auto_mix_prec.then(LossScaler::default),
            lobe,
            vars,
            optimizer,
            noam,
            config,
            checkpointer,
            train_logger,
            input_filter: None,
            metrics: AccuracyMetrics::default(),
            train_stats: None,
            step: 0,
            pending_grads: None,
            nonfinite_count: 0,
        })
    }

    /// Filter every input waveform before the model.
    pub fn with_input_filter(mut self, filter: Box<dyn SignalFilter>) -> Self {
        self.input_filter = Some(filter);
        self
    }

    pub fn lobe(&self) -> &Wav2Vec2Pretrain {
        &self.lobe
    }

    pub fn lobe_mut(&mut self) -> &mut Wav2Vec2Pretrain {
        &mut self.lobe
    }

    pub fn metrics(&self) -> &AccuracyMetrics {
        &self.metrics
    }

    pub fn noam(&self) -> &NoamScheduler {
        &self.noam
    }

    pub fn optimizer(&self) -> &AdamW {
        &self.optimizer
    }

    /// Micro-batches seen by [`fit_batch`](Self::fit_batch).
    pub fn step(&self) -> usize {
        self.step
    }

    pub fn train_stats(&self) -> Option<&Stats> {
        self.train_stats.as_ref()
    }

    fn filter_input(&mut self, wavs: &Tensor, stage: Stage) -> Result<Tensor> {
        let Some(filter) = self.input_filter.as_mut() else {
            return Ok(wavs.clone());
        };
        let filtered = filter.apply(&wavs.detach())?;
        if stage == Stage::Attack {
            // Straight-through: filtered values, identity gradient.
            Ok((wavs + (filtered - wavs)?.detach())?)
        } else {
            Ok(filtered)
        }
    }

    /// Forward from waveforms to the stage's loss.
    pub fn compute_forward(&mut self, batch: &PretrainBatch, stage: Stage) -> Result<Predictions> {
        let batch = if stage == Stage::Attack {
            batch.clone()
        } else {
            batch.to_device(&self.device)?
        };
        self.lobe.model_mut().set_training(stage == Stage::Train);

        let wavs = self.filter_input(&batch.sig, stage)?;
        let (output, mask) = self
            .lobe
            .forward(&wavs, batch.quantized_representation.as_ref())?;

        let loss = match stage {
            Stage::Attack => output.contrastive_loss.clone(),
            _ => output.loss.clone(),
        }
        .ok_or(Error::MissingLoss)?;

        if stage.is_evaluation() {
            Ok(Predictions::Evaluation { loss, output, mask })
        } else {
            Ok(Predictions::Loss(loss))
        }
    }

    /// Extract the loss; evaluation stages also record the masked cosine
    /// accuracy into the accumulator selected by `target`.
    pub fn compute_objectives(
        &mut self,
        predictions: Predictions,
        stage: Stage,
        target: AccuracyTarget,
    ) -> Result<Tensor> {
        match predictions {
            Predictions::Loss(loss) => Ok(loss),
            Predictions::Evaluation { loss, output, mask } => {
                match masked_cosine_accuracy(
                    &output.projected_states,
                    &output.projected_quantized_states,
                    &mask,
                )? {
                    Some(acc) => self.metrics.get_mut(target).push(acc),
                    None => tracing::debug!(%stage, "no masked frames, accuracy not recorded"),
                }
                Ok(loss)
            }
        }
    }

    /// Quantized targets of the (filtered) clean batch, detached.
    pub fn compute_quantized_representation(
        &mut self,
        batch: &PretrainBatch,
    ) -> Result<QuantizedRepresentation> {
        self.lobe.model_mut().set_training(false);
        let wavs = self.filter_input(&batch.sig.detach(), Stage::Valid)?;
        let (output, _) = self.lobe.forward(&wavs, None)?;
        Ok(output.quantized_representation().detach())
    }

    /// One training micro-batch. Parameters move every
    /// `gradient_accumulation` calls.
    pub fn fit_batch(&mut self, batch: &PretrainBatch) -> Result<Tensor> {
        self.step += 1;
        let predictions = self.compute_forward(batch, Stage::Train)?;
        let loss = self.compute_objectives(predictions, Stage::Train, AccuracyTarget::Clean)?;

        let accumulation = self.config.gradient_accumulation;
        let mut scaled = (&loss / accumulation as f64)?;
        if let Some(scaler) = &self.scaler {
            scaled = scaler.scale_loss(&scaled)?;
        }
        let grads = scaled.backward()?;
        self.accumulate(grads)?;

        if self.step % accumulation == 0 {
            self.update(&loss)?;
        }
        Ok(loss.detach())
    }

    /// Perturb the batch with `attack`, then train on the result.
    pub fn fit_batch_adversarial(
        &mut self,
        batch: &PretrainBatch,
        attack: &mut dyn Attack,
    ) -> Result<Tensor> {
        let adversarial = attack.perturb(self, batch)?;
        self.fit_batch(&adversarial)
    }

    /// Loss of a VALID / TEST batch; records its clean accuracy.
    pub fn evaluate_batch(&mut self, batch: &PretrainBatch, stage: Stage) -> Result<Tensor> {
        let predictions = self.compute_forward(batch, stage)?;
        let loss = self.compute_objectives(predictions, stage, AccuracyTarget::Clean)?;
        Ok(loss.detach())
    }

    /// Clean and adversarial loss of a VALID / TEST batch.
    ///
    /// The adversarial accuracy goes to `target`'s accumulator, the clean one
    /// to [`AccuracyTarget::Clean`].
    pub fn evaluate_batch_adversarial(
        &mut self,
        batch: &PretrainBatch,
        stage: Stage,
        attack: &mut dyn Attack,
        target: AccuracyTarget,
    ) -> Result<(Tensor, Tensor)> {
        let adversarial = attack.perturb(self, batch)?;
        let predictions = self.compute_forward(&adversarial, stage)?;
        let adv_loss = self.compute_objectives(predictions, stage, target)?;

        let loss = self.evaluate_batch(batch, stage)?;
        Ok((loss, adv_loss.detach()))
    }

    pub fn on_stage_start(&mut self, stage: Stage, epoch: usize) {
        if stage.is_evaluation() {
            self.metrics = AccuracyMetrics::default();
        }
        tracing::debug!(%stage, epoch, "stage start");
    }

    /// Reduce, log and checkpoint at the end of a stage.
    pub fn on_stage_end(
        &mut self,
        stage: Stage,
        stage_loss: f64,
        epoch: usize,
        stage_adv_loss: Option<f64>,
        stage_adv_loss_target: Option<f64>,
    ) -> Result<()> {
        let mut stats = Stats::new();
        stats.insert("loss".into(), stage_loss.into());
        if let Some(adv_loss) = stage_adv_loss {
            stats.insert("adv_loss".into(), adv_loss.into());
        }
        if let Some(adv_loss) = stage_adv_loss_target {
            stats.insert("adv_loss target".into(), adv_loss.into());
        }

        match stage {
            Stage::Train => {
                self.train_stats = Some(stats);
                return Ok(());
            }
            Stage::Attack => return Ok(()),
            Stage::Valid | Stage::Test => {
                stats.insert("acc".into(), self.metrics.clean.reduce()?.into());
                if stage_adv_loss.is_some() {
                    stats.insert("adv acc".into(), self.metrics.adversarial.reduce()?.into());
                }
                if stage_adv_loss_target.is_some() {
                    stats.insert(
                        "adv acc target".into(),
                        self.metrics.adversarial_targeted.reduce()?.into(),
                    );
                }
            }
        }

        if stage == Stage::Valid {
            let mut meta = Stats::new();
            meta.insert("epoch".into(), epoch.into());
            meta.insert("lr".into(), self.noam.current_lr().into());
            meta.insert("steps".into(), self.noam.n_steps().into());
            meta.insert("optimizer".into(), "AdamW".into());
            if let Some(logger) = self.train_logger.as_mut() {
                logger.log_stats(&meta, self.train_stats.as_ref(), Some(&stats), None)?;
            }
            if let Some(checkpointer) = self.checkpointer.as_mut() {
                let mut ckpt_meta = CheckpointMeta::new();
                ckpt_meta.insert("acc".into(), stats["acc"].clone());
                ckpt_meta.insert("epoch".into(), epoch.into());
                checkpointer.save_and_keep_only(self.lobe.varmap(), ckpt_meta, "acc")?;
            }
        } else {
            let mut meta = Stats::new();
            meta.insert("Evaluation stage".into(), "TEST".into());
            if let Some(logger) = self.train_logger.as_mut() {
                logger.log_stats(&meta, None, None, Some(&stats))?;
            }
        }
        Ok(())
    }

    fn accumulate(&mut self, grads: GradStore) -> Result<()> {
        let Some(mut pending) = self.pending_grads.take() else {
            self.pending_grads = Some(grads);
            return Ok(());
        };
        for var in &self.vars {
            let Some(new) = grads.get(var.as_tensor()) else {
                continue;
            };
            let summed = match pending.get(var.as_tensor()) {
                Some(old) => (old + new)?,
                None => new.clone(),
            };
            pending.insert(var.as_tensor(), summed);
        }
        self.pending_grads = Some(pending);
        Ok(())
    }

    fn update(&mut self, loss: &Tensor) -> Result<()> {
        let Some(mut grads) = self.pending_grads.take() else {
            return Ok(());
        };
        let found_inf = match &self.scaler {
            Some(scaler) => scaler.unscale(&mut grads, &self.vars)?,
            None => false,
        };
        let loss_ok = self.check_gradients(loss, &mut grads)?;
        if loss_ok && !found_inf {
            self.optimizer.step(&grads)?;
        } else {
            tracing::debug!(step = self.step, found_inf, "optimizer step skipped");
        }
        if let Some(scaler) = self.scaler.as_mut() {
            scaler.update(found_inf);
        }
        self.noam.anneal(&mut self.optimizer);
        Ok(())
    }

    /// Guard an update: count non-finite losses against the patience, clip
    /// the global gradient norm otherwise.
    ///
    /// Returns whether the update should be applied.
    fn check_gradients(&mut self, loss: &Tensor, grads: &mut GradStore) -> Result<bool> {
        let value = loss.to_dtype(DType::F32)?.to_scalar::<f32>()?;
        if !value.is_finite() {
            self.nonfinite_count += 1;
            tracing::warn!(
                loss = value,
                count = self.nonfinite_count,
                patience = self.config.nonfinite_patience,
                "loss is not finite"
            );
            if self.nonfinite_count > self.config.nonfinite_patience {
                return Err(Error::NonFiniteLoss {
                    count: self.nonfinite_count,
                    patience: self.config.nonfinite_patience,
                });
            }
            return Ok(false);
        }
        let norm = clip_grad_norm(grads, &self.vars, self.config.max_grad_norm)?;
        tracing::trace!(grad_norm = norm, "gradients clipped");
        Ok(true)
    }
}

/// Scale all gradients so their global L2 norm is at most `max_norm`.
///
/// Returns the norm before clipping.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let mut total = 0f64;
    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            total += grad
                .sqr()?
                .sum_all()?
                .to_dtype(DType::F64)?
                .to_scalar::<f64>()?;
        }
    }
    let norm = total.sqrt();
    let coef = max_norm / (norm + 1e-6);
    if coef < 1.0 {
        for var in vars {
            let clipped = match grads.get(var.as_tensor()) {
                Some(grad) => (grad * coef)?,
                None => continue,
            };
            grads.insert(var.as_tensor(), clipped);
        }
    }
    Ok(norm)
}

/// Mean cosine similarity between two `[B, T, P]` tensors over the frames
/// where `mask` is non-zero. `None` when no frame is masked.
pub fn masked_cosine_accuracy(a: &Tensor, b: &Tensor, mask: &Tensor) -> Result<Option<f64>> {
    let a = a.detach().to_dtype(DType::F32)?;
    let b = b.detach().to_dtype(DType::F32)?;
    let dot = (&a * &b)?.sum(D::Minus1)?;
    let norm_a = a.sqr()?.sum(D::Minus1)?.sqrt()?.maximum(COSINE_EPS)?;
    let norm_b = b.sqr()?.sum(D::Minus1)?.sqrt()?.maximum(COSINE_EPS)?;
    let cosine = (dot / (norm_a * norm_b)?)?;

    let mask = mask.ne(0u8)?.to_dtype(DType::F32)?;
    let count = mask.sum_all()?.to_scalar::<f32>()?;
    if count == 0.0 {
        return Ok(None);
    }
    let total = (cosine * mask)?.sum_all()?.to_scalar::<f32>()?;
    Ok(Some(f64::from(total / count)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attack::{ContrastivePgd, PgdConfig};
    use crate::config::ModelSourceConfig;
    use crate::defense::{AsnrWiener, FilterConfig};
    use crate::model::pretraining::tests::tiny_config;
    use crate::training::checkpoint::SafetensorsCheckpointer;
    use crate::training::logger::FileTrainLogger;
    use crate::training::schedule::NoamConfig;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn lobe() -> Wav2Vec2Pretrain {
        let source = ModelSourceConfig {
            mask_length: 2,
            ..ModelSourceConfig::new("local/tiny", std::env::temp_dir())
        };
        Wav2Vec2Pretrain::from_config(&tiny_config(), source, &Device::Cpu).unwrap()
    }

    fn noam() -> NoamScheduler {
        NoamScheduler::new(NoamConfig {
            lr_initial: 1e-3,
            n_warmup_steps: 10,
            model_size: None,
        })
    }

    fn brain(config: BrainConfig) -> PretrainBrain {
        PretrainBrain::new(lobe(), config, noam(), None, None).unwrap()
    }

    fn batch(seed: f32) -> PretrainBatch {
        let device = Device::Cpu;
        let sig = Tensor::randn(seed, 1.0, (2, 400), &device).unwrap();
        let lens = Tensor::ones(2, DType::F32, &device).unwrap();
        PretrainBatch::new(sig, lens)
    }

    fn pgd(iterations: usize) -> ContrastivePgd {
        ContrastivePgd::new(PgdConfig {
            epsilon: 0.05,
            step_size: 0.02,
            iterations,
            random_start: false,
            seed: 0,
        })
        .unwrap()
    }

    fn param(brain: &PretrainBrain, name: &str) -> Vec<f32> {
        let data = brain.lobe().varmap().data().lock().unwrap();
        data[name].flatten_all().unwrap().to_vec1().unwrap()
    }

    #[test]
    fn stage_dispatch() {
        let mut brain = brain(BrainConfig::default());
        let b = batch(0.0);
        assert!(matches!(
            brain.compute_forward(&b, Stage::Train).unwrap(),
            Predictions::Loss(_)
        ));
        assert!(matches!(
            brain.compute_forward(&b, Stage::Attack).unwrap(),
            Predictions::Loss(_)
        ));
        for stage in [Stage::Valid, Stage::Test] {
            match brain.compute_forward(&b, stage).unwrap() {
                Predictions::Evaluation { output, mask, .. } => {
                    assert_eq!(mask.dims(), &output.projected_states.dims()[..2]);
                }
                Predictions::Loss(_) => panic!("{stage} should carry the output"),
            }
        }
    }

    #[test]
    fn attack_stage_reports_the_contrastive_term_only() {
        let dir = tempfile::tempdir().unwrap();
        let weights = dir.path().join("model.safetensors");
        let attacked = lobe();
        attacked.varmap().save(&weights).unwrap();
        let mut evaluated = lobe();
        evaluated.load_weights(&weights).unwrap();

        // Same weights and seed: both lobes draw the same mask and negatives.
        let mut attack_brain =
            PretrainBrain::new(attacked, BrainConfig::default(), noam(), None, None).unwrap();
        let mut valid_brain =
            PretrainBrain::new(evaluated, BrainConfig::default(), noam(), None, None).unwrap();
        let b = batch(0.0);

        let Predictions::Loss(attack_loss) = attack_brain.compute_forward(&b, Stage::Attack).unwrap()
        else {
            panic!("attack stage returns a bare loss");
        };
        let Predictions::Evaluation { loss, output, .. } =
            valid_brain.compute_forward(&b, Stage::Valid).unwrap()
        else {
            panic!("valid stage carries the output");
        };

        let attack_loss: f32 = attack_loss.to_scalar().unwrap();
        let contrastive: f32 = output.contrastive_loss.unwrap().to_scalar().unwrap();
        let composite: f32 = loss.to_scalar().unwrap();
        let from_output: f32 = output.loss.unwrap().to_scalar().unwrap();
        assert_eq!(attack_loss.to_bits(), contrastive.to_bits());
        assert_eq!(composite.to_bits(), from_output.to_bits());
        assert!(attack_loss < composite, "{attack_loss} vs {composite}");
    }

    #[test]
    fn parameters_move_only_every_nth_micro_batch() {
        let mut brain = brain(BrainConfig {
            gradient_accumulation: 2,
            ..Default::default()
        });
        let before = param(&brain, "project_hid.weight");

        brain.fit_batch(&batch(0.0)).unwrap();
        assert_eq!(param(&brain, "project_hid.weight"), before);
        assert_eq!(brain.noam().n_steps(), 0);

        brain.fit_batch(&batch(0.5)).unwrap();
        assert_ne!(param(&brain, "project_hid.weight"), before);
        assert_eq!(brain.noam().n_steps(), 1);
        assert!((brain.optimizer().learning_rate() - noam().lr_at(1)).abs() < 1e-15);
    }

    #[test]
    fn non_finite_loss_exhausts_patience() {
        let mut brain = brain(BrainConfig {
            nonfinite_patience: 1,
            ..Default::default()
        });
        let device = Device::Cpu;
        let nan = PretrainBatch::new(
            Tensor::full(f32::NAN, (2, 400), &device).unwrap(),
            Tensor::ones(2, DType::F32, &device).unwrap(),
        );
        let before = param(&brain, "project_hid.weight");

        let loss = brain.fit_batch(&nan).unwrap();
        assert!(!loss.to_scalar::<f32>().unwrap().is_finite());
        let after: Vec<f32> = param(&brain, "project_hid.weight");
        assert_eq!(after, before);

        let err = brain.fit_batch(&nan).unwrap_err();
        assert!(matches!(err, Error::NonFiniteLoss { count: 2, patience: 1 }));
    }

    #[test]
    fn finite_losses_do_not_reset_the_non_finite_count() {
        let mut brain = brain(BrainConfig {
            nonfinite_patience: 1,
            ..Default::default()
        });
        let device = Device::Cpu;
        let nan = PretrainBatch::new(
            Tensor::full(f32::NAN, (2, 400), &device).unwrap(),
            Tensor::ones(2, DType::F32, &device).unwrap(),
        );

        brain.fit_batch(&nan).unwrap();
        let finite = brain.fit_batch(&batch(0.0)).unwrap();
        assert!(finite.to_scalar::<f32>().unwrap().is_finite());
        let err = brain.fit_batch(&nan).unwrap_err();
        assert!(matches!(err, Error::NonFiniteLoss { count: 2, patience: 1 }));
    }

    #[test]
    fn clipping_bounds_the_global_norm() {
        let device = Device::Cpu;
        let a = Var::new(&[3f32, 0.], &device).unwrap();
        let b = Var::new(&[0f32, 4.], &device).unwrap();
        let loss = ((a.as_tensor().sqr().unwrap().sum_all().unwrap()
            + b.as_tensor().sqr().unwrap().sum_all().unwrap())
        .unwrap()
            * 0.5)
            .unwrap();
        let mut grads = loss.backward().unwrap();
        let vars = vec![a.clone(), b.clone()];
        let norm = clip_grad_norm(&mut grads, &vars, 1.0).unwrap();
        assert!((norm - 5.0).abs() < 1e-6);
        let ga: Vec<f32> = grads.get(a.as_tensor()).unwrap().to_vec1().unwrap();
        let gb: Vec<f32> = grads.get(b.as_tensor()).unwrap().to_vec1().unwrap();
        assert!((ga[0] - 0.6).abs() < 1e-5 && (gb[1] - 0.8).abs() < 1e-5);
    }

    #[test]
    fn masked_accuracy_ignores_unmasked_frames() {
        let device = Device::Cpu;
        let a = Tensor::new(&[[[1f32, 0.], [1., 0.]]], &device).unwrap();
        let b = Tensor::new(&[[[1f32, 0.], [-1., 0.]]], &device).unwrap();
        let mask = Tensor::new(&[[1u8, 0]], &device).unwrap();
        assert_eq!(masked_cosine_accuracy(&a, &b, &mask).unwrap(), Some(1.0));
        let none = Tensor::zeros((1, 2), DType::U8, &device).unwrap();
        assert_eq!(masked_cosine_accuracy(&a, &b, &none).unwrap(), None);
    }

    #[test]
    fn empty_accumulator_at_stage_end_is_an_error() {
        let mut brain = brain(BrainConfig::default());
        brain.on_stage_start(Stage::Test, 1);
        let err = brain.on_stage_end(Stage::Test, 1.0, 1, None, None).unwrap_err();
        assert!(matches!(err, Error::EmptyAccumulator("acc")));
    }

    #[test]
    fn epoch_flow_logs_and_checkpoints() {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let ckpt_dir = dir.path().join("save");
        let log_path = dir.path().join("train_log.txt");
        let mut brain = PretrainBrain::new(
            lobe(),
            BrainConfig::default(),
            noam(),
            Some(Box::new(SafetensorsCheckpointer::new(&ckpt_dir).unwrap())),
            Some(Box::new(FileTrainLogger::new(&log_path).unwrap())),
        )
        .unwrap();
        // Initial weights were saved at construction.
        let reader = SafetensorsCheckpointer::new(&ckpt_dir).unwrap();
        assert_eq!(reader.list().unwrap().len(), 1);

        brain.on_stage_start(Stage::Train, 1);
        let train_loss = brain.fit_batch(&batch(0.0)).unwrap();
        brain
            .on_stage_end(Stage::Train, f64::from(train_loss.to_scalar::<f32>().unwrap()), 1, None, None)
            .unwrap();
        assert!(brain.train_stats().unwrap().contains_key("loss"));

        brain.on_stage_start(Stage::Valid, 1);
        let mut attack = pgd(1);
        let mut total = 0f64;
        let mut adv_total = 0f64;
        for seed in [0.0f32, 0.3] {
            let (loss, adv) = brain
                .evaluate_batch_adversarial(&batch(seed), Stage::Valid, &mut attack, AccuracyTarget::Adversarial)
                .unwrap();
            total += f64::from(loss.to_scalar::<f32>().unwrap());
            adv_total += f64::from(adv.to_scalar::<f32>().unwrap());
        }
        assert_eq!(brain.metrics().clean.len(), 2);
        assert_eq!(brain.metrics().adversarial.len(), 2);
        brain
            .on_stage_end(Stage::Valid, total / 2.0, 1, Some(adv_total / 2.0), None)
            .unwrap();

        let log = std::fs::read_to_string(&log_path).unwrap();
        assert!(log.contains("epoch: 1"));
        assert!(log.contains("optimizer: AdamW"));
        assert!(log.contains("train loss"));
        assert!(log.contains("valid adv acc"));
        // Only the best-by-accuracy checkpoint survives.
        let kept = reader.list().unwrap();
        assert_eq!(kept.len(), 1);
        assert!(kept[0].meta.contains_key("acc"));

        brain.on_stage_start(Stage::Test, 1);
        let loss = brain.evaluate_batch(&batch(0.1), Stage::Test).unwrap();
        brain
            .on_stage_end(Stage::Test, f64::from(loss.to_scalar::<f32>().unwrap()), 1, None, None)
            .unwrap();
        let log = std::fs::read_to_string(&log_path).unwrap();
        assert!(log.lines().last().unwrap().starts_with("Evaluation stage: TEST - test acc"));
    }

    #[test]
    fn restored_model_is_not_checkpointed_at_construction() {
        let dir = tempfile::tempdir().unwrap();
        PretrainBrain::new(
            lobe(),
            BrainConfig {
                restored_from_checkpoint: true,
                ..Default::default()
            },
            noam(),
            Some(Box::new(SafetensorsCheckpointer::new(dir.path()).unwrap())),
            None,
        )
        .unwrap();
        let reader = SafetensorsCheckpointer::new(dir.path()).unwrap();
        assert!(reader.list().unwrap().is_empty());
    }

    #[test]
    fn pgd_stays_in_the_ball_through_a_filter() {
        init_tracing();
        let filter = AsnrWiener::new(FilterConfig {
            sample_rate: 16000,
            fft_size: 64,
            hop_size: 16,
            gaussian_sigma: 0.0,
            high_freq: true,
            lpc_order: 12,
            seed: 0,
        })
        .unwrap();
        let mut brain = brain(BrainConfig::default()).with_input_filter(Box::new(filter));
        let clean = batch(0.0);
        let adversarial = pgd(3).perturb(&mut brain, &clean).unwrap();

        assert!(adversarial.quantized_representation.is_some());
        let delta = (&adversarial.sig - &clean.sig).unwrap().abs().unwrap();
        let max: f32 = delta.max_all().unwrap().to_scalar().unwrap();
        assert!(max <= 0.05 + 1e-6, "max |δ| = {max}");
        assert!(max > 0.0);
    }

    #[test]
    fn adversarial_training_step_runs() {
        let mut brain = brain(BrainConfig::default());
        let before = param(&brain, "project_hid.weight");
        let loss = brain.fit_batch_adversarial(&batch(0.0), &mut pgd(2)).unwrap();
        assert!(loss.to_scalar::<f32>().unwrap().is_finite());
        assert_ne!(param(&brain, "project_hid.weight"), before);
    }
}
