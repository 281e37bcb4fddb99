//! Normalization layers composed from elementary tensor ops.
//!
//! The fused candle kernels have no backward pass, and attacks need gradients
//! through every layer down to the waveform, so both norms here are written
//! with mean/sub/div only.

use candle_core::{D, DType, Tensor};
use candle_nn::VarBuilder;

use crate::Result;

/// LayerNorm over the last dimension with elementwise affine.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    pub fn load(vb: VarBuilder, dim: usize, eps: f64) -> Result<Self> {
        let weight = vb.get_with_hints(dim, "weight", candle_nn::Init::Const(1.0))?;
        let bias = vb.get_with_hints(dim, "bias", candle_nn::Init::Const(0.0))?;
        Ok(Self { weight, bias, eps })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let variance = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = centered.broadcast_div(&(variance + self.eps)?.sqrt()?)?;
        let out = normed
            .to_dtype(dtype)?
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)?;
        Ok(out)
    }

    /// Apply to a `[B, C, T]` tensor, normalizing over channels.
    pub fn forward_channels_first(&self, x: &Tensor) -> Result<Tensor> {
        let x = x.transpose(1, 2)?;
        let x = self.forward(&x)?;
        Ok(x.transpose(1, 2)?)
    }
}

/// GroupNorm with one group per channel over a `[B, C, T]` tensor.
///
/// This is the only grouping used by the Wav2Vec2 feature encoder: each
/// channel is normalized independently across time.
#[derive(Debug, Clone)]
pub struct ChannelGroupNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl ChannelGroupNorm {
    pub fn load(vb: VarBuilder, channels: usize, eps: f64) -> Result<Self> {
        let weight = vb.get_with_hints(channels, "weight", candle_nn::Init::Const(1.0))?;
        let bias = vb.get_with_hints(channels, "bias", candle_nn::Init::Const(0.0))?;
        Ok(Self { weight, bias, eps })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let channels = x.dim(1)?;
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let variance = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = centered.broadcast_div(&(variance + self.eps)?.sqrt()?)?;
        let weight = self.weight.reshape((1, channels, 1))?;
        let bias = self.bias.reshape((1, channels, 1))?;
        Ok(normed.broadcast_mul(&weight)?.broadcast_add(&bias)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};
    use candle_nn::VarMap;

    #[test]
    fn layer_norm_zero_mean_unit_variance() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let norm = LayerNorm::load(vb, 8, 1e-5).unwrap();

        let x = Tensor::randn(3.0_f32, 2.0, (2, 5, 8), &device).unwrap();
        let y = norm.forward(&x).unwrap();
        let mean: f32 = y.mean_all().unwrap().to_scalar().unwrap();
        let var: f32 = y.sqr().unwrap().mean_all().unwrap().to_scalar().unwrap();
        assert!(mean.abs() < 1e-4, "mean = {mean}");
        assert!((var - 1.0).abs() < 1e-2, "var = {var}");
    }

    #[test]
    fn group_norm_normalizes_each_channel_over_time() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let norm = ChannelGroupNorm::load(vb, 4, 1e-5).unwrap();

        let x = Tensor::randn(1.0_f32, 3.0, (2, 4, 32), &device).unwrap();
        let y = norm.forward(&x).unwrap();
        assert_eq!(y.dims(), &[2, 4, 32]);
        let per_channel_mean: Vec<f32> = y
            .mean(D::Minus1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        for m in per_channel_mean {
            assert!(m.abs() < 1e-4, "channel mean = {m}");
        }
    }

    #[test]
    fn layer_norm_is_differentiable() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let norm = LayerNorm::load(vb, 6, 1e-5).unwrap();

        let x = Var::from_tensor(&Tensor::randn(0.0_f32, 1.0, (3, 6), &device).unwrap()).unwrap();
        let loss = norm
            .forward(x.as_tensor())
            .unwrap()
            .sqr()
            .unwrap()
            .sum_all()
            .unwrap();
        let grads = loss.backward().unwrap();
        assert!(grads.get(x.as_tensor()).is_some());
    }
}
