//! RMS Normalization.
//!
//! Root Mean Square Layer Normalization rescales inputs by their RMS value
//! without centering. Used as the pre-norm in front of the QKV and
//! feed-forward projections.
//!
//! Reference: <https://arxiv.org/abs/1910.07467>

use candle_core::{DType, Result, Tensor};

/// RMS Normalization layer.
///
/// Formula: `output = (x / rms(x)) * weight`
/// where `rms(x) = sqrt(mean(x^2) + eps)`
#[derive(Debug, Clone)]
pub struct RmsNorm {
    /// Learnable scale parameter [dim].
    weight: Tensor,
    /// Small constant for numerical stability.
    eps: f64,
}

impl RmsNorm {
    /// Creates a new RmsNorm layer from a weight tensor of shape [dim].
    pub fn new(weight: Tensor, eps: f64) -> Self {
        Self { weight, eps }
    }

    /// Creates a new RmsNorm layer with ones as weights.
    pub fn new_ones(
        dim: usize,
        eps: f64,
        dtype: DType,
        device: &candle_core::Device,
    ) -> Result<Self> {
        let weight = Tensor::ones(dim, dtype, device)?;
        Ok(Self { weight, eps })
    }

    /// Applies RMS normalization over the last dimension of `x`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let variance = x.sqr()?.mean_keepdim(candle_core::D::Minus1)?;
        let rms = (variance + self.eps)?.sqrt()?;
        x.broadcast_div(&rms)?.broadcast_mul(&self.weight)
    }
}
