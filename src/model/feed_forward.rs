//! Feed-forward block.
//!
//! Pre-norm two-layer MLP with GELU, the mixing half of each transformer
//! block.

use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{linear_no_bias, Linear, VarBuilder};

use crate::model::norm::RmsNorm;

/// Pre-norm feed-forward: `proj_out(gelu(proj_in(norm(x))))`.
#[derive(Debug, Clone)]
pub struct FeedForward {
    norm: RmsNorm,
    proj_in: Linear,
    proj_out: Linear,
}

impl FeedForward {
    /// Creates a new FeedForward from a VarBuilder.
    ///
    /// # Arguments
    ///
    /// * `dim` - Input/output dimension
    /// * `mult` - Expansion factor for the inner dimension
    /// * `vb` - VarBuilder for loading weights
    pub fn new(dim: usize, mult: usize, vb: VarBuilder) -> Result<Self> {
        let dim_inner = dim * mult;
        let norm_weight = vb.get((dim,), "norm.weight")?;
        Ok(Self {
            norm: RmsNorm::new(norm_weight, 1e-6),
            proj_in: linear_no_bias(dim, dim_inner, vb.pp("proj_in"))?,
            proj_out: linear_no_bias(dim_inner, dim, vb.pp("proj_out"))?,
        })
    }

    /// Creates a new FeedForward with random weights for testing.
    pub fn new_random(dim: usize, mult: usize, dtype: DType, device: &Device) -> Result<Self> {
        let dim_inner = dim * mult;
        let scale_init = 0.02;
        let in_weight =
            Tensor::randn(0.0f32, scale_init, (dim_inner, dim), device)?.to_dtype(dtype)?;
        let out_weight =
            Tensor::randn(0.0f32, scale_init, (dim, dim_inner), device)?.to_dtype(dtype)?;
        Ok(Self {
            norm: RmsNorm::new_ones(dim, 1e-6, dtype, device)?,
            proj_in: Linear::new(in_weight, None),
            proj_out: Linear::new(out_weight, None),
        })
    }

    /// Forward pass over [.., dim].
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.proj_in.forward(&self.norm.forward(x)?)?;
        self.proj_out.forward(&h.gelu()?)
    }
}
