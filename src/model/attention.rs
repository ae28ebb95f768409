//! Ring attention layer.
//!
//! Projects the input through a pre-norm fused QKV linear, dispatches to
//! either full in-memory attention or the ring orchestrator, and projects
//! back to the model dimension. Which path runs is decided once at
//! construction from the configuration and the world size, so the forward
//! pass carries no per-call mode branching.

use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{linear_no_bias, Linear, VarBuilder};
use tracing::debug;

use crate::attention::ring::RingFlashParams;
use crate::attention::{full_attention, ring_flash_attention};
use crate::comm::ProcessGroup;
use crate::config::RingAttentionConfig;
use crate::error::Result;
use crate::model::norm::RmsNorm;
use crate::shard::{shard_batch_to_sequence, shard_sequence_to_batch};

/// Attention path, fixed at construction.
///
/// `Full` covers both the single-rank case and "distributed with ring
/// attention disabled": the same ordinary softmax attention over whatever
/// sequence (whole or local shard) this rank holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttentionStrategy {
    /// Full in-memory attention over the locally held sequence.
    Full,
    /// Rotate key/value shards around the ring.
    Ring,
}

/// Self-attention over a (possibly sequence-sharded) input.
///
/// Mirrors the usual pre-norm attention block: RMSNorm, fused bias-free QKV
/// projection, per-head attention, bias-free output projection. With
/// `auto_shard_seq` enabled and a distributed group, the call is wrapped in
/// the batch-to-sequence conversion so callers always see whole sequences.
#[derive(Debug, Clone)]
pub struct RingAttention {
    /// Pre-norm in front of the QKV projection.
    norm: RmsNorm,
    /// Fused projection [dim] -> [3 * heads * head_dim].
    to_qkv: Linear,
    /// Output projection [heads * head_dim] -> [dim].
    to_out: Linear,
    /// Layer configuration.
    config: RingAttentionConfig,
    /// Selected attention path.
    strategy: AttentionStrategy,
    /// Score scale (`head_dim^-0.5`).
    scale: f32,
}

impl RingAttention {
    /// Creates a new RingAttention layer from a VarBuilder.
    ///
    /// Expects tensors `norm.weight` [dim], `to_qkv.weight`
    /// [3 * heads * head_dim, dim] and `to_out.weight`
    /// [dim, heads * head_dim].
    ///
    /// Fails fast on invalid configuration: shard size not divisible by the
    /// bucket sizes, or auto-sharding without ring attention.
    pub fn new(config: &RingAttentionConfig, world_size: usize, vb: VarBuilder) -> Result<Self> {
        config.validate()?;

        let dim_inner = config.dim_inner();
        let norm_weight = vb.get((config.dim,), "norm.weight")?;
        let norm = RmsNorm::new(norm_weight, 1e-6);
        let to_qkv = linear_no_bias(config.dim, dim_inner * 3, vb.pp("to_qkv"))?;
        let to_out = linear_no_bias(dim_inner, config.dim, vb.pp("to_out"))?;

        Ok(Self {
            norm,
            to_qkv,
            to_out,
            strategy: Self::select_strategy(config, world_size),
            scale: (config.head_dim as f32).powf(-0.5),
            config: config.clone(),
        })
    }

    /// Creates a new RingAttention layer with random weights for testing.
    pub fn new_random(
        config: &RingAttentionConfig,
        world_size: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;

        let dim_inner = config.dim_inner();
        let scale_init = 0.02;
        let qkv_weight = Tensor::randn(0.0f32, scale_init, (dim_inner * 3, config.dim), device)?
            .to_dtype(dtype)?;
        let out_weight = Tensor::randn(0.0f32, scale_init, (config.dim, dim_inner), device)?
            .to_dtype(dtype)?;

        Ok(Self {
            norm: RmsNorm::new_ones(config.dim, 1e-6, dtype, device)?,
            to_qkv: Linear::new(qkv_weight, None),
            to_out: Linear::new(out_weight, None),
            strategy: Self::select_strategy(config, world_size),
            scale: (config.head_dim as f32).powf(-0.5),
            config: config.clone(),
        })
    }

    /// Rebuild the same weights for a different world size, reselecting the
    /// attention path. Useful for comparing ring output against the
    /// single-rank reference on identical parameters.
    pub fn with_world_size(mut self, world_size: usize) -> Self {
        self.strategy = Self::select_strategy(&self.config, world_size);
        self
    }

    fn select_strategy(config: &RingAttentionConfig, world_size: usize) -> AttentionStrategy {
        if world_size > 1 && config.ring_attn {
            AttentionStrategy::Ring
        } else {
            AttentionStrategy::Full
        }
    }

    /// Returns the layer configuration.
    pub fn config(&self) -> &RingAttentionConfig {
        &self.config
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor [batch, seq, dim]; with auto-sharding this is
    ///   the rank's batch-sharded input, otherwise its sequence shard (or
    ///   the whole sequence on a single rank)
    /// * `mask` - Optional validity mask [batch, seq], `1` = valid
    /// * `group` - Process group for sharding and ring exchange
    ///
    /// # Returns
    ///
    /// Output tensor of the same sharded shape as `x`.
    pub fn forward(
        &self,
        x: &Tensor,
        mask: Option<&Tensor>,
        group: &dyn ProcessGroup,
    ) -> Result<Tensor> {
        let auto_shard = self.config.auto_shard_seq && group.is_distributed();
        let seq_len = x.dim(1)?;

        let (x, mask, sizes) = if auto_shard {
            let (x, mask, sizes) =
                shard_batch_to_sequence(group, x, mask, self.config.ring_seq_size)?;
            (x, mask, Some(sizes))
        } else {
            (x.clone(), mask.cloned(), None)
        };

        let (batch, seq_local, _dim) = x.dims3()?;
        debug!(
            strategy = ?self.strategy,
            batch, seq_local, auto_shard, "attention forward"
        );

        // Project and split heads: [batch, seq, dim] -> 3 x [batch, heads, seq, head_dim]
        let qkv = self.to_qkv.forward(&self.norm.forward(&x)?)?;
        let qkv = qkv.chunk(3, D::Minus1)?;
        let split = |t: &Tensor| -> candle_core::Result<Tensor> {
            t.contiguous()?
                .reshape((batch, seq_local, self.config.heads, self.config.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };
        let q = split(&qkv[0])?;
        let k = split(&qkv[1])?;
        let v = split(&qkv[2])?;

        let out = match self.strategy {
            AttentionStrategy::Full => full_attention(
                &q,
                &k,
                &v,
                mask.as_ref(),
                self.config.causal,
                self.scale,
            )?,
            AttentionStrategy::Ring => {
                let params = RingFlashParams {
                    q_bucket_size: self.config.q_bucket_size,
                    k_bucket_size: self.config.k_bucket_size,
                    causal: self.config.causal,
                    scale: self.scale,
                    eps: self.config.eps,
                };
                ring_flash_attention(group, &q, &k, &v, mask.as_ref(), &params)?
            }
        };

        // Recombine heads and project out.
        let out = out
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq_local, self.config.dim_inner()))?;
        let out = self.to_out.forward(&out)?;

        match sizes {
            Some(sizes) => {
                let out = shard_sequence_to_batch(group, &out, &sizes)?;
                Ok(out.narrow(1, 0, seq_len)?)
            }
            None => Ok(out),
        }
    }
}
