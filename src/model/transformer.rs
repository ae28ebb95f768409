//! End-to-end transformer over sequence shards.
//!
//! Token embedding, `depth` residual (attention, feed-forward) blocks, and
//! a final norm + logits projection. Sharding happens once here, on the
//! token ids, rather than inside every attention layer: the inner layers
//! are built with auto-sharding off and simply see sequence shards.

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{embedding, linear_no_bias, Embedding, Linear, VarBuilder};

use crate::comm::ProcessGroup;
use crate::config::TransformerConfig;
use crate::error::Result;
use crate::model::attention::RingAttention;
use crate::model::feed_forward::FeedForward;
use crate::model::norm::RmsNorm;
use crate::shard::{shard_batch_to_sequence, shard_sequence_to_batch};

/// Transformer language model with ring attention layers.
#[derive(Debug, Clone)]
pub struct RingTransformer {
    /// Token embedding [num_tokens, dim].
    token_emb: Embedding,
    /// Residual (attention, feed-forward) blocks.
    layers: Vec<(RingAttention, FeedForward)>,
    /// Final normalization before the logits projection.
    final_norm: RmsNorm,
    /// Logits projection [dim] -> [num_tokens].
    to_logits: Linear,
    /// Model configuration.
    config: TransformerConfig,
}

impl RingTransformer {
    /// Creates a new RingTransformer from a VarBuilder.
    ///
    /// Expects tensors under `token_emb`, `layers.{i}.attention`,
    /// `layers.{i}.feed_forward`, `final_norm` and `to_logits`.
    pub fn new(config: &TransformerConfig, world_size: usize, vb: VarBuilder) -> Result<Self> {
        config.validate()?;

        // Sharding is owned by the transformer; layers see shards only.
        let layer_attention = config.attention.clone().with_auto_shard(false);

        let token_emb = embedding(config.num_tokens, config.dim, vb.pp("token_emb"))?;

        let mut layers = Vec::with_capacity(config.depth);
        for i in 0..config.depth {
            let attn = RingAttention::new(
                &layer_attention,
                world_size,
                vb.pp(format!("layers.{i}.attention")),
            )?;
            let ff = FeedForward::new(
                config.dim,
                config.ff_mult,
                vb.pp(format!("layers.{i}.feed_forward")),
            )?;
            layers.push((attn, ff));
        }

        let final_norm = RmsNorm::new(vb.get((config.dim,), "final_norm.weight")?, 1e-6);
        let to_logits = linear_no_bias(config.dim, config.num_tokens, vb.pp("to_logits"))?;

        Ok(Self {
            token_emb,
            layers,
            final_norm,
            to_logits,
            config: config.clone(),
        })
    }

    /// Creates a new RingTransformer with random weights for testing.
    pub fn new_random(
        config: &TransformerConfig,
        world_size: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;

        let layer_attention = config.attention.clone().with_auto_shard(false);
        let scale_init = 0.02;

        let emb_weight =
            Tensor::randn(0.0f32, scale_init, (config.num_tokens, config.dim), device)?
                .to_dtype(dtype)?;
        let logits_weight =
            Tensor::randn(0.0f32, scale_init, (config.num_tokens, config.dim), device)?
                .to_dtype(dtype)?;

        let mut layers = Vec::with_capacity(config.depth);
        for _ in 0..config.depth {
            layers.push((
                RingAttention::new_random(&layer_attention, world_size, dtype, device)?,
                FeedForward::new_random(config.dim, config.ff_mult, dtype, device)?,
            ));
        }

        Ok(Self {
            token_emb: Embedding::new(emb_weight, config.dim),
            layers,
            final_norm: RmsNorm::new_ones(config.dim, 1e-6, dtype, device)?,
            to_logits: Linear::new(logits_weight, None),
            config: config.clone(),
        })
    }

    /// Rebuild the same weights for a different world size.
    pub fn with_world_size(mut self, world_size: usize) -> Self {
        self.layers = self
            .layers
            .into_iter()
            .map(|(attn, ff)| (attn.with_world_size(world_size), ff))
            .collect();
        self
    }

    /// Returns the model configuration.
    pub fn config(&self) -> &TransformerConfig {
        &self.config
    }

    /// Forward pass from token ids to logits.
    ///
    /// # Arguments
    ///
    /// * `tokens` - Token ids [batch, seq], dtype U32
    /// * `mask` - Optional validity mask [batch, seq], `1` = valid
    /// * `group` - Process group for sharding and ring exchange
    ///
    /// # Returns
    ///
    /// Logits [batch, seq, num_tokens], same sharding as the input.
    pub fn forward(
        &self,
        tokens: &Tensor,
        mask: Option<&Tensor>,
        group: &dyn ProcessGroup,
    ) -> Result<Tensor> {
        let auto_shard = self.config.attention.auto_shard_seq && group.is_distributed();
        let seq_len = tokens.dim(1)?;

        let (tokens, mask, sizes) = if auto_shard {
            let (tokens, mask, sizes) = shard_batch_to_sequence(
                group,
                tokens,
                mask,
                self.config.attention.ring_seq_size,
            )?;
            (tokens, mask, Some(sizes))
        } else {
            (tokens.clone(), mask.cloned(), None)
        };

        let mut x = self.token_emb.forward(&tokens)?;
        for (attn, ff) in &self.layers {
            x = (attn.forward(&x, mask.as_ref(), group)? + &x)?;
            x = (ff.forward(&x)? + &x)?;
        }

        let logits = self.to_logits.forward(&self.final_norm.forward(&x)?)?;

        match sizes {
            Some(sizes) => {
                let logits = shard_sequence_to_batch(group, &logits, &sizes)?;
                Ok(logits.narrow(1, 0, seq_len)?)
            }
            None => Ok(logits),
        }
    }
}
