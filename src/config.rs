//! Configuration types for ring-attention.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration for a [`RingAttention`](crate::model::RingAttention) layer.
///
/// The ring shard size must be divisible by both bucket sizes so that every
/// ring step tiles the held key/value shard into whole blocks, and
/// auto-sharding only makes sense when the ring path is enabled. Both are
/// checked by [`validate`](Self::validate) and enforced at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingAttentionConfig {
    /// Model dimension (input/output feature size).
    pub dim: usize,
    /// Number of attention heads.
    pub heads: usize,
    /// Dimension per head.
    pub head_dim: usize,
    /// Whether to apply causal masking.
    pub causal: bool,
    /// Query block size for the blockwise attention fold.
    pub q_bucket_size: usize,
    /// Key block size for the blockwise attention fold.
    pub k_bucket_size: usize,
    /// Enable the ring attention path when distributed.
    pub ring_attn: bool,
    /// Sequence shard size per rank for the ring path.
    pub ring_seq_size: usize,
    /// Convert batch-sharded inputs to sequence shards inside `forward`.
    pub auto_shard_seq: bool,
    /// Lower clamp on the softmax denominator.
    pub eps: f32,
}

impl Default for RingAttentionConfig {
    fn default() -> Self {
        Self {
            dim: 512,
            heads: 8,
            head_dim: 64,
            causal: false,
            q_bucket_size: 512,
            k_bucket_size: 512,
            ring_attn: false,
            ring_seq_size: 512,
            auto_shard_seq: false,
            eps: 1e-10,
        }
    }
}

impl RingAttentionConfig {
    /// Create a config for the given model dimension.
    pub fn new(dim: usize, heads: usize, head_dim: usize) -> Self {
        Self {
            dim,
            heads,
            head_dim,
            ..Self::default()
        }
    }

    /// Enable causal masking.
    pub fn with_causal(mut self, causal: bool) -> Self {
        self.causal = causal;
        self
    }

    /// Set the query/key bucket sizes used by the blockwise fold.
    pub fn with_bucket_sizes(mut self, q_bucket_size: usize, k_bucket_size: usize) -> Self {
        self.q_bucket_size = q_bucket_size;
        self.k_bucket_size = k_bucket_size;
        self
    }

    /// Enable the ring path with the given per-rank shard size.
    ///
    /// Auto-sharding is turned on as well; call
    /// [`with_auto_shard`](Self::with_auto_shard) afterwards to shard
    /// elsewhere (e.g. at the transformer level).
    pub fn with_ring(mut self, ring_seq_size: usize) -> Self {
        self.ring_attn = true;
        self.ring_seq_size = ring_seq_size;
        self.auto_shard_seq = true;
        self
    }

    /// Control whether `forward` shards its own input.
    pub fn with_auto_shard(mut self, auto_shard_seq: bool) -> Self {
        self.auto_shard_seq = auto_shard_seq;
        self
    }

    /// Inner projection width (`heads * head_dim`).
    pub fn dim_inner(&self) -> usize {
        self.heads * self.head_dim
    }

    /// Check the construction-time preconditions.
    pub fn validate(&self) -> Result<()> {
        if self.ring_seq_size % self.q_bucket_size != 0 {
            return Err(Error::Config(format!(
                "ring_seq_size {} not divisible by q_bucket_size {}",
                self.ring_seq_size, self.q_bucket_size
            )));
        }
        if self.ring_seq_size % self.k_bucket_size != 0 {
            return Err(Error::Config(format!(
                "ring_seq_size {} not divisible by k_bucket_size {}",
                self.ring_seq_size, self.k_bucket_size
            )));
        }
        if self.auto_shard_seq && !self.ring_attn {
            return Err(Error::Config(
                "auto_shard_seq requires ring_attn".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration for a [`RingTransformer`](crate::model::RingTransformer).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformerConfig {
    /// Vocabulary size.
    pub num_tokens: usize,
    /// Model dimension.
    pub dim: usize,
    /// Number of (attention, feed-forward) blocks.
    pub depth: usize,
    /// Feed-forward expansion factor.
    pub ff_mult: usize,
    /// Attention settings shared by every layer.
    pub attention: RingAttentionConfig,
}

impl Default for TransformerConfig {
    fn default() -> Self {
        Self {
            num_tokens: 256,
            dim: 512,
            depth: 6,
            ff_mult: 4,
            attention: RingAttentionConfig::default(),
        }
    }
}

impl TransformerConfig {
    /// Check the construction-time preconditions.
    pub fn validate(&self) -> Result<()> {
        self.attention.validate()
    }
}
