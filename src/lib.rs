//! ring-attention: sequence-parallel attention over a ring of workers.
//!
//! This crate computes self-attention over sequences longer than any single
//! worker's memory by sharding the sequence across a ring of ranks and
//! computing attention blockwise with a running (online) softmax:
//! - Batch-sharded inputs are resharded into sequence shards (and back)
//! - Key/value shards rotate around the ring, queries stay resident
//! - No rank ever materializes the full attention score matrix
//!
//! The ring output matches ordinary full-sequence attention within
//! floating-point tolerance.
//!
//! ## Reference
//!
//! - Ring Attention with Blockwise Transformers for Near-Infinite Context
//!   <https://arxiv.org/abs/2310.01889>

pub mod config;
pub mod error;

pub mod attention;
pub mod comm;
pub mod model;
pub mod shard;

pub use attention::{full_attention, ring_flash_attention, RingFlashParams, SoftmaxState};
pub use comm::{LocalProcessGroup, LocalWorld, ProcessGroup, SingleProcess};
pub use config::{RingAttentionConfig, TransformerConfig};
pub use error::{Error, Result};
pub use model::{FeedForward, RingAttention, RingTransformer, RmsNorm};
pub use shard::{pad_length, shard_batch_to_sequence, shard_sequence_to_batch};
