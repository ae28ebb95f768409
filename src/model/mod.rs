//! Model layers.
//!
//! This module contains:
//! - The ring attention layer (projection + dispatch)
//! - RMSNorm and the feed-forward block
//! - A transformer wrapper for end-to-end sequence-sharded runs

pub mod attention;
pub mod feed_forward;
pub mod norm;
pub mod transformer;

pub use attention::RingAttention;
pub use feed_forward::FeedForward;
pub use norm::RmsNorm;
pub use transformer::RingTransformer;
