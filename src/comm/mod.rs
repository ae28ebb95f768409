//! Distributed communication boundary.
//!
//! The ring transport and the collectives this crate consumes are exposed
//! here as a single trait, [`ProcessGroup`], passed explicitly into every
//! sharding and orchestration call. There is no ambient rank or world-size
//! state: a forward pass sees exactly the group it was handed, which is what
//! makes simulated multi-rank runs in a single test process possible.

pub mod local;

pub use local::{LocalProcessGroup, LocalWorld, SingleProcess};

use candle_core::Tensor;

use crate::error::Result;

/// A fixed set of ranks arranged in a ring.
///
/// One instance per rank. `ring_exchange` and `all_gather` are collective:
/// every rank in the group must call them in the same order, and each call
/// blocks until its counterparts complete. A rank that drops out mid-step is
/// fatal to the whole operation; there is no timeout or retry at this layer.
pub trait ProcessGroup {
    /// This rank's 0-indexed identity in the ring.
    fn rank(&self) -> usize;

    /// Number of ranks in the ring.
    fn world_size(&self) -> usize;

    /// Whether more than one rank participates.
    fn is_distributed(&self) -> bool {
        self.world_size() > 1
    }

    /// One synchronous ring step: send `shard` to the successor rank and
    /// receive the predecessor's shard. With a single rank this returns the
    /// input unchanged.
    fn ring_exchange(&self, shard: &Tensor) -> Result<Tensor>;

    /// Gather every rank's tensor along `dim`, in rank order.
    ///
    /// Returns the concatenated tensor together with each rank's extent
    /// along `dim`, which the caller needs to invert the gather when ranks
    /// contributed uneven amounts.
    fn all_gather(&self, x: &Tensor, dim: usize) -> Result<(Tensor, Vec<usize>)>;
}
