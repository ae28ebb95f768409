//! Ring attention orchestration.
//!
//! Each rank keeps its query shard resident and folds blockwise attention
//! against whichever key/value shard it currently holds, then passes that
//! shard to its ring successor and receives its predecessor's. After
//! `world_size` steps every shard has visited every rank exactly once and
//! each per-query-block accumulator holds the statistics of the entire
//! sequence; dividing by the running sum yields the local output shard.
//!
//! Because the fold is order-independent in contribution, the rotation
//! offset a shard started at does not affect the result; only the complete
//! set of visits matters.

use candle_core::Tensor;
use tracing::debug;

use crate::attention::flash::SoftmaxState;
use crate::comm::ProcessGroup;
use crate::error::Result;

/// Tiling and masking parameters for the ring fold.
#[derive(Debug, Clone, Copy)]
pub struct RingFlashParams {
    /// Query tile size within the resident shard.
    pub q_bucket_size: usize,
    /// Key tile size within the held shard.
    pub k_bucket_size: usize,
    /// Causal masking over global positions.
    pub causal: bool,
    /// Score scale, typically `head_dim^-0.5`.
    pub scale: f32,
    /// Lower clamp on the softmax denominator.
    pub eps: f32,
}

/// Compute this rank's attention output shard by rotating key/value shards
/// around the ring.
///
/// # Arguments
///
/// * `group` - Process group; every rank must call this collectively
/// * `q` - Resident query shard `[batch, heads, seq_local, head_dim]`
/// * `k`, `v` - This rank's own key/value shard, same shape as `q`
/// * `key_mask` - Optional validity of the local keys `[batch, seq_local]`;
///   rotates around the ring together with `k` and `v`
/// * `params` - Tiling and masking parameters
///
/// # Returns
///
/// Output shard `[batch, heads, seq_local, head_dim]`.
pub fn ring_flash_attention(
    group: &dyn ProcessGroup,
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    key_mask: Option<&Tensor>,
    params: &RingFlashParams,
) -> Result<Tensor> {
    let (_batch, _heads, seq_local, _head_dim) = q.dims4()?;
    let world_size = group.world_size();
    let rank = group.rank();

    let q_bucket = params.q_bucket_size.min(seq_local);
    let k_bucket = params.k_bucket_size.min(seq_local);
    let num_q_blocks = seq_local.div_ceil(q_bucket);
    let num_k_blocks = seq_local.div_ceil(k_bucket);

    // Global position of the resident queries; keys move, queries do not.
    let q_offset = rank * seq_local;

    let mut states = Vec::with_capacity(num_q_blocks);
    let mut q_blocks = Vec::with_capacity(num_q_blocks);
    for qi in 0..num_q_blocks {
        let q_start = qi * q_bucket;
        let q_len = q_bucket.min(seq_local - q_start);
        let q_blk = q.narrow(2, q_start, q_len)?;
        states.push(SoftmaxState::identity(&q_blk)?);
        q_blocks.push((q_start, q_blk));
    }

    let mut k_held = k.clone();
    let mut v_held = v.clone();
    let mut mask_held = key_mask.cloned();

    for step in 0..world_size {
        // The shard currently held originated at this rank.
        let src_rank = (rank + world_size - step) % world_size;
        let k_offset = src_rank * seq_local;
        debug!(rank, step, src_rank, "ring attention step");

        for (state, (q_start, q_blk)) in states.iter_mut().zip(&q_blocks) {
            let q_end_global = q_offset + q_start + q_blk.dim(2)? - 1;

            for ki in 0..num_k_blocks {
                let k_start = ki * k_bucket;
                let k_len = k_bucket.min(seq_local - k_start);

                // Entirely ahead of the query block: contributes nothing.
                // Pruning is local; ring participation is unaffected.
                if params.causal && k_offset + k_start > q_end_global {
                    continue;
                }

                let k_blk = k_held.narrow(2, k_start, k_len)?;
                let v_blk = v_held.narrow(2, k_start, k_len)?;
                let mask_blk = match &mask_held {
                    Some(mask) => Some(mask.narrow(1, k_start, k_len)?.contiguous()?),
                    None => None,
                };

                state.update(
                    q_blk,
                    &k_blk,
                    &v_blk,
                    mask_blk.as_ref(),
                    params.causal,
                    q_offset + q_start,
                    k_offset + k_start,
                    params.scale,
                )?;
            }
        }

        // Rotate the held shard; the final rotation would only return each
        // shard to its owner, so all ranks elide it uniformly.
        if step + 1 < world_size {
            k_held = group.ring_exchange(&k_held)?;
            v_held = group.ring_exchange(&v_held)?;
            mask_held = match mask_held {
                Some(mask) => Some(group.ring_exchange(&mask)?),
                None => None,
            };
        }
    }

    let outputs = states
        .into_iter()
        .map(|state| state.finalize(params.eps))
        .collect::<candle_core::Result<Vec<_>>>()?;
    Ok(Tensor::cat(&outputs.iter().collect::<Vec<_>>(), 2)?)
}
