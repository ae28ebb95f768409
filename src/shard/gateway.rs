//! Batch-sharded to sequence-sharded conversion and back.
//!
//! Forward direction: every rank starts with full-length sequences for its
//! own batch items. The sequences are padded to a multiple of the shard
//! size, the batch is gathered across ranks (recording each rank's batch
//! extent), and the gathered sequence axis is split into one chunk per rank.
//! The recorded extents are what make the reverse split unambiguous when
//! ranks contributed uneven batch sizes.
//!
//! The sequence axis is dim 1 throughout: `[batch, seq, feature]` for
//! feature tensors and `[batch, seq]` for token ids and masks.

use candle_core::{DType, Tensor};
use tracing::debug;

use crate::comm::ProcessGroup;
use crate::error::{Error, Result};
use crate::shard::pad::pad_to_multiple;

const SEQ_DIM: usize = 1;

/// Convert this rank's batch-sharded input into its sequence shard.
///
/// Pads the sequence axis to a multiple of `shard_size` (synthesizing an
/// all-valid mask first whenever padding is added, so padded positions are
/// never silently valid), gathers the batch across ranks, and keeps the
/// sequence chunk belonging to this rank.
///
/// # Arguments
///
/// * `group` - Process group to gather across
/// * `x` - Input `[batch, seq, ..]`, full sequences for this rank's batch
/// * `mask` - Optional validity mask `[batch, seq]`, `1` = valid
/// * `shard_size` - Target per-rank sequence extent
///
/// # Returns
///
/// `(sequence_shard, mask_shard, sizes)` where `sizes` records each rank's
/// contributed batch extent for [`shard_sequence_to_batch`].
pub fn shard_batch_to_sequence(
    group: &dyn ProcessGroup,
    x: &Tensor,
    mask: Option<&Tensor>,
    shard_size: usize,
) -> Result<(Tensor, Option<Tensor>, Vec<usize>)> {
    let (batch, seq_len) = (x.dim(0)?, x.dim(SEQ_DIM)?);
    if let Some(mask) = mask {
        if mask.dim(0)? != batch || mask.dim(1)? != seq_len {
            return Err(Error::Shape(format!(
                "mask shape {:?} does not match sequence shape {:?}",
                mask.dims(),
                x.dims()
            )));
        }
    }

    // Ring passing assumes every shard has the same shape, so pad up front.
    let (x, pad) = pad_to_multiple(x, SEQ_DIM, shard_size)?;
    let mask = match (mask, pad) {
        (None, 0) => None,
        (Some(mask), _) => Some(pad_to_multiple(mask, SEQ_DIM, shard_size)?.0),
        (None, _) => {
            // Padding must never mark new positions valid.
            let valid = Tensor::ones((batch, seq_len), DType::U8, x.device())?;
            Some(pad_to_multiple(&valid, SEQ_DIM, shard_size)?.0)
        }
    };
    debug!(seq_len, pad, shard_size, "padded sequence for sharding");

    let (x, sizes) = group.all_gather(&x, 0)?;
    let mask = match mask {
        Some(mask) => Some(group.all_gather(&mask, 0)?.0),
        None => None,
    };

    let chunks = x.dim(SEQ_DIM)? / shard_size;
    if chunks != group.world_size() {
        return Err(Error::Shape(format!(
            "sequence splits into {} chunks of {}, expected one per rank ({})",
            chunks,
            shard_size,
            group.world_size()
        )));
    }

    let start = group.rank() * shard_size;
    let x_shard = x.narrow(SEQ_DIM, start, shard_size)?;
    let mask_shard = match mask {
        Some(mask) => Some(mask.narrow(SEQ_DIM, start, shard_size)?),
        None => None,
    };

    Ok((x_shard, mask_shard, sizes))
}

/// Inverse of [`shard_batch_to_sequence`].
///
/// Gathers the per-rank sequence shards back into full sequences, then
/// splits the batch axis by the recorded `sizes` and keeps this rank's
/// extent. The caller still truncates the sequence axis to the original
/// (pre-padding) length.
pub fn shard_sequence_to_batch(
    group: &dyn ProcessGroup,
    output_shard: &Tensor,
    sizes: &[usize],
) -> Result<Tensor> {
    let (gathered, _) = group.all_gather(output_shard, SEQ_DIM)?;

    let total: usize = sizes.iter().sum();
    if total != gathered.dim(0)? {
        return Err(Error::Shape(format!(
            "recorded batch sizes sum to {}, gathered batch is {}",
            total,
            gathered.dim(0)?
        )));
    }

    let offset: usize = sizes[..group.rank()].iter().sum();
    Ok(gathered.narrow(0, offset, sizes[group.rank()])?)
}
