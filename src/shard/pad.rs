//! Padding arithmetic for sequence sharding.

use candle_core::Tensor;

use crate::error::Result;

/// Number of positions to append so `len` becomes a multiple of `multiple`.
pub fn pad_length(len: usize, multiple: usize) -> usize {
    let remainder = len % multiple;
    if remainder == 0 {
        0
    } else {
        multiple - remainder
    }
}

/// Pad `x` along `dim` with zeros of its own dtype up to the next multiple
/// of `multiple`. Returns the padded tensor and the pad length.
///
/// Zero is the neutral value for every padded axis in this crate: feature
/// tensors contribute nothing once their mask marks the positions invalid,
/// token ids pad with token 0, and masks pad with `false`.
pub fn pad_to_multiple(x: &Tensor, dim: usize, multiple: usize) -> Result<(Tensor, usize)> {
    let len = x.dim(dim)?;
    let pad = pad_length(len, multiple);
    if pad == 0 {
        return Ok((x.clone(), 0));
    }

    let mut pad_dims = x.dims().to_vec();
    pad_dims[dim] = pad;
    let padding = Tensor::zeros(pad_dims, x.dtype(), x.device())?;
    let padded = Tensor::cat(&[x, &padding], dim)?;
    Ok((padded, pad))
}
