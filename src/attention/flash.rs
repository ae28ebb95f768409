//! Blockwise attention with online softmax.
//!
//! Instead of materializing the full attention matrix, attention is folded
//! one (query block, key block) pair at a time while three running
//! statistics are maintained per query row: the row maximum, the row sum of
//! shifted exponentials, and the weighted value accumulator. Folding over
//! every key block of a sequence, in any order, and dividing the
//! accumulator by the sum at the end reproduces exact softmax attention;
//! block order affects only floating-point rounding. That order-independence
//! is what lets the ring rotate key/value shards across ranks without
//! changing the result.
//!
//! ## References
//!
//! - FlashAttention: Fast and Memory-Efficient Exact Attention with IO-Awareness
//!   <https://arxiv.org/abs/2205.14135>
//! - Ring Attention with Blockwise Transformers
//!   <https://arxiv.org/abs/2310.01889>

use candle_core::{Result, Tensor, D};

/// Replacement for masked scores.
///
/// The most negative finite f32 rather than `-inf`: when an entire block is
/// masked the running max stays finite, so the rescale factor
/// `exp(m_prev - m_new)` never evaluates `-inf - -inf`. Masked weights are
/// zeroed explicitly after the exp instead (see [`SoftmaxState::update`]).
pub const MASK_VALUE: f32 = f32::MIN;

/// Running accumulator for one query block.
///
/// Holds the online-softmax triple over all key blocks folded so far:
/// `row_max` and `row_sum` are `[batch, heads, q_len, 1]`, `acc` is
/// `[batch, heads, q_len, head_dim]`. After the last fold,
/// `acc / row_sum` is the softmax-weighted value sum for the block.
#[derive(Debug, Clone)]
pub struct SoftmaxState {
    row_max: Tensor,
    row_sum: Tensor,
    acc: Tensor,
}

impl SoftmaxState {
    /// The identity accumulator for a query block, no key block folded yet.
    pub fn identity(q_blk: &Tensor) -> Result<Self> {
        let (batch, heads, q_len, head_dim) = q_blk.dims4()?;
        let row_max = Tensor::full(MASK_VALUE, (batch, heads, q_len, 1), q_blk.device())?
            .to_dtype(q_blk.dtype())?;
        let row_sum = Tensor::zeros((batch, heads, q_len, 1), q_blk.dtype(), q_blk.device())?;
        let acc = Tensor::zeros((batch, heads, q_len, head_dim), q_blk.dtype(), q_blk.device())?;
        Ok(Self {
            row_max,
            row_sum,
            acc,
        })
    }

    /// Fold one key/value block into the accumulator.
    ///
    /// # Arguments
    ///
    /// * `q_blk` - Query block `[batch, heads, q_len, head_dim]`
    /// * `k_blk` / `v_blk` - Key/value block `[batch, heads, k_len, head_dim]`
    /// * `key_mask` - Optional key validity `[batch, k_len]`, `1` = valid
    /// * `causal` - Mask keys whose global position exceeds the query's
    /// * `q_start` / `k_start` - Global offsets of the blocks, for causal
    ///   masking across shard boundaries
    /// * `scale` - Score scale, typically `head_dim^-0.5`
    ///
    /// # Algorithm
    ///
    /// 1. `S = Q @ K^T * scale`, masked entries pinned to [`MASK_VALUE`]
    /// 2. `m_new = max(m_prev, rowmax(S))`
    /// 3. `P = exp(S - m_new)`, masked entries zeroed
    /// 4. `l_new = l_prev * exp(m_prev - m_new) + rowsum(P)`
    /// 5. `acc_new = acc_prev * exp(m_prev - m_new) + P @ V`
    ///
    /// A fully masked block leaves the state unchanged up to the (no-op)
    /// rescale: `rowsum(P) = 0` and `P @ V = 0`.
    #[allow(clippy::too_many_arguments)]
    pub fn update(
        &mut self,
        q_blk: &Tensor,
        k_blk: &Tensor,
        v_blk: &Tensor,
        key_mask: Option<&Tensor>,
        causal: bool,
        q_start: usize,
        k_start: usize,
        scale: f32,
    ) -> Result<()> {
        let (_batch, _heads, q_len, _head_dim) = q_blk.dims4()?;
        let k_len = k_blk.dim(2)?;

        let scores = q_blk.matmul(&k_blk.transpose(D::Minus2, D::Minus1)?)?;
        let scores = (scores * scale as f64)?;

        let validity = block_validity(key_mask, causal, q_start, k_start, q_len, k_len, q_blk)?;
        let scores = match &validity {
            Some(valid) => {
                let masked = Tensor::full(MASK_VALUE, scores.dims(), scores.device())?
                    .to_dtype(scores.dtype())?;
                valid
                    .broadcast_as(scores.dims())?
                    .where_cond(&scores, &masked)?
            }
            None => scores,
        };

        let block_max = scores.max_keepdim(D::Minus1)?;
        let new_max = self.row_max.maximum(&block_max)?;

        let exp_scores = scores.broadcast_sub(&new_max)?.exp()?;
        // The finite mask sentinel yields exp(0) = 1 on fully masked rows;
        // zero those weights so the block contributes nothing.
        let exp_scores = match &validity {
            Some(valid) => exp_scores.broadcast_mul(&valid.to_dtype(exp_scores.dtype())?)?,
            None => exp_scores,
        };
        let block_sum = exp_scores.sum_keepdim(D::Minus1)?;

        let rescale = (&self.row_max - &new_max)?.exp()?;
        self.acc = (self.acc.broadcast_mul(&rescale)? + exp_scores.matmul(v_blk)?)?;
        self.row_sum = ((&self.row_sum * &rescale)? + block_sum)?;
        self.row_max = new_max;

        Ok(())
    }

    /// Divide the accumulator by the running sum to produce the attention
    /// output for this query block, `[batch, heads, q_len, head_dim]`.
    ///
    /// The sum is clamped below by `eps`, so query rows whose every key was
    /// masked come out as zeros instead of NaN.
    pub fn finalize(self, eps: f32) -> Result<Tensor> {
        self.acc.broadcast_div(&self.row_sum.maximum(eps)?)
    }
}

/// Combined key-validity for one score block: key mask AND causal, as a U8
/// tensor broadcastable over `[batch, heads, q_len, k_len]`. `None` when
/// nothing is masked.
fn block_validity(
    key_mask: Option<&Tensor>,
    causal: bool,
    q_start: usize,
    k_start: usize,
    q_len: usize,
    k_len: usize,
    q_blk: &Tensor,
) -> Result<Option<Tensor>> {
    let device = q_blk.device();

    let causal_mask = if causal {
        // Key at global j is visible to query at global i when j <= i.
        let data: Vec<u8> = (0..q_len)
            .flat_map(|i| {
                (0..k_len).map(move |j| u8::from(k_start + j <= q_start + i))
            })
            .collect();
        Some(Tensor::from_vec(data, (1, 1, q_len, k_len), device)?)
    } else {
        None
    };

    let key_mask = match key_mask {
        Some(mask) => {
            let batch = mask.dim(0)?;
            Some(mask.contiguous()?.reshape((batch, 1, 1, k_len))?)
        }
        None => None,
    };

    match (causal_mask, key_mask) {
        (Some(c), Some(k)) => Ok(Some(c.broadcast_mul(&k)?)),
        (Some(c), None) => Ok(Some(c)),
        (None, Some(k)) => Ok(Some(k)),
        (None, None) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn fold_all(
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        scale: f32,
        order: &[(usize, usize)], // (k_start, k_len) pairs
    ) -> Tensor {
        let mut state = SoftmaxState::identity(q).unwrap();
        for &(k_start, k_len) in order {
            let k_blk = k.narrow(2, k_start, k_len).unwrap();
            let v_blk = v.narrow(2, k_start, k_len).unwrap();
            state
                .update(q, &k_blk, &v_blk, None, false, 0, k_start, scale)
                .unwrap();
        }
        state.finalize(1e-10).unwrap()
    }

    fn reference_softmax_attention(q: &Tensor, k: &Tensor, v: &Tensor, scale: f32) -> Tensor {
        let scores = q
            .matmul(&k.transpose(D::Minus2, D::Minus1).unwrap())
            .unwrap();
        let scores = (scores * scale as f64).unwrap();
        let attn = candle_nn::ops::softmax_last_dim(&scores).unwrap();
        attn.matmul(v).unwrap()
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        let diff = (a - b).unwrap().abs().unwrap();
        diff.flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()
            .into_iter()
            .fold(0.0, f32::max)
    }

    #[test]
    fn test_fold_matches_reference_softmax() {
        let device = Device::Cpu;
        let (b, h, n, d) = (2, 2, 16, 8);
        let q = Tensor::randn(0.0f32, 1.0, (b, h, n, d), &device).unwrap();
        let k = Tensor::randn(0.0f32, 1.0, (b, h, n, d), &device).unwrap();
        let v = Tensor::randn(0.0f32, 1.0, (b, h, n, d), &device).unwrap();
        let scale = 1.0 / (d as f32).sqrt();

        let folded = fold_all(&q, &k, &v, scale, &[(0, 4), (4, 4), (8, 4), (12, 4)]);
        let reference = reference_softmax_attention(&q, &k, &v, scale);

        assert!(max_abs_diff(&folded, &reference) < 1e-5);
    }

    #[test]
    fn test_fold_order_invariant() {
        let device = Device::Cpu;
        let (b, h, n, d) = (1, 2, 12, 8);
        let q = Tensor::randn(0.0f32, 1.0, (b, h, n, d), &device).unwrap();
        let k = Tensor::randn(0.0f32, 1.0, (b, h, n, d), &device).unwrap();
        let v = Tensor::randn(0.0f32, 1.0, (b, h, n, d), &device).unwrap();
        let scale = 1.0 / (d as f32).sqrt();

        let forward = fold_all(&q, &k, &v, scale, &[(0, 4), (4, 4), (8, 4)]);
        let shuffled = fold_all(&q, &k, &v, scale, &[(8, 4), (0, 4), (4, 4)]);

        assert!(max_abs_diff(&forward, &shuffled) < 1e-5);
    }

    #[test]
    fn test_fully_masked_first_block_no_nan() {
        let device = Device::Cpu;
        let (b, h, n, d) = (1, 1, 4, 8);
        let q = Tensor::randn(0.0f32, 1.0, (b, h, n, d), &device).unwrap();
        let k = Tensor::randn(0.0f32, 1.0, (b, h, n, d), &device).unwrap();
        let v = Tensor::randn(0.0f32, 1.0, (b, h, n, d), &device).unwrap();
        let scale = 1.0 / (d as f32).sqrt();

        let all_invalid = Tensor::zeros((b, n), candle_core::DType::U8, &device).unwrap();
        let all_valid = Tensor::ones((b, n), candle_core::DType::U8, &device).unwrap();

        let mut state = SoftmaxState::identity(&q).unwrap();
        state
            .update(&q, &k, &v, Some(&all_invalid), false, 0, 0, scale)
            .unwrap();
        state
            .update(&q, &k, &v, Some(&all_valid), false, 0, 0, scale)
            .unwrap();
        let out = state.finalize(1e-10).unwrap();

        let vals: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        assert!(vals.iter().all(|v| v.is_finite()));

        // The masked block must contribute zero weight: the result equals
        // attention over the valid block alone.
        let reference = reference_softmax_attention(&q, &k, &v, scale);
        assert!(max_abs_diff(&out, &reference) < 1e-5);
    }

    #[test]
    fn test_every_key_masked_yields_zeros() {
        let device = Device::Cpu;
        let (b, h, n, d) = (1, 1, 4, 8);
        let q = Tensor::randn(0.0f32, 1.0, (b, h, n, d), &device).unwrap();
        let k = Tensor::randn(0.0f32, 1.0, (b, h, n, d), &device).unwrap();
        let v = Tensor::randn(0.0f32, 1.0, (b, h, n, d), &device).unwrap();

        let all_invalid = Tensor::zeros((b, n), candle_core::DType::U8, &device).unwrap();
        let mut state = SoftmaxState::identity(&q).unwrap();
        state
            .update(&q, &k, &v, Some(&all_invalid), false, 0, 0, 0.125)
            .unwrap();
        let out = state.finalize(1e-10).unwrap();

        let vals: Vec<f32> = out.flatten_all().unwrap().to_vec1().unwrap();
        assert!(vals.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_causal_offsets_cross_blocks() {
        let device = Device::Cpu;
        let (b, h, d) = (1, 1, 8);
        let n = 8;
        let q = Tensor::randn(0.0f32, 1.0, (b, h, n, d), &device).unwrap();
        let k = Tensor::randn(0.0f32, 1.0, (b, h, n, d), &device).unwrap();
        let v = Tensor::randn(0.0f32, 1.0, (b, h, n, d), &device).unwrap();
        let scale = 1.0 / (d as f32).sqrt();

        // Causal fold over two key blocks with global offsets.
        let mut state = SoftmaxState::identity(&q).unwrap();
        for k_start in [0, 4] {
            let k_blk = k.narrow(2, k_start, 4).unwrap();
            let v_blk = v.narrow(2, k_start, 4).unwrap();
            state
                .update(&q, &k_blk, &v_blk, None, true, 0, k_start, scale)
                .unwrap();
        }
        let out = state.finalize(1e-10).unwrap();

        // Reference: masked softmax over the full score matrix.
        let scores = q
            .matmul(&k.transpose(D::Minus2, D::Minus1).unwrap())
            .unwrap();
        let scores = (scores * scale as f64).unwrap();
        let mask: Vec<f32> = (0..n)
            .flat_map(|i| (0..n).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 }))
            .collect();
        let mask = Tensor::from_vec(mask, (1, 1, n, n), &device).unwrap();
        let attn = candle_nn::ops::softmax_last_dim(&scores.broadcast_add(&mask).unwrap()).unwrap();
        let reference = attn.matmul(&v).unwrap();

        assert!(max_abs_diff(&out, &reference) < 1e-5);
    }
}
