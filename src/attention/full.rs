//! Full-sequence attention.
//!
//! The single-rank reference path: materializes the whole score matrix and
//! applies an ordinary softmax. Every ring-path output must match this
//! within floating-point tolerance.

use candle_core::{Result, Tensor, D};

use crate::attention::flash::MASK_VALUE;

/// Masked/causal softmax attention over a full sequence.
///
/// # Arguments
///
/// * `q`, `k`, `v` - `[batch, heads, seq, head_dim]`
/// * `key_mask` - Optional key validity `[batch, seq]`, `1` = valid
/// * `causal` - Restrict each query to keys at or before its own position
/// * `scale` - Score scale, typically `head_dim^-0.5`
///
/// # Returns
///
/// Attention output `[batch, heads, seq, head_dim]`.
pub fn full_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    key_mask: Option<&Tensor>,
    causal: bool,
    scale: f32,
) -> Result<Tensor> {
    let (_batch, _heads, seq_q, _head_dim) = q.dims4()?;
    let seq_k = k.dim(2)?;

    let scores = q.matmul(&k.transpose(D::Minus2, D::Minus1)?)?;
    let mut scores = (scores * scale as f64)?;

    if causal {
        let mask: Vec<f32> = (0..seq_q)
            .flat_map(|i| {
                (0..seq_k).map(move |j| if j > i { MASK_VALUE } else { 0.0 })
            })
            .collect();
        let mask = Tensor::from_vec(mask, (1, 1, seq_q, seq_k), q.device())?;
        scores = scores.broadcast_add(&mask)?;
    }

    if let Some(key_mask) = key_mask {
        let batch = key_mask.dim(0)?;
        let valid = key_mask.contiguous()?.reshape((batch, 1, 1, seq_k))?;
        let masked = Tensor::full(MASK_VALUE, scores.dims(), scores.device())?
            .to_dtype(scores.dtype())?;
        scores = valid
            .broadcast_as(scores.dims())?
            .where_cond(&scores, &masked)?;
    }

    let attn = candle_nn::ops::softmax_last_dim(&scores)?;
    attn.matmul(v)
}
