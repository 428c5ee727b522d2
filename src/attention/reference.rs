//! Float32 reference attention on candle tensors.
//!
//! Plain `softmax(q k^T / sqrt(d)) v` with no quantization, paging or lane
//! emulation. Used to check the kernel and by the CLI's `--verify`.

use candle_core::{Device, Tensor, D};

use crate::core::kv_cache::KvCacheAddressor;
use crate::error::{Error, Result};

/// Repeats KV heads for Grouped Query Attention.
///
/// Transforms [batch, seq_len, num_kv_heads, head_dim]
/// to [batch, seq_len, num_heads, head_dim]
pub fn repeat_kv(x: &Tensor, num_heads: usize, num_kv_heads: usize) -> Result<Tensor> {
    let n_rep = num_heads / num_kv_heads;
    if n_rep == 1 {
        return Ok(x.clone());
    }

    let (batch, seq_len, _, head_dim) = x.dims4()?;

    // Expand and repeat
    let x = x.unsqueeze(3)?;
    let x = x.expand((batch, seq_len, num_kv_heads, n_rep, head_dim))?;
    Ok(x.reshape((batch, seq_len, num_heads, head_dim))?)
}

/// Decode attention for one new query per head.
///
/// # Arguments
///
/// * `query` - Query tensor [batch, num_heads, head_dim]
/// * `keys` - Key history [batch, seq_len, num_kv_heads, head_dim]
/// * `values` - Value history [batch, seq_len, num_kv_heads, head_dim]
/// * `num_kv_heads` - Number of KV heads (for GQA)
///
/// # Returns
///
/// Attention output [batch, num_heads, head_dim]
pub fn reference_decode_attention(
    query: &Tensor,
    keys: &Tensor,
    values: &Tensor,
    num_kv_heads: usize,
) -> Result<Tensor> {
    let (_, num_heads, head_dim) = query.dims3()?;
    let scale = 1.0 / (head_dim as f64).sqrt();

    let keys = repeat_kv(keys, num_heads, num_kv_heads)?;
    let values = repeat_kv(values, num_heads, num_kv_heads)?;

    // [batch, num_heads, 1, head_dim] against [batch, num_heads, seq_len, head_dim]
    let q = query.unsqueeze(2)?.contiguous()?;
    let k = keys.transpose(1, 2)?.contiguous()?;
    let v = values.transpose(1, 2)?.contiguous()?;

    let attn_weights = (q.matmul(&k.transpose(D::Minus2, D::Minus1)?)? * scale)?;
    let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
    let output = attn_weights.matmul(&v)?;
    Ok(output.squeeze(2)?)
}

/// Reference output of a single head over flat `[seq_len, head_dim]` rows.
pub fn reference_head_attention(query: &[f32], keys: &[f32], values: &[f32]) -> Result<Vec<f32>> {
    let head_dim = query.len();
    if head_dim == 0 || keys.len() % head_dim != 0 {
        return Err(Error::ShapeMismatch {
            what: "reference key history",
            expected: head_dim,
            actual: keys.len(),
        });
    }
    Error::check_len("reference value history", keys.len(), values.len())?;
    let seq_len = keys.len() / head_dim;

    let device = Device::Cpu;
    let q = Tensor::from_slice(query, (1, 1, head_dim), &device)?;
    let k = Tensor::from_slice(keys, (1, seq_len, 1, head_dim), &device)?;
    let v = Tensor::from_slice(values, (1, seq_len, 1, head_dim), &device)?;
    Ok(reference_decode_attention(&q, &k, &v, 1)?.flatten_all()?.to_vec1::<f32>()?)
}

/// Reference output of one head against cached history plus the new token.
///
/// The history is dequantized exactly as the kernel reads it; `query` and
/// `key` are expected post-rotary.
pub fn reference_from_cache<A: KvCacheAddressor>(
    cache: &A,
    seq: usize,
    head_rank: usize,
    history: &[usize],
    query: &[f32],
    key: &[f32],
    value: &[f32],
) -> Result<Vec<f32>> {
    let (mut keys, mut values) = cache.gather_dequantized(seq, head_rank, history);
    keys.extend_from_slice(key);
    values.extend_from_slice(value);
    reference_head_attention(query, &keys, &values)
}
