//! Builders for causal attention masks.

use candle_core::{Device, Result, Tensor};

/// Causal mask shaped `[1, 1, q_len, k_len]`.
///
/// Queries align with the most recent `q_len` keys: query `i` may see keys
/// `0..=i + (k_len - q_len)`. When `k_len < q_len` the earliest queries see
/// nothing and their rows are fully masked.
pub fn causal_mask(device: &Device, q_len: usize, k_len: usize) -> Result<Tensor> {
    let offset = k_len as isize - q_len as isize;
    let data: Vec<u8> = (0..q_len)
        .flat_map(|q| (0..k_len).map(move |k| u8::from(k as isize > q as isize + offset)))
        .collect();
    Tensor::from_vec(data, (1, 1, q_len, k_len), device)
}
