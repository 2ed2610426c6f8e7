//! Builders for padding masks used to drop padded keys.

use candle_core::{Device, Error, Result, Tensor};

/// Padding mask `[batch, 1, q_len, k_len]` from per-sample valid key lengths.
pub fn padding_mask_from_lengths(
    device: &Device,
    key_lengths: &[usize],
    q_len: usize,
    k_len: usize,
) -> Result<Tensor> {
    let mut data = Vec::with_capacity(key_lengths.len() * q_len * k_len);
    for &valid in key_lengths {
        let valid = valid.min(k_len);
        for _ in 0..q_len {
            data.extend((0..k_len).map(|k| u8::from(k >= valid)));
        }
    }
    Tensor::from_vec(data, (key_lengths.len(), 1, q_len, k_len), device)
}

/// Padding mask `[batch, 1, q_len, k_len]` from per-key padding flags.
///
/// `true` marks a padded key. Every row must have the same length.
pub fn padding_mask_from_booleans(device: &Device, padding: &[Vec<bool>], q_len: usize) -> Result<Tensor> {
    let k_len = padding.first().map(Vec::len).unwrap_or(0);
    if padding.iter().any(|row| row.len() != k_len) {
        return Err(Error::Msg("all boolean padding rows must share k_len".into()));
    }
    let mut data = Vec::with_capacity(padding.len() * q_len * k_len);
    for row in padding {
        for _ in 0..q_len {
            data.extend(row.iter().map(|&padded| u8::from(padded)));
        }
    }
    Tensor::from_vec(data, (padding.len(), 1, q_len, k_len), device)
}
