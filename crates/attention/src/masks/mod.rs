//! Boolean attention masks shared by attention implementations.
//!
//! Masks are `U8` tensors broadcastable to `[batch, heads, q_len, k_len]`.
//! A nonzero entry suppresses the corresponding key for that query; zero keeps
//! it. Builders emit singleton head (and, for causal masks, batch) axes so the
//! same tensor serves every head partition.

pub mod causal;
pub mod padding;

use candle_core::{DType, Result, Tensor};

use crate::core::AttentionError;

/// Dtype shared by all boolean masks.
pub const MASK_DTYPE: DType = DType::U8;

/// Logit written into suppressed positions before the softmax.
pub const MASKED_FILL: f64 = -10000.0;

pub use causal::causal_mask;
pub use padding::{padding_mask_from_booleans, padding_mask_from_lengths};

/// ORs two optional masks together.
pub fn combine(a: Option<&Tensor>, b: Option<&Tensor>) -> Result<Option<Tensor>> {
    match (a, b) {
        (Some(a), Some(b)) => a.broadcast_maximum(b).map(Some),
        (Some(m), None) | (None, Some(m)) => Ok(Some(m.clone())),
        (None, None) => Ok(None),
    }
}

/// Checks a caller-supplied mask against the attention problem size.
pub fn validate(
    mask: &Tensor,
    batch: usize,
    heads: usize,
    q_len: usize,
    k_len: usize,
) -> std::result::Result<(), AttentionError> {
    if mask.dtype() != MASK_DTYPE {
        return Err(AttentionError::UnsupportedDType {
            requested: format!("mask expects dtype {MASK_DTYPE:?}, got {:?}", mask.dtype()),
        });
    }
    let target = [batch, heads, q_len, k_len];
    let dims = mask.dims();
    let broadcastable = dims.len() == 4
        && dims
            .iter()
            .zip(target.iter())
            .all(|(have, want)| *have == 1 || have == want);
    if !broadcastable {
        return Err(AttentionError::InvalidShape {
            context: format!("mask {dims:?} does not broadcast to {target:?}"),
        });
    }
    Ok(())
}
