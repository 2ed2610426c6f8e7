//! Core traits and types shared across attention implementations.
//!
//! Implementations consume `q` shaped `[sq, batch, heads, head_dim]` and `k`/`v`
//! shaped `[sk, batch, heads, head_dim]`, and return the context as
//! `[sq, batch, heads * head_dim]` in the dtype of `q`.

pub mod config;
pub mod errors;

use std::fmt;

use candle_core::Tensor;
use layers::Lcg64;

pub use config::{AttnMaskType, Config};
pub use errors::AttentionError;

/// Per-call dropout parameters. `probability` is zero outside training.
#[derive(Debug)]
pub struct DropoutState<'a> {
    pub probability: f32,
    pub rng: &'a mut Lcg64,
}

/// Unified interface for the attention variants a dispatcher can select.
///
/// * Masks, when present, are `U8` tensors broadcastable to
///   `[batch, heads, sq, sk]`; nonzero entries are suppressed.
/// * Causal masking aligns queries with the most recent keys.
pub trait CoreAttention: Send + Sync + fmt::Debug {
    /// Short identifier used in logs.
    fn name(&self) -> &'static str;

    fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        mask: Option<&Tensor>,
        dropout: DropoutState<'_>,
    ) -> Result<Tensor, AttentionError>;
}

/// Validates the `[s, b, np, hn]` layout shared by q/k/v and returns
/// `(sq, sk, batch, heads, head_dim)`.
pub(crate) fn qkv_dims(
    query: &Tensor,
    key: &Tensor,
    value: &Tensor,
) -> Result<(usize, usize, usize, usize, usize), AttentionError> {
    let (sq, b, np, hn) = query.dims4().map_err(|_| AttentionError::InvalidShape {
        context: format!("query must be [sq, b, np, hn], got {:?}", query.dims()),
    })?;
    let (sk, kb, knp, khn) = key.dims4().map_err(|_| AttentionError::InvalidShape {
        context: format!("key must be [sk, b, np, hn], got {:?}", key.dims()),
    })?;
    if (kb, knp, khn) != (b, np, hn) {
        return Err(AttentionError::InvalidShape {
            context: format!(
                "key {:?} does not match query {:?}",
                key.dims(),
                query.dims()
            ),
        });
    }
    if value.dims() != key.dims() {
        return Err(AttentionError::InvalidShape {
            context: format!(
                "value {:?} does not match key {:?}",
                value.dims(),
                key.dims()
            ),
        });
    }
    if query.dtype() != key.dtype() || query.dtype() != value.dtype() {
        return Err(AttentionError::InvalidShape {
            context: "q, k, v must share the same dtype".to_string(),
        });
    }
    Ok((sq, sk, b, np, hn))
}
