//! The projection contract consumed by attention blocks and the transformer layer.
//!
//! A projection maps `(seq, batch, in)` activations to `(seq, batch, out)` and
//! may fuse a preceding normalisation. Implementations can hand back their
//! bias unapplied so the caller can fuse it with dropout and the residual add.

use candle_core::{Result, Tensor};

/// Result of applying a [`Projection`].
#[derive(Debug, Clone)]
pub struct ProjectionOutput {
    /// Projected activations.
    pub output: Tensor,
    /// Bias that still has to be added, when the projection returns it unfused.
    pub bias: Option<Tensor>,
    /// Output of the fused normalisation, when requested.
    pub norm_output: Option<Tensor>,
}

impl ProjectionOutput {
    pub fn new(output: Tensor) -> Self {
        Self {
            output,
            bias: None,
            norm_output: None,
        }
    }
}

/// Opaque projection collaborator.
pub trait Projection: Send + Sync {
    /// Applies the projection.
    ///
    /// `is_first_microbatch` marks the first micro-batch of a gradient
    /// accumulation window; `None` means micro-batching is not in use.
    fn apply(&self, input: &Tensor, is_first_microbatch: Option<bool>) -> Result<ProjectionOutput>;

    /// Size of the last input dimension this projection accepts.
    fn input_dim(&self) -> usize;

    /// Size of the last output dimension on this partition.
    fn output_dim(&self) -> usize;
}
