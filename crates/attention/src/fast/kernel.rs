//! Contract between [`FastAttention`](super::FastAttention) and the kernel
//! that does the actual work on packed variable-length batches.

use std::fmt;
use std::sync::Arc;

use candle_core::{Device, Tensor};
use layers::Lcg64;

use crate::core::AttentionError;

/// Packed inputs for one variable-length attention call.
///
/// `q` is `[total_q, heads, head_dim]` and `k`/`v` are `[total_k, heads,
/// head_dim]`. Sequence `i` occupies rows `cu_seqlens_q[i]..cu_seqlens_q[i + 1]`
/// of `q` and the matching range of `cu_seqlens_k` in `k`/`v`; both offset
/// tensors are `U32` with `batch + 1` entries.
#[derive(Debug, Clone, Copy)]
pub struct VarlenArgs<'a> {
    pub q: &'a Tensor,
    pub k: &'a Tensor,
    pub v: &'a Tensor,
    pub cu_seqlens_q: &'a Tensor,
    pub cu_seqlens_k: &'a Tensor,
    pub max_seqlen_q: usize,
    pub max_seqlen_k: usize,
    pub dropout_p: f32,
    pub softmax_scale: f32,
    pub causal: bool,
}

/// A fast attention kernel over packed variable-length sequences.
pub trait FlashKernel: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Whether tensors on `device` can be handed to this kernel.
    fn supports_device(&self, device: &Device) -> bool;

    /// Whether the kernel applies attention dropout itself.
    fn supports_dropout(&self) -> bool {
        true
    }

    /// Verifies the runtime dependencies of the kernel are present.
    fn check_available(&self) -> Result<(), AttentionError>;

    /// Returns the packed context `[total_q, heads, head_dim]` in the input dtype.
    fn varlen_forward(&self, args: VarlenArgs<'_>, rng: &mut Lcg64) -> Result<Tensor, AttentionError>;
}

/// Kernel used when none is specified: flash-attn when compiled in, otherwise
/// the portable blockwise kernel.
pub fn default_kernel() -> Arc<dyn FlashKernel> {
    #[cfg(feature = "flash-attn")]
    {
        Arc::new(super::flash::FlashAttnKernel)
    }
    #[cfg(not(feature = "flash-attn"))]
    {
        Arc::new(super::blockwise::BlockwiseKernel::default())
    }
}
