//! CUDA flash-attention kernel via `candle-flash-attn`.

use candle_core::{Device, Tensor};
use layers::Lcg64;

use super::kernel::{FlashKernel, VarlenArgs};
use crate::core::AttentionError;

/// Wraps `candle_flash_attn::flash_attn_varlen`. The kernel has no dropout
/// support, so the dispatcher routes training calls with attention dropout to
/// the reference path.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlashAttnKernel;

impl FlashKernel for FlashAttnKernel {
    fn name(&self) -> &'static str {
        "flash-attn"
    }

    fn supports_device(&self, device: &Device) -> bool {
        device.is_cuda()
    }

    fn supports_dropout(&self) -> bool {
        false
    }

    fn check_available(&self) -> Result<(), AttentionError> {
        if candle_core::utils::cuda_is_available() {
            Ok(())
        } else {
            Err(AttentionError::MissingKernel {
                kernel: self.name(),
                reason: "no CUDA device is available".into(),
            })
        }
    }

    fn varlen_forward(&self, args: VarlenArgs<'_>, _rng: &mut Lcg64) -> Result<Tensor, AttentionError> {
        if args.dropout_p > 0.0 {
            return Err(AttentionError::FastPathPrecondition {
                reason: format!("{} does not implement attention dropout", self.name()),
            });
        }
        Ok(candle_flash_attn::flash_attn_varlen(
            args.q,
            args.k,
            args.v,
            args.cu_seqlens_q,
            args.cu_seqlens_k,
            args.max_seqlen_q,
            args.max_seqlen_k,
            args.softmax_scale,
            args.causal,
        )?)
    }
}
