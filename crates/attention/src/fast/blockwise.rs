//! Portable tiled attention kernel.
//!
//! Keys are processed in blocks with an online softmax (running row maximum
//! and normaliser) so the full score matrix is never materialised. All
//! arithmetic happens in `f32`. It stands in for flash-attn on accelerators
//! without it. CPU tensors are refused unless [`BlockwiseKernel::on_host`]
//! opts in, so the dispatcher keeps host calls on the reference path.

use candle_core::{DType, Device, Tensor, D};
use layers::Lcg64;

use super::kernel::{FlashKernel, VarlenArgs};
use crate::core::AttentionError;

/// Logit used for causally hidden keys inside a block. Finite so that a
/// block whose keys are all hidden cannot produce `NaN`.
const HIDDEN_LOGIT: f64 = -1e9;

/// Online-softmax kernel over key blocks of `block_size`.
#[derive(Debug, Clone)]
pub struct BlockwiseKernel {
    block_size: usize,
    host: bool,
}

impl BlockwiseKernel {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size: block_size.max(1),
            host: false,
        }
    }

    /// Also accepts CPU tensors.
    pub fn on_host(mut self) -> Self {
        self.host = true;
        self
    }
}

impl Default for BlockwiseKernel {
    fn default() -> Self {
        Self::new(64)
    }
}

impl FlashKernel for BlockwiseKernel {
    fn name(&self) -> &'static str {
        "blockwise"
    }

    fn supports_device(&self, device: &Device) -> bool {
        self.host || !device.is_cpu()
    }

    fn check_available(&self) -> Result<(), AttentionError> {
        Ok(())
    }

    fn varlen_forward(&self, args: VarlenArgs<'_>, rng: &mut Lcg64) -> Result<Tensor, AttentionError> {
        let cu_q = args.cu_seqlens_q.to_vec1::<u32>()?;
        let cu_k = args.cu_seqlens_k.to_vec1::<u32>()?;
        if cu_q.len() != cu_k.len() || cu_q.is_empty() {
            return Err(AttentionError::InvalidShape {
                context: format!(
                    "cu_seqlens_q has {} entries but cu_seqlens_k has {}",
                    cu_q.len(),
                    cu_k.len()
                ),
            });
        }

        let mut outputs = Vec::with_capacity(cu_q.len() - 1);
        for (q_range, k_range) in cu_q.windows(2).zip(cu_k.windows(2)) {
            let (q_start, q_len) = (q_range[0] as usize, (q_range[1] - q_range[0]) as usize);
            let (k_start, k_len) = (k_range[0] as usize, (k_range[1] - k_range[0]) as usize);
            let q = args.q.narrow(0, q_start, q_len)?;
            let k = args.k.narrow(0, k_start, k_len)?;
            let v = args.v.narrow(0, k_start, k_len)?;
            outputs.push(self.sequence(&q, &k, &v, &args, rng)?);
        }
        let output = Tensor::cat(&outputs, 0)?;
        Ok(output.to_dtype(args.q.dtype())?)
    }
}

impl BlockwiseKernel {
    /// Attention for one sequence; inputs are `[len, heads, head_dim]`.
    fn sequence(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        args: &VarlenArgs<'_>,
        rng: &mut Lcg64,
    ) -> Result<Tensor, AttentionError> {
        let (q_len, heads, head_dim) = q.dims3()?;
        let k_len = k.dim(0)?;
        let device = q.device();
        // [len, heads, d] -> [heads, len, d]
        let q = q.to_dtype(DType::F32)?.transpose(0, 1)?.contiguous()?;
        let k = k.to_dtype(DType::F32)?.transpose(0, 1)?.contiguous()?;
        let v = v.to_dtype(DType::F32)?.transpose(0, 1)?.contiguous()?;
        let offset = k_len as isize - q_len as isize;

        let mut row_max = Tensor::full(HIDDEN_LOGIT as f32, (heads, q_len, 1), device)?;
        let mut row_sum = Tensor::zeros((heads, q_len, 1), DType::F32, device)?;
        let mut acc = Tensor::zeros((heads, q_len, head_dim), DType::F32, device)?;

        let mut start = 0;
        while start < k_len {
            let len = self.block_size.min(k_len - start);
            let k_blk = k.narrow(1, start, len)?;
            let v_blk = v.narrow(1, start, len)?.contiguous()?;
            let mut scores = q
                .matmul(&k_blk.t()?.contiguous()?)?
                .affine(args.softmax_scale as f64, 0.0)?;
            if args.causal {
                let hidden: Vec<u8> = (0..q_len)
                    .flat_map(|i| (start..start + len).map(move |j| u8::from(j as isize > i as isize + offset)))
                    .collect();
                let hidden = Tensor::from_vec(hidden, (1, q_len, len), device)?
                    .broadcast_as((heads, q_len, len))?
                    .contiguous()?;
                let fill = Tensor::full(HIDDEN_LOGIT as f32, (heads, q_len, len), device)?;
                scores = hidden.where_cond(&fill, &scores)?;
            }

            let new_max = row_max.maximum(&scores.max_keepdim(D::Minus1)?)?;
            let weights = scores.broadcast_sub(&new_max)?.exp()?;
            let correction = (row_max - &new_max)?.exp()?;
            row_sum = row_sum.mul(&correction)?.add(&weights.sum_keepdim(D::Minus1)?)?;
            // The normaliser uses undropped weights, so dropping here equals
            // dropping the final probabilities.
            let weights = layers::random::dropout(&weights, args.dropout_p, rng)?;
            acc = acc.broadcast_mul(&correction)?.add(&weights.matmul(&v_blk)?)?;
            row_max = new_max;
            start += len;
        }

        let mut output = acc.broadcast_div(&row_sum)?;
        if args.causal && offset < 0 {
            // Queries ahead of every key see nothing.
            let blind = (-offset) as usize;
            let seen = output.narrow(1, blind, q_len - blind)?;
            let zeros = Tensor::zeros((heads, blind, head_dim), DType::F32, device)?;
            output = Tensor::cat(&[&zeros, &seen], 1)?;
        }
        Ok(output.transpose(0, 1)?.contiguous()?)
    }
}
