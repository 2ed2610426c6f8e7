//! Fast attention over packed variable-length batches.
//!
//! [`FastAttention`] accepts the same `[s, b, np, hn]` inputs as the reference
//! path but only inside a narrow envelope: causal masking without an explicit
//! mask, fp32 softmax, no query-key layer scaling, `f16`/`bf16` inputs on a
//! device the kernel supports. The `(seq, batch)` axes are packed into
//! uniform-length sequences (padding is not supported) and handed to a
//! [`FlashKernel`].

mod blockwise;
#[cfg(feature = "flash-attn")]
mod flash;
mod kernel;

use std::sync::{Arc, OnceLock};

use candle_core::{DType, Device, Tensor};

pub use blockwise::BlockwiseKernel;
#[cfg(feature = "flash-attn")]
pub use flash::FlashAttnKernel;
pub use kernel::{default_kernel, FlashKernel, VarlenArgs};

use crate::core::{qkv_dims, AttentionError, AttnMaskType, Config, CoreAttention, DropoutState};

/// Fast-kernel attention with a restricted contract.
#[derive(Debug)]
pub struct FastAttention {
    kernel: Arc<dyn FlashKernel>,
    softmax_scale: f32,
    first_call: OnceLock<()>,
}

impl FastAttention {
    /// Fails when `config` lies outside the fast envelope or the kernel's
    /// runtime dependencies are missing.
    pub fn new(config: &Config, kernel: Arc<dyn FlashKernel>) -> Result<Self, AttentionError> {
        if config.attn_mask_type != AttnMaskType::Causal {
            return Err(precondition(format!(
                "mask type must be causal, got {}",
                config.attn_mask_type
            )));
        }
        if !config.attention_softmax_in_fp32 {
            return Err(precondition("softmax must run in fp32".into()));
        }
        if config.layer_scale().is_some() {
            return Err(precondition(
                "query-key layer scaling is not applied by the fast kernel".into(),
            ));
        }
        kernel.check_available()?;
        Ok(Self {
            kernel,
            softmax_scale: (1.0 / config.norm_factor()) as f32,
            first_call: OnceLock::new(),
        })
    }

    pub fn kernel_name(&self) -> &'static str {
        self.kernel.name()
    }

    /// Whether a call with these inputs stays inside the fast envelope.
    pub fn accepts(&self, dtype: DType, device: &Device, mask: Option<&Tensor>, dropout_p: f32) -> bool {
        self.check_call(dtype, device, mask, dropout_p).is_ok()
    }

    fn check_call(&self, dtype: DType, device: &Device, mask: Option<&Tensor>, dropout_p: f32) -> Result<(), AttentionError> {
        if mask.is_some() {
            return Err(precondition("explicit masks are not supported".into()));
        }
        if !matches!(dtype, DType::F16 | DType::BF16) {
            return Err(precondition(format!("inputs must be f16 or bf16, got {dtype:?}")));
        }
        if !self.kernel.supports_device(device) {
            return Err(precondition(format!(
                "kernel `{}` cannot run on {device:?}",
                self.kernel.name()
            )));
        }
        if dropout_p > 0.0 && !self.kernel.supports_dropout() {
            return Err(precondition(format!(
                "kernel `{}` does not apply attention dropout",
                self.kernel.name()
            )));
        }
        Ok(())
    }
}

impl CoreAttention for FastAttention {
    fn name(&self) -> &'static str {
        "fast"
    }

    fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        mask: Option<&Tensor>,
        dropout: DropoutState<'_>,
    ) -> Result<Tensor, AttentionError> {
        let (sq, sk, b, np, hn) = qkv_dims(query, key, value)?;
        self.check_call(query.dtype(), query.device(), mask, dropout.probability)?;
        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::fast init kernel={} scale={:.5}",
                self.kernel.name(),
                self.softmax_scale
            );
        }

        // [s, b, np, hn] -> [b * s, np, hn]
        let pack = |t: &Tensor, s: usize| -> candle_core::Result<Tensor> {
            t.transpose(0, 1)?.contiguous()?.reshape((b * s, np, hn))
        };
        let q = pack(query, sq)?;
        let k = pack(key, sk)?;
        let v = pack(value, sk)?;
        let cu_seqlens_q = cumulative_lengths(b, sq, query.device())?;
        let cu_seqlens_k = cumulative_lengths(b, sk, query.device())?;

        let output = self.kernel.varlen_forward(
            VarlenArgs {
                q: &q,
                k: &k,
                v: &v,
                cu_seqlens_q: &cu_seqlens_q,
                cu_seqlens_k: &cu_seqlens_k,
                max_seqlen_q: sq,
                max_seqlen_k: sk,
                dropout_p: dropout.probability,
                softmax_scale: self.softmax_scale,
                causal: true,
            },
            dropout.rng,
        )?;
        Ok(output
            .reshape((b, sq, np * hn))?
            .transpose(0, 1)?
            .contiguous()?)
    }
}

/// `[0, len, 2 * len, ..., batch * len]` as a `U32` tensor.
fn cumulative_lengths(batch: usize, len: usize, device: &Device) -> candle_core::Result<Tensor> {
    let offsets: Vec<u32> = (0..=batch).map(|i| (i * len) as u32).collect();
    Tensor::from_vec(offsets, batch + 1, device)
}

fn precondition(reason: String) -> AttentionError {
    AttentionError::FastPathPrecondition { reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::ReferenceAttention;
    use layers::Lcg64;

    fn inputs(dtype: DType, sq: usize, sk: usize) -> candle_core::Result<(Tensor, Tensor, Tensor)> {
        let device = Device::Cpu;
        let q = Tensor::randn(0f32, 1.0, (sq, 2, 4, 16), &device)?.to_dtype(dtype)?;
        let k = Tensor::randn(0f32, 1.0, (sk, 2, 4, 16), &device)?.to_dtype(dtype)?;
        let v = Tensor::randn(0f32, 1.0, (sk, 2, 4, 16), &device)?.to_dtype(dtype)?;
        Ok((q, k, v))
    }

    fn relative_error(fast: &Tensor, reference: &Tensor) -> candle_core::Result<f32> {
        let fast = fast.to_dtype(DType::F32)?;
        let reference = reference.to_dtype(DType::F32)?;
        let diff = fast.sub(&reference)?.abs()?.max_all()?.to_vec0::<f32>()?;
        let scale = reference.abs()?.max_all()?.to_vec0::<f32>()?.max(1e-6);
        Ok(diff / scale)
    }

    fn no_dropout(rng: &mut Lcg64) -> DropoutState<'_> {
        DropoutState { probability: 0.0, rng }
    }

    #[test]
    fn matches_reference_in_half_precision() -> Result<(), AttentionError> {
        let config = Config::new(4, 16);
        // Small blocks exercise the online-softmax rescaling.
        let fast = FastAttention::new(&config, Arc::new(BlockwiseKernel::new(3).on_host()))?;
        let reference = ReferenceAttention::new(&config);
        for (dtype, tol) in [(DType::F16, 1e-2), (DType::BF16, 3e-2)] {
            for (sq, sk) in [(7, 7), (2, 9)] {
                let (q, k, v) = inputs(dtype, sq, sk)?;
                let a = fast.forward(&q, &k, &v, None, no_dropout(&mut Lcg64::new(0)))?;
                let b = reference.forward(&q, &k, &v, None, no_dropout(&mut Lcg64::new(0)))?;
                assert_eq!(a.dims(), b.dims());
                assert_eq!(a.dtype(), dtype);
                let err = relative_error(&a, &b)?;
                assert!(err < tol, "{dtype:?} {sq}x{sk}: relative error {err}");
            }
        }
        Ok(())
    }

    #[test]
    fn rejects_out_of_envelope_configs() {
        let kernel: Arc<dyn FlashKernel> = Arc::new(BlockwiseKernel::default());
        let mut padding = Config::new(4, 16);
        padding.attn_mask_type = AttnMaskType::Padding;
        assert!(FastAttention::new(&padding, kernel.clone()).is_err());

        let mut half_softmax = Config::new(4, 16);
        half_softmax.attention_softmax_in_fp32 = false;
        assert!(FastAttention::new(&half_softmax, kernel.clone()).is_err());

        let mut scaled = Config::new(4, 16);
        scaled.layer_number = Some(2);
        scaled.apply_query_key_layer_scaling = true;
        assert!(matches!(
            FastAttention::new(&scaled, kernel),
            Err(AttentionError::FastPathPrecondition { .. })
        ));
    }

    #[test]
    fn rejects_out_of_envelope_calls() -> Result<(), AttentionError> {
        let fast = FastAttention::new(&Config::new(4, 16), Arc::new(BlockwiseKernel::default().on_host()))?;
        let (q, k, v) = inputs(DType::F32, 4, 4)?;
        let err = fast.forward(&q, &k, &v, None, no_dropout(&mut Lcg64::new(0)));
        assert!(matches!(err, Err(AttentionError::FastPathPrecondition { .. })));

        let (q, k, v) = inputs(DType::F16, 4, 4)?;
        let mask = crate::masks::causal_mask(&Device::Cpu, 4, 4)?;
        let err = fast.forward(&q, &k, &v, Some(&mask), no_dropout(&mut Lcg64::new(0)));
        assert!(matches!(err, Err(AttentionError::FastPathPrecondition { .. })));
        Ok(())
    }

    #[test]
    fn default_blockwise_kernel_refuses_host_tensors() -> Result<(), AttentionError> {
        let fast = FastAttention::new(&Config::new(4, 16), Arc::new(BlockwiseKernel::default()))?;
        assert!(!fast.accepts(DType::F16, &Device::Cpu, None, 0.0));
        let (q, k, v) = inputs(DType::BF16, 4, 4)?;
        let err = fast.forward(&q, &k, &v, None, no_dropout(&mut Lcg64::new(0)));
        assert!(matches!(err, Err(AttentionError::FastPathPrecondition { .. })));

        let host = FastAttention::new(&Config::new(4, 16), Arc::new(BlockwiseKernel::default().on_host()))?;
        assert!(host.accepts(DType::F16, &Device::Cpu, None, 0.0));
        Ok(())
    }

    #[test]
    fn cumulative_lengths_are_uniform() -> candle_core::Result<()> {
        let offsets = cumulative_lengths(3, 5, &Device::Cpu)?.to_vec1::<u32>()?;
        assert_eq!(offsets, vec![0, 5, 10, 15]);
        Ok(())
    }
}
