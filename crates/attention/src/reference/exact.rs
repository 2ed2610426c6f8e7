//! Exact scaled dot-product attention.
//!
//! The reference path materialises the full `[batch, heads, sq, sk]` score
//! tensor, so it accepts any mask and any float dtype. Scores are divided by
//! `sqrt(head_dim) * layer_number` when query-key layer scaling is enabled and
//! multiplied back by `layer_number` inside the fp32 softmax stage, which
//! keeps half-precision scores in range without changing the probabilities.

use std::sync::OnceLock;

use candle_core::{DType, Tensor, D};
use candle_nn::ops::softmax;
use layers::dtypes::MixedPrecision;

use crate::core::{qkv_dims, AttentionError, AttnMaskType, Config, CoreAttention, DropoutState};
use crate::masks::{self, MASKED_FILL};

/// Numerically exact attention used as the correctness fallback.
#[derive(Debug)]
pub struct ReferenceAttention {
    norm_factor: f64,
    layer_scale: Option<f64>,
    softmax_in_fp32: bool,
    mask_type: AttnMaskType,
    first_call: OnceLock<()>,
}

impl ReferenceAttention {
    /// Builds the reference path from a resolved [`Config`].
    pub fn new(config: &Config) -> Self {
        Self {
            norm_factor: config.norm_factor(),
            layer_scale: config.layer_scale(),
            softmax_in_fp32: config.attention_softmax_in_fp32,
            mask_type: config.attn_mask_type,
            first_call: OnceLock::new(),
        }
    }

    /// Attention probabilities `[batch, heads, sq, sk]` before dropout, in the
    /// dtype of `query`.
    pub fn probabilities(&self, query: &Tensor, key: &Tensor, mask: Option<&Tensor>) -> Result<Tensor, AttentionError> {
        let (sq, b, np, hn) = query.dims4()?;
        let sk = key.dim(0)?;
        let dtype = query.dtype();
        if !matches!(dtype, DType::F32 | DType::F16 | DType::BF16 | DType::F64) {
            return Err(AttentionError::UnsupportedDType {
                requested: format!("{dtype:?}"),
            });
        }
        if let Some(mask) = mask {
            masks::validate(mask, b, np, sq, sk)?;
        }

        // Matmuls run in the compute dtype: f32 for half-precision inputs.
        let precision = MixedPrecision::for_storage(dtype);
        // [s, b, np, hn] -> [b * np, s, hn]
        let q = precision
            .promote(query)?
            .permute((1, 2, 0, 3))?
            .contiguous()?
            .reshape((b * np, sq, hn))?;
        let k = precision
            .promote(key)?
            .permute((1, 2, 0, 3))?
            .contiguous()?
            .reshape((b * np, sk, hn))?;
        let scores = q
            .matmul(&k.t()?)?
            .affine(1.0 / self.norm_factor, 0.0)?
            .reshape((b, np, sq, sk))?;

        let mut scores = if self.softmax_in_fp32 {
            scores.to_dtype(DType::F32)?
        } else {
            precision.demote(&scores)?
        };
        if let Some(coeff) = self.layer_scale {
            scores = scores.affine(coeff, 0.0)?;
        }

        let causal = match self.mask_type {
            AttnMaskType::Causal => Some(masks::causal_mask(query.device(), sq, sk)?),
            AttnMaskType::Padding => None,
        };
        let combined = masks::combine(causal.as_ref(), mask)?;

        let probs = match combined {
            Some(mask) => {
                let mask = mask.broadcast_as(scores.shape())?.contiguous()?;
                let fill = Tensor::full(MASKED_FILL as f32, scores.shape(), scores.device())?.to_dtype(scores.dtype())?;
                let probs = softmax(&mask.where_cond(&fill, &scores)?, D::Minus1)?;
                // Rows with every key suppressed attend to nothing.
                let live_rows = mask
                    .to_dtype(probs.dtype())?
                    .min_keepdim(D::Minus1)?
                    .affine(-1.0, 1.0)?;
                probs.broadcast_mul(&live_rows)?
            }
            None => softmax(&scores, D::Minus1)?,
        };
        Ok(probs.to_dtype(dtype)?)
    }
}

impl CoreAttention for ReferenceAttention {
    fn name(&self) -> &'static str {
        "reference"
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
        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::reference init mask={} softmax_fp32={} norm_factor={:.3} layer_scale={:?}",
                self.mask_type,
                self.softmax_in_fp32,
                self.norm_factor,
                self.layer_scale
            );
        }

        let probs = self.probabilities(query, key, mask)?;
        // Whole key positions may be dropped per sample and head.
        let probs = layers::random::dropout(&probs, dropout.probability, dropout.rng)?;

        let precision = MixedPrecision::for_storage(query.dtype());
        let v = precision
            .promote(value)?
            .permute((1, 2, 0, 3))?
            .contiguous()?
            .reshape((b * np, sk, hn))?;
        let context = precision
            .promote(&probs)?
            .reshape((b * np, sq, sk))?
            .matmul(&v)?
            .reshape((b, np, sq, hn))?
            .permute((2, 0, 1, 3))?
            .contiguous()?
            .reshape((sq, b, np * hn))?;
        Ok(precision.demote(&context)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::masks::padding_mask_from_lengths;
    use candle_core::{Device, Result as CandleResult};
    use layers::Lcg64;

    fn inputs(device: &Device, sq: usize, sk: usize) -> CandleResult<(Tensor, Tensor, Tensor)> {
        let q = Tensor::randn(0f32, 1.0, (sq, 2, 3, 8), device)?;
        let k = Tensor::randn(0f32, 1.0, (sk, 2, 3, 8), device)?;
        let v = Tensor::randn(0f32, 1.0, (sk, 2, 3, 8), device)?;
        Ok((q, k, v))
    }

    fn no_dropout(rng: &mut Lcg64) -> DropoutState<'_> {
        DropoutState { probability: 0.0, rng }
    }

    fn reference(mask_type: AttnMaskType) -> ReferenceAttention {
        let mut config = Config::new(3, 8);
        config.attn_mask_type = mask_type;
        ReferenceAttention::new(&config)
    }

    fn max_diff(a: &Tensor, b: &Tensor) -> CandleResult<f32> {
        a.to_dtype(DType::F32)?
            .sub(&b.to_dtype(DType::F32)?)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()
    }

    /// Scalar loop over `[s, b, np, hn]` inputs with bottom-right causal masking.
    fn naive(q: &Tensor, k: &Tensor, v: &Tensor, causal: bool) -> CandleResult<Tensor> {
        let (sq, b, np, hn) = q.dims4()?;
        let sk = k.dim(0)?;
        let qv = q.flatten_all()?.to_vec1::<f32>()?;
        let kv = k.flatten_all()?.to_vec1::<f32>()?;
        let vv = v.flatten_all()?.to_vec1::<f32>()?;
        let at = |s: usize, bi: usize, h: usize, d: usize| ((s * b + bi) * np + h) * hn + d;
        let scale = 1.0 / (hn as f32).sqrt();
        let offset = sk as isize - sq as isize;

        let mut out = vec![0f32; sq * b * np * hn];
        for bi in 0..b {
            for h in 0..np {
                for i in 0..sq {
                    let visible: Vec<usize> = (0..sk)
                        .filter(|&j| !causal || j as isize <= i as isize + offset)
                        .collect();
                    let logits: Vec<f32> = visible
                        .iter()
                        .map(|&j| (0..hn).map(|d| qv[at(i, bi, h, d)] * kv[at(j, bi, h, d)]).sum::<f32>() * scale)
                        .collect();
                    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
                    let weights: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
                    let denom: f32 = weights.iter().sum();
                    for d in 0..hn {
                        out[at(i, bi, h, d)] = visible
                            .iter()
                            .zip(&weights)
                            .map(|(&j, w)| w / denom * vv[at(j, bi, h, d)])
                            .sum();
                    }
                }
            }
        }
        Tensor::from_vec(out, (sq, b, np * hn), q.device())
    }

    #[test]
    fn output_shape_is_seq_batch_hidden() -> Result<(), AttentionError> {
        let device = Device::Cpu;
        let (q, k, v) = inputs(&device, 5, 5)?;
        let out = reference(AttnMaskType::Causal).forward(&q, &k, &v, None, no_dropout(&mut Lcg64::new(0)))?;
        assert_eq!(out.dims(), &[5, 2, 24]);
        assert_eq!(out.dtype(), DType::F32);
        Ok(())
    }

    #[test]
    fn matches_naive_loop() -> Result<(), AttentionError> {
        let device = Device::Cpu;
        for (mask_type, sq, sk) in [(AttnMaskType::Causal, 4, 4), (AttnMaskType::Causal, 2, 6), (AttnMaskType::Padding, 3, 5)] {
            let (q, k, v) = inputs(&device, sq, sk)?;
            let out = reference(mask_type).forward(&q, &k, &v, None, no_dropout(&mut Lcg64::new(0)))?;
            let expected = naive(&q, &k, &v, mask_type == AttnMaskType::Causal)?;
            assert!(max_diff(&out, &expected)? < 1e-4, "{mask_type} {sq}x{sk}");
        }
        Ok(())
    }

    #[test]
    fn unmasked_rows_sum_to_one() -> Result<(), AttentionError> {
        let device = Device::Cpu;
        let (q, k, _) = inputs(&device, 6, 6)?;
        let probs = reference(AttnMaskType::Causal).probabilities(&q, &k, None)?;
        assert_eq!(probs.dims(), &[2, 3, 6, 6]);
        let sums = probs.sum(D::Minus1)?.flatten_all()?.to_vec1::<f32>()?;
        assert!(sums.iter().all(|s| (s - 1.0).abs() < 1e-5));
        Ok(())
    }

    #[test]
    fn masked_keys_do_not_influence_output() -> Result<(), AttentionError> {
        let device = Device::Cpu;
        let (q, k, v) = inputs(&device, 4, 4)?;
        let attention = reference(AttnMaskType::Padding);
        // Second sample only keeps its first two keys.
        let mask = padding_mask_from_lengths(&device, &[4, 2], 4, 4)?;
        let base = attention.forward(&q, &k, &v, Some(&mask), no_dropout(&mut Lcg64::new(0)))?;

        let noise = Tensor::randn(0f32, 5.0, (2, 1, 3, 8), &device)?;
        let tail = Tensor::zeros((2, 1, 3, 8), DType::F32, &device)?;
        let k2 = k.slice_assign(&[2..4, 1..2, 0..3, 0..8], &k.narrow(0, 2, 2)?.narrow(1, 1, 1)?.add(&noise)?)?;
        let v2 = v.slice_assign(&[2..4, 1..2, 0..3, 0..8], &tail)?;
        let perturbed = attention.forward(&q, &k2, &v2, Some(&mask), no_dropout(&mut Lcg64::new(0)))?;
        assert!(max_diff(&base, &perturbed)? < 1e-5);
        Ok(())
    }

    #[test]
    fn fully_masked_rows_are_zero() -> Result<(), AttentionError> {
        let device = Device::Cpu;
        let (q, k, v) = inputs(&device, 3, 3)?;
        let mask = padding_mask_from_lengths(&device, &[0, 3], 3, 3)?;
        let out = reference(AttnMaskType::Padding).forward(&q, &k, &v, Some(&mask), no_dropout(&mut Lcg64::new(0)))?;
        let first = out.narrow(1, 0, 1)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert_eq!(first, 0.0);
        Ok(())
    }

    #[test]
    fn layer_scaling_leaves_probabilities_unchanged() -> Result<(), AttentionError> {
        let device = Device::Cpu;
        let (q, k, _) = inputs(&device, 4, 4)?;
        let mut config = Config::new(3, 8);
        config.layer_number = Some(7);
        config.apply_query_key_layer_scaling = true;
        let scaled = ReferenceAttention::new(&config.resolve()?);
        let plain = reference(AttnMaskType::Causal);
        let diff = max_diff(&scaled.probabilities(&q, &k, None)?, &plain.probabilities(&q, &k, None)?)?;
        assert!(diff < 1e-5);
        Ok(())
    }

    #[test]
    fn half_precision_tracks_f32() -> Result<(), AttentionError> {
        let device = Device::Cpu;
        let (q, k, v) = inputs(&device, 4, 4)?;
        let attention = reference(AttnMaskType::Causal);
        let full = attention.forward(&q, &k, &v, None, no_dropout(&mut Lcg64::new(0)))?;
        for dtype in [DType::F16, DType::BF16] {
            let half = attention.forward(
                &q.to_dtype(dtype)?,
                &k.to_dtype(dtype)?,
                &v.to_dtype(dtype)?,
                None,
                no_dropout(&mut Lcg64::new(0)),
            )?;
            assert_eq!(half.dtype(), dtype);
            assert!(max_diff(&half, &full)? < 5e-2, "{dtype:?}");
        }
        Ok(())
    }

    #[test]
    fn bf16_padding_mask_runs_on_cpu() -> Result<(), AttentionError> {
        let device = Device::Cpu;
        let (q, k, v) = inputs(&device, 3, 5)?;
        let mask = padding_mask_from_lengths(&device, &[5, 2], 3, 5)?;
        let mut config = Config::new(3, 8);
        config.attn_mask_type = AttnMaskType::Padding;
        let full = ReferenceAttention::new(&config).forward(&q, &k, &v, Some(&mask), no_dropout(&mut Lcg64::new(0)))?;
        for softmax_in_fp32 in [true, false] {
            config.attention_softmax_in_fp32 = softmax_in_fp32;
            let attention = ReferenceAttention::new(&config);
            let half = attention.forward(
                &q.to_dtype(DType::BF16)?,
                &k.to_dtype(DType::BF16)?,
                &v.to_dtype(DType::BF16)?,
                Some(&mask),
                no_dropout(&mut Lcg64::new(0)),
            )?;
            assert_eq!(half.dtype(), DType::BF16);
            assert!(max_diff(&half, &full)? < 5e-2, "softmax_in_fp32={softmax_in_fp32}");
        }
        Ok(())
    }

    #[test]
    fn dropout_is_deterministic_per_seed() -> Result<(), AttentionError> {
        let device = Device::Cpu;
        let (q, k, v) = inputs(&device, 4, 4)?;
        let attention = reference(AttnMaskType::Causal);
        let run = |seed| {
            attention.forward(&q, &k, &v, None, DropoutState { probability: 0.2, rng: &mut Lcg64::new(seed) })
        };
        assert_eq!(max_diff(&run(3)?, &run(3)?)?, 0.0);
        assert!(max_diff(&run(3)?, &run(4)?)? > 0.0);
        Ok(())
    }

    #[test]
    fn mismatched_shapes_error() -> CandleResult<()> {
        let device = Device::Cpu;
        let q = Tensor::zeros((4, 1, 2, 8), DType::F32, &device)?;
        let k = Tensor::zeros((4, 1, 2, 8), DType::F32, &device)?;
        let v = Tensor::zeros((5, 1, 2, 8), DType::F32, &device)?;
        let err = reference(AttnMaskType::Causal).forward(&q, &k, &v, None, no_dropout(&mut Lcg64::new(0)));
        assert!(matches!(err, Err(AttentionError::InvalidShape { .. })));
        Ok(())
    }
}
