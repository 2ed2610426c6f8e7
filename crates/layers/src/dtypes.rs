//! Mixed-precision casting rules.
//!
//! Parameters and activations may be stored as `f16`/`bf16`; projections and
//! normalisation statistics run in `f32` and the result is cast back to the
//! storage dtype.

use candle_core::{DType, Result, Tensor};

/// Storage dtype of a tensor together with the dtype its arithmetic runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MixedPrecision {
    storage: DType,
    compute: DType,
}

impl MixedPrecision {
    /// Half-precision storage promotes to `f32`; anything else computes in place.
    pub fn for_storage(storage: DType) -> Self {
        let compute = if is_half(storage) { DType::F32 } else { storage };
        Self { storage, compute }
    }

    pub fn compute(&self) -> DType {
        self.compute
    }

    pub fn promote(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.compute)
    }

    /// Reductions (means, variances) always use at least `f32`.
    pub fn promote_for_reduction(&self, tensor: &Tensor) -> Result<Tensor> {
        match tensor.dtype() {
            DType::F64 => Ok(tensor.clone()),
            _ => cast_tensor(tensor, DType::F32),
        }
    }

    pub fn demote(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.storage)
    }
}

/// Casts only when the dtype actually differs.
pub fn cast_tensor(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    if tensor.dtype() == dtype {
        Ok(tensor.clone())
    } else {
        tensor.to_dtype(dtype)
    }
}

/// Whether `dtype` is one of the 16-bit floating formats.
pub fn is_half(dtype: DType) -> bool {
    matches!(dtype, DType::F16 | DType::BF16)
}
