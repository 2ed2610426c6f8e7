//! LayerNorm and the fused LayerNorm + linear projection.
//!
//! Statistics are always computed in `f32` ([`MixedPrecision::promote_for_reduction`])
//! and the result is cast back to the activation dtype. With zero-centered
//! gamma the learnable scale is stored as an offset from one, so a freshly
//! initialised norm is the identity affine map.

use candle_core::{DType, Device, Result, Tensor, D};

use crate::{
    checks,
    dtypes::MixedPrecision,
    linear::{LinearInit, ParallelLinear, ParallelLinearConfig},
    parallel::{ProcessGroup, TensorParallel},
    projection::{Projection, ProjectionOutput},
    LayerError,
};

/// Configuration for [`LayerNorm`].
#[derive(Debug, Clone, PartialEq)]
pub struct NormConfig {
    pub hidden_size: usize,
    pub epsilon: f64,
    /// Store gamma as `scale - 1`.
    pub zero_centered_gamma: bool,
}

impl NormConfig {
    pub fn new(hidden_size: usize) -> Self {
        Self {
            hidden_size,
            epsilon: 1e-5,
            zero_centered_gamma: false,
        }
    }
}

/// LayerNorm over the last axis with learnable gamma and beta.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    config: NormConfig,
    gamma: Tensor,
    beta: Tensor,
}

impl LayerNorm {
    /// Wraps existing parameters.
    pub fn new(config: NormConfig, gamma: Tensor, beta: Tensor) -> Result<Self> {
        checks::expect_shape("norm.gamma", &gamma, &[config.hidden_size])?;
        checks::expect_shape("norm.beta", &beta, &[config.hidden_size])?;
        checks::expect_same_dtype("norm.gamma", &gamma, "norm.beta", &beta)?;
        Ok(Self { config, gamma, beta })
    }

    /// Fresh parameters: unit scale and zero shift.
    pub fn init(config: NormConfig, device: &Device, dtype: DType) -> Result<Self> {
        let gamma = if config.zero_centered_gamma {
            Tensor::zeros(config.hidden_size, dtype, device)?
        } else {
            Tensor::ones(config.hidden_size, dtype, device)?
        };
        let beta = Tensor::zeros(config.hidden_size, dtype, device)?;
        Self::new(config, gamma, beta)
    }

    pub fn config(&self) -> &NormConfig {
        &self.config
    }

    pub fn forward(&self, hidden: &Tensor) -> Result<Tensor> {
        checks::expect_seq_batch_hidden("norm.input", hidden, self.config.hidden_size)?;
        let policy = MixedPrecision::for_storage(hidden.dtype());
        let hidden_size = self.config.hidden_size as f64;

        let x = policy.promote_for_reduction(hidden)?;
        let mean = (x.sum_keepdim(D::Minus1)? / hidden_size)?;
        let centered = x.broadcast_sub(&mean)?;
        let variance = (centered.sqr()?.sum_keepdim(D::Minus1)? / hidden_size)?;
        let normalized = centered.broadcast_div(&(variance + self.config.epsilon)?.sqrt()?)?;

        let mut gamma = policy.promote_for_reduction(&self.gamma)?;
        if self.config.zero_centered_gamma {
            gamma = (gamma + 1.0)?;
        }
        let beta = policy.promote_for_reduction(&self.beta)?;
        let output = normalized.broadcast_mul(&gamma)?.broadcast_add(&beta)?;
        policy.demote(&output)
    }
}

/// LayerNorm followed by a [`ParallelLinear`], optionally returning the
/// normalised activations for residual routing.
#[derive(Debug, Clone)]
pub struct LayerNormLinear {
    norm: LayerNorm,
    linear: ParallelLinear,
    return_layernorm_output: bool,
}

impl LayerNormLinear {
    pub fn new(
        norm: NormConfig,
        linear: ParallelLinearConfig,
        tp: TensorParallel,
        init: LinearInit,
        return_layernorm_output: bool,
        device: &Device,
        dtype: DType,
    ) -> std::result::Result<Self, LayerError> {
        if norm.hidden_size != linear.input_dim {
            return Err(LayerError::InvalidConfig(format!(
                "norm size {} does not match projection input {}",
                norm.hidden_size, linear.input_dim
            )));
        }
        Ok(Self {
            norm: LayerNorm::init(norm, device, dtype)?,
            linear: ParallelLinear::new(linear, tp, init, device, dtype)?,
            return_layernorm_output,
        })
    }

    pub fn norm(&self) -> &LayerNorm {
        &self.norm
    }

    pub fn linear(&self) -> &ParallelLinear {
        &self.linear
    }

    pub fn set_tensor_parallel_group(
        &mut self,
        group: Option<std::sync::Arc<dyn ProcessGroup>>,
    ) -> std::result::Result<(), LayerError> {
        self.linear.set_tensor_parallel_group(group)
    }
}

impl Projection for LayerNormLinear {
    fn apply(&self, input: &Tensor, is_first_microbatch: Option<bool>) -> Result<ProjectionOutput> {
        let normed = self.norm.forward(input)?;
        let mut projected = self.linear.apply(&normed, is_first_microbatch)?;
        if self.return_layernorm_output {
            projected.norm_output = Some(normed);
        }
        Ok(projected)
    }

    fn input_dim(&self) -> usize {
        self.norm.config().hidden_size
    }

    fn output_dim(&self) -> usize {
        self.linear.output_dim()
    }
}
