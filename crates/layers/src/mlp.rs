//! LayerNorm + two-layer GELU MLP used as the feed-forward sub-block.
//!
//! `fc1` is column-parallel (`hidden -> ffn_hidden / tp`) and `fc2` is
//! row-parallel (`ffn_hidden / tp -> hidden`), so the only collective on the
//! path is the reduction at the end of `fc2`. The `fc2` bias can be returned
//! unapplied for bias-dropout-add fusion in the caller.

use candle_core::{DType, Device, Result, Tensor};

use crate::{
    linear::{LinearInit, ParallelLinear, ParallelLinearConfig},
    norm::{LayerNorm, NormConfig},
    parallel::{ParallelMode, ProcessGroup, TensorParallel},
    projection::{Projection, ProjectionOutput},
    LayerError,
};

/// Configuration for [`LayerNormMlp`].
#[derive(Debug, Clone, PartialEq)]
pub struct MlpConfig {
    pub hidden_size: usize,
    pub ffn_hidden_size: usize,
    pub epsilon: f64,
    pub zero_centered_gamma: bool,
    pub bias: bool,
    pub return_bias: bool,
    pub return_layernorm_output: bool,
}

impl MlpConfig {
    pub fn new(hidden_size: usize, ffn_hidden_size: usize) -> Self {
        Self {
            hidden_size,
            ffn_hidden_size,
            epsilon: 1e-5,
            zero_centered_gamma: false,
            bias: true,
            return_bias: true,
            return_layernorm_output: false,
        }
    }
}

/// Feed-forward block: `fc2(gelu(fc1(norm(x))))`.
#[derive(Debug, Clone)]
pub struct LayerNormMlp {
    norm: LayerNorm,
    fc1: ParallelLinear,
    fc2: ParallelLinear,
    return_layernorm_output: bool,
}

impl LayerNormMlp {
    /// `init` draws `fc1`, `output_init` draws `fc2`.
    pub fn new(
        config: &MlpConfig,
        tp: TensorParallel,
        init: LinearInit,
        output_init: LinearInit,
        device: &Device,
        dtype: DType,
    ) -> std::result::Result<Self, LayerError> {
        let mut norm = NormConfig::new(config.hidden_size);
        norm.epsilon = config.epsilon;
        norm.zero_centered_gamma = config.zero_centered_gamma;

        let fc1 = ParallelLinear::new(
            ParallelLinearConfig::new(config.hidden_size, config.ffn_hidden_size)
                .with_bias(config.bias)
                .with_mode(Some(ParallelMode::Column)),
            tp.clone(),
            init,
            device,
            dtype,
        )?;
        let fc2 = ParallelLinear::new(
            ParallelLinearConfig::new(config.ffn_hidden_size, config.hidden_size)
                .with_bias(config.bias)
                .with_return_bias(config.return_bias)
                .with_mode(Some(ParallelMode::Row)),
            tp,
            output_init,
            device,
            dtype,
        )?;
        Ok(Self {
            norm: LayerNorm::init(norm, device, dtype)?,
            fc1,
            fc2,
            return_layernorm_output: config.return_layernorm_output,
        })
    }

    pub fn set_tensor_parallel_group(
        &mut self,
        group: Option<std::sync::Arc<dyn ProcessGroup>>,
    ) -> std::result::Result<(), LayerError> {
        self.fc1.set_tensor_parallel_group(group.clone())?;
        self.fc2.set_tensor_parallel_group(group)
    }
}

impl Projection for LayerNormMlp {
    fn apply(&self, input: &Tensor, is_first_microbatch: Option<bool>) -> Result<ProjectionOutput> {
        let normed = self.norm.forward(input)?;
        let hidden = self.fc1.apply(&normed, is_first_microbatch)?.output.gelu()?;
        let mut output = self.fc2.apply(&hidden, is_first_microbatch)?;
        if self.return_layernorm_output {
            output.norm_output = Some(normed);
        }
        Ok(output)
    }

    fn input_dim(&self) -> usize {
        self.norm.config().hidden_size
    }

    fn output_dim(&self) -> usize {
        self.fc2.output_dim()
    }
}
