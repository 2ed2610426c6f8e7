//! Multi-head attention block: QKV projection, core attention, output projection.
//!
//! Self-attention projects `[sq, b, h]` to `[sq, b, np * 3 * hn]` and views it
//! as `[sq, b, np, 3 * hn]` before splitting the last axis into query, key
//! and value. Cross-attention projects keys and values from the encoder output
//! the same way with two slices, and the query from the block input.

use std::sync::Arc;

use attention::masks::MASK_DTYPE;
use attention::{AttentionError, AttnMaskType, CheckpointTape, DotProductAttention, InferenceParams};
use candle_core::{Device, Tensor};
use layers::linear::{LinearInit, ParallelLinear, ParallelLinearConfig};
use layers::norm::{LayerNormLinear, NormConfig};
use layers::{LayerError, ParallelMode, ProcessGroup, Projection, ProjectionOutput, RngStateTracker, TensorParallel};

use crate::config::{AttnType, TransformerLayerConfig};
use crate::TransformerError;

/// Per-call switches shared by every sub-block of a layer.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardOptions<'a> {
    /// Whether this is the first microbatch of a minibatch, if known.
    pub is_first_microbatch: Option<bool>,
    /// Record core attention here for recomputation on backward.
    pub checkpoint: Option<&'a CheckpointTape>,
}

/// How one attention block of a layer is wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultiHeadAttentionOptions {
    pub attention_type: AttnType,
    pub attn_mask_type: AttnMaskType,
    /// Normalise the block input before projecting the query (and QKV).
    pub input_layernorm: bool,
    /// Hand the normalised input back for post-LayerNorm residuals.
    pub return_layernorm_output: bool,
}

/// Result of one attention block.
#[derive(Debug, Clone)]
pub struct AttentionOutput {
    /// `[sq, b, h]`, before the output bias.
    pub output: Tensor,
    pub bias: Option<Tensor>,
    pub layernorm_output: Option<Tensor>,
}

#[derive(Debug, Clone)]
enum InputProjection {
    Plain(ParallelLinear),
    Normed(LayerNormLinear),
}

impl InputProjection {
    #[allow(clippy::too_many_arguments)]
    fn new(
        norm: NormConfig,
        linear: ParallelLinearConfig,
        input_layernorm: bool,
        return_layernorm_output: bool,
        tp: TensorParallel,
        init: LinearInit,
        device: &Device,
        dtype: candle_core::DType,
    ) -> Result<Self, LayerError> {
        if input_layernorm {
            LayerNormLinear::new(norm, linear, tp, init, return_layernorm_output, device, dtype).map(Self::Normed)
        } else {
            ParallelLinear::new(linear, tp, init, device, dtype).map(Self::Plain)
        }
    }

    fn apply(&self, input: &Tensor, is_first_microbatch: Option<bool>) -> candle_core::Result<ProjectionOutput> {
        match self {
            Self::Plain(linear) => linear.apply(input, is_first_microbatch),
            Self::Normed(linear) => linear.apply(input, is_first_microbatch),
        }
    }

    fn set_tensor_parallel_group(&mut self, group: Option<Arc<dyn ProcessGroup>>) -> Result<(), LayerError> {
        match self {
            Self::Plain(linear) => linear.set_tensor_parallel_group(group),
            Self::Normed(linear) => linear.set_tensor_parallel_group(group),
        }
    }
}

#[derive(Debug, Clone)]
enum Projections {
    SelfAttention {
        qkv: InputProjection,
    },
    Cross {
        query: InputProjection,
        key_value: ParallelLinear,
    },
}

/// One self- or cross-attention block over a tensor-parallel head partition.
#[derive(Debug, Clone)]
pub struct MultiHeadAttention {
    options: MultiHeadAttentionOptions,
    layer_number: Option<usize>,
    heads_per_partition: usize,
    head_dim: usize,
    projections: Projections,
    core_attention: DotProductAttention,
    proj: ParallelLinear,
}

impl MultiHeadAttention {
    pub fn new(
        config: &TransformerLayerConfig,
        options: MultiHeadAttentionOptions,
        tp: TensorParallel,
        tracker: Arc<RngStateTracker>,
        device: &Device,
    ) -> Result<Self, TransformerError> {
        if config.fuse_wgrad_accumulation && !config.fuse_qkv_params {
            return Err(TransformerError::FusedWgradRequiresFusedQkv);
        }
        let head_dim = config.head_dim();
        let projection_size = config.projection_size();
        let heads_per_partition = tp.partition("num_attention_heads", config.num_attention_heads)?;
        tp.partition("projection_size", projection_size)?;

        let dtype = config.params_dtype();
        let column = config.set_parallel_mode.then_some(ParallelMode::Column);
        let norm = NormConfig {
            hidden_size: config.hidden_size,
            epsilon: config.layernorm_epsilon,
            zero_centered_gamma: config.zero_centered_gamma,
        };
        let split = |names: &[&'static str]| -> Vec<&'static str> {
            if config.fuse_qkv_params {
                Vec::new()
            } else {
                names.to_vec()
            }
        };

        let projections = match options.attention_type {
            AttnType::SelfAttention => Projections::SelfAttention {
                qkv: InputProjection::new(
                    norm,
                    ParallelLinearConfig::new(config.hidden_size, 3 * projection_size)
                        .with_mode(column)
                        .with_parameter_split(split(&["query_", "key_", "value_"])),
                    options.input_layernorm,
                    options.return_layernorm_output,
                    tp.clone(),
                    config.init(),
                    device,
                    dtype,
                )?,
            },
            AttnType::Cross => Projections::Cross {
                query: InputProjection::new(
                    norm,
                    ParallelLinearConfig::new(config.hidden_size, projection_size).with_mode(column),
                    options.input_layernorm,
                    options.return_layernorm_output,
                    tp.clone(),
                    config.init(),
                    device,
                    dtype,
                )?,
                key_value: ParallelLinear::new(
                    ParallelLinearConfig::new(config.hidden_size, 2 * projection_size)
                        .with_mode(column)
                        .with_parameter_split(split(&["key_", "value_"])),
                    tp.clone(),
                    config.init(),
                    device,
                    dtype,
                )?,
            },
        };

        let core_attention = DotProductAttention::new(
            config.attention_config(options.attn_mask_type),
            tp.clone(),
            tracker,
        )?;
        let proj = ParallelLinear::new(
            ParallelLinearConfig::new(projection_size, config.hidden_size)
                .with_return_bias(true)
                .with_mode(config.set_parallel_mode.then_some(ParallelMode::Row)),
            tp,
            config.output_init(),
            device,
            dtype,
        )?;

        Ok(Self {
            options,
            layer_number: config.layer_number,
            heads_per_partition,
            head_dim,
            projections,
            core_attention,
            proj,
        })
    }

    pub fn options(&self) -> &MultiHeadAttentionOptions {
        &self.options
    }

    pub fn layer_number(&self) -> Option<usize> {
        self.layer_number
    }

    pub fn heads_per_partition(&self) -> usize {
        self.heads_per_partition
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    pub fn core_attention(&self) -> &DotProductAttention {
        &self.core_attention
    }

    pub fn set_training(&self, training: bool) {
        self.core_attention.set_training(training);
    }

    pub fn set_tensor_parallel_group(&mut self, group: Option<Arc<dyn ProcessGroup>>) -> Result<(), TransformerError> {
        match &mut self.projections {
            Projections::SelfAttention { qkv } => qkv.set_tensor_parallel_group(group.clone())?,
            Projections::Cross { query, key_value } => {
                query.set_tensor_parallel_group(group.clone())?;
                key_value.set_tensor_parallel_group(group.clone())?;
            }
        }
        self.proj.set_tensor_parallel_group(group.clone())?;
        self.core_attention.set_tensor_parallel_group(group)?;
        Ok(())
    }

    /// Runs the block on `hidden` (`[sq, b, h]`).
    ///
    /// Cross-attention needs `encoder_output` (`[sk, b, h]`). With
    /// `inference_params`, the new keys and values are written to the
    /// session's buffers for this layer and attention runs over the cached
    /// prefix.
    pub fn forward(
        &self,
        hidden: &Tensor,
        attention_mask: Option<&Tensor>,
        encoder_output: Option<&Tensor>,
        options: ForwardOptions<'_>,
        inference_params: Option<&mut InferenceParams>,
    ) -> Result<AttentionOutput, TransformerError> {
        if let Some(mask) = attention_mask {
            check_mask(mask)?;
        }
        if inference_params.is_some() && self.layer_number.is_none() {
            return Err(TransformerError::MissingLayerNumber);
        }
        let np = self.heads_per_partition;
        let hn = self.head_dim;

        let (query, key, value, layernorm_output) = match &self.projections {
            Projections::SelfAttention { qkv } => {
                let mixed = qkv.apply(hidden, options.is_first_microbatch)?;
                let (sq, b, _) = mixed.output.dims3()?;
                let [q, k, v] = split_last_dim(&mixed.output.reshape((sq, b, np, 3 * hn))?, hn)?;
                (q, k, v, mixed.norm_output)
            }
            Projections::Cross { query, key_value } => {
                let encoder_output = encoder_output.ok_or_else(|| AttentionError::InvalidShape {
                    context: "cross-attention requires an encoder output".into(),
                })?;
                let mixed = key_value.apply(encoder_output, options.is_first_microbatch)?.output;
                let (sk, b, _) = mixed.dims3()?;
                let [k, v] = split_last_dim(&mixed.reshape((sk, b, np, 2 * hn))?, hn)?;

                let projected = query.apply(hidden, options.is_first_microbatch)?;
                let (sq, b, _) = projected.output.dims3()?;
                let q = projected.output.reshape((sq, b, np, hn))?;
                (q, k, v, projected.norm_output)
            }
        };

        let (key, value) = match (inference_params, self.layer_number) {
            (Some(params), Some(layer)) => params.update(layer, &key, &value)?,
            _ => (key, value),
        };

        let context = self
            .core_attention
            .forward(&query, &key, &value, attention_mask, options.checkpoint)?;
        let projected = self.proj.apply(&context, options.is_first_microbatch)?;
        let layernorm_output = if self.options.input_layernorm && self.options.return_layernorm_output {
            layernorm_output
        } else {
            None
        };
        Ok(AttentionOutput {
            output: projected.output,
            bias: projected.bias,
            layernorm_output,
        })
    }
}

pub(crate) fn check_mask(mask: &Tensor) -> Result<(), TransformerError> {
    if mask.dtype() != MASK_DTYPE {
        return Err(TransformerError::InvalidMask(format!(
            "expected a boolean {MASK_DTYPE:?} mask, got {:?}",
            mask.dtype()
        )));
    }
    Ok(())
}

/// Splits the last axis into `N` slices of `size`.
fn split_last_dim<const N: usize>(tensor: &Tensor, size: usize) -> candle_core::Result<[Tensor; N]> {
    let dim = tensor.rank() - 1;
    let parts = (0..N)
        .map(|i| tensor.narrow(dim, i * size, size))
        .collect::<candle_core::Result<Vec<_>>>()?;
    parts
        .try_into()
        .map_err(|_| candle_core::Error::Msg(format!("cannot split last axis into {N} parts")))
}
