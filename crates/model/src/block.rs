//! Transformer layer: self-attention, optional cross-attention and MLP, each
//! joined to the residual stream by a bias-dropout-add.

use std::sync::Arc;

use attention::{AttnMaskType, InferenceParams};
use candle_core::{Device, Tensor};
use layers::mlp::{LayerNormMlp, MlpConfig};
use layers::norm::{LayerNorm, NormConfig};
use layers::random::{self, DEFAULT_STREAM, MODEL_PARALLEL_STREAM};
use layers::residual::{BiasDropoutAdd, StochasticDepth};
use layers::{checks, Lcg64, ProcessGroup, Projection, RngStateTracker, TensorParallel};

use crate::config::{AttnType, LayerType, TransformerLayerConfig};
use crate::multi_head::{check_mask, ForwardOptions, MultiHeadAttention, MultiHeadAttentionOptions};
use crate::TransformerError;

/// One transformer layer over a tensor-parallel partition.
///
/// The residual of each sub-block is the sub-block input, or the LayerNorm
/// output of that sub-block when `apply_residual_connection_post_layernorm`
/// is set. With `output_layernorm` the self-attention block skips its input
/// norm and a LayerNorm is applied to the layer output instead.
#[derive(Debug, Clone)]
pub struct TransformerLayer {
    config: TransformerLayerConfig,
    tp: TensorParallel,
    self_attention: MultiHeadAttention,
    inter_attention: Option<MultiHeadAttention>,
    layernorm_mlp: LayerNormMlp,
    layernorm: Option<LayerNorm>,
    bias_dropout_add: BiasDropoutAdd,
    drop_path: Option<StochasticDepth>,
    tracker: Arc<RngStateTracker>,
}

impl TransformerLayer {
    /// Builds a layer with fresh parameters on `device`.
    ///
    /// `group` overrides `config.tp_size` with its world size. Fails when the
    /// hidden size or head count does not divide across the partition.
    pub fn new(
        config: TransformerLayerConfig,
        group: Option<Arc<dyn ProcessGroup>>,
        tracker: Arc<RngStateTracker>,
        device: &Device,
    ) -> Result<Self, TransformerError> {
        if config.fuse_wgrad_accumulation && !config.fuse_qkv_params {
            return Err(TransformerError::FusedWgradRequiresFusedQkv);
        }
        config.validate()?;
        let tp = TensorParallel::new(group, config.tp_size, config.sequence_parallel);
        tp.partition("hidden_size", config.hidden_size)?;

        let post_layernorm_residual = config.apply_residual_connection_post_layernorm;
        let self_attention = MultiHeadAttention::new(
            &config,
            MultiHeadAttentionOptions {
                attention_type: AttnType::SelfAttention,
                attn_mask_type: config.self_attn_mask_type,
                input_layernorm: !config.output_layernorm,
                return_layernorm_output: post_layernorm_residual,
            },
            tp.clone(),
            tracker.clone(),
            device,
        )?;
        let inter_attention = match config.layer_type {
            LayerType::Encoder => None,
            LayerType::Decoder => Some(MultiHeadAttention::new(
                &config,
                MultiHeadAttentionOptions {
                    attention_type: AttnType::Cross,
                    attn_mask_type: AttnMaskType::Padding,
                    input_layernorm: true,
                    return_layernorm_output: post_layernorm_residual,
                },
                tp.clone(),
                tracker.clone(),
                device,
            )?),
        };

        let layernorm_mlp = LayerNormMlp::new(
            &MlpConfig {
                hidden_size: config.hidden_size,
                ffn_hidden_size: config.ffn_hidden_size,
                epsilon: config.layernorm_epsilon,
                zero_centered_gamma: config.zero_centered_gamma,
                bias: true,
                return_bias: true,
                return_layernorm_output: post_layernorm_residual,
            },
            tp.clone(),
            config.init(),
            config.output_init(),
            device,
            config.params_dtype(),
        )?;
        let layernorm = if config.output_layernorm {
            Some(LayerNorm::init(
                NormConfig {
                    hidden_size: config.hidden_size,
                    epsilon: config.layernorm_epsilon,
                    zero_centered_gamma: config.zero_centered_gamma,
                },
                device,
                config.params_dtype(),
            )?)
        } else {
            None
        };

        let bias_dropout_add = BiasDropoutAdd::new(config.hidden_dropout, config.features.bias_dropout_fusion)?;
        let drop_path = if config.drop_path_rate > 0.0 {
            Some(StochasticDepth::new(config.drop_path_rate)?)
        } else {
            None
        };

        log::info!(
            "transformer layer {:?}: {:?} hidden={} heads={}/{} attention={:?} bias_dropout_add={:?} drop_path={}",
            config.layer_number,
            config.layer_type,
            config.hidden_size,
            self_attention.heads_per_partition(),
            config.num_attention_heads,
            self_attention.core_attention().capability(),
            bias_dropout_add.kind(),
            config.drop_path_rate
        );

        Ok(Self {
            config,
            tp,
            self_attention,
            inter_attention,
            layernorm_mlp,
            layernorm,
            bias_dropout_add,
            drop_path,
            tracker,
        })
    }

    pub fn config(&self) -> &TransformerLayerConfig {
        &self.config
    }

    pub fn self_attention(&self) -> &MultiHeadAttention {
        &self.self_attention
    }

    pub fn inter_attention(&self) -> Option<&MultiHeadAttention> {
        self.inter_attention.as_ref()
    }

    pub fn is_training(&self) -> bool {
        self.bias_dropout_add.is_training()
    }

    /// Switches every dropout site between training and evaluation.
    pub fn set_training(&self, training: bool) {
        self.self_attention.set_training(training);
        if let Some(inter) = &self.inter_attention {
            inter.set_training(training);
        }
        self.bias_dropout_add.set_training(training);
        if let Some(drop_path) = &self.drop_path {
            drop_path.set_training(training);
        }
    }

    /// Installs the process group on every partitioned sub-module.
    pub fn set_tensor_parallel_group(&mut self, group: Option<Arc<dyn ProcessGroup>>) -> Result<(), TransformerError> {
        self.tp.set_group(group.clone())?;
        self.self_attention.set_tensor_parallel_group(group.clone())?;
        if let Some(inter) = &mut self.inter_attention {
            inter.set_tensor_parallel_group(group.clone())?;
        }
        self.layernorm_mlp.set_tensor_parallel_group(group)?;
        Ok(())
    }

    /// Random stream of the hidden dropout sites.
    fn rng_stream(&self) -> &'static str {
        if self.tp.sequence_parallel() {
            MODEL_PARALLEL_STREAM
        } else {
            DEFAULT_STREAM
        }
    }

    /// Runs the layer on `hidden` (`[sq, b, h]`).
    ///
    /// Decoder layers attend to `encoder_output` (`[sk, b, h]`) under
    /// `enc_dec_attn_mask`. `inference_params` only applies to self-attention.
    pub fn forward(
        &self,
        hidden: &Tensor,
        attention_mask: Option<&Tensor>,
        encoder_output: Option<&Tensor>,
        enc_dec_attn_mask: Option<&Tensor>,
        options: ForwardOptions<'_>,
        inference_params: Option<&mut InferenceParams>,
    ) -> Result<Tensor, TransformerError> {
        let hidden = hidden.contiguous()?;
        checks::expect_seq_batch_hidden("transformer_layer.input", &hidden, self.config.hidden_size)?;
        for mask in [attention_mask, enc_dec_attn_mask].into_iter().flatten() {
            check_mask(mask)?;
        }
        let post_layernorm_residual = self.config.apply_residual_connection_post_layernorm;

        let attention = self
            .self_attention
            .forward(&hidden, attention_mask, None, options, inference_params)?;
        let residual = if post_layernorm_residual && !self.config.output_layernorm {
            attention.layernorm_output.ok_or(TransformerError::MissingLayerNormOutput {
                sublayer: "self-attention",
            })?
        } else {
            hidden
        };
        let mut bda_output = self.residual_add(&attention.output, attention.bias.as_ref(), &residual, true)?;

        if let Some(inter) = &self.inter_attention {
            let cross = inter.forward(&bda_output, enc_dec_attn_mask, encoder_output, options, None)?;
            let residual = if post_layernorm_residual {
                cross.layernorm_output.ok_or(TransformerError::MissingLayerNormOutput {
                    sublayer: "cross-attention",
                })?
            } else {
                bda_output
            };
            bda_output = self.residual_add(&cross.output, cross.bias.as_ref(), &residual, false)?;
        }

        let mlp = self.layernorm_mlp.apply(&bda_output, options.is_first_microbatch)?;
        let residual = if post_layernorm_residual {
            mlp.norm_output
                .ok_or(TransformerError::MissingLayerNormOutput { sublayer: "mlp" })?
        } else {
            bda_output
        };
        let output = self.residual_add(&mlp.output, mlp.bias.as_ref(), &residual, true)?;

        match &self.layernorm {
            Some(norm) => Ok(norm.forward(&output)?),
            None => Ok(output),
        }
    }

    /// `residual + dropout(x + bias)`, with the branch passed through
    /// stochastic depth when configured and `drop_path_applies`.
    fn residual_add(
        &self,
        x: &Tensor,
        bias: Option<&Tensor>,
        residual: &Tensor,
        drop_path_applies: bool,
    ) -> Result<Tensor, TransformerError> {
        self.tracker.fork(self.rng_stream(), |rng: &mut Lcg64| -> Result<Tensor, TransformerError> {
            match &self.drop_path {
                Some(drop_path) if drop_path_applies => {
                    let x = x.to_dtype(residual.dtype())?;
                    let biased = match bias {
                        Some(bias) => x.broadcast_add(&bias.to_dtype(residual.dtype())?)?,
                        None => x,
                    };
                    let p = if self.is_training() {
                        self.bias_dropout_add.probability()
                    } else {
                        0.0
                    };
                    let dropped = random::dropout(&biased, p, rng)?;
                    Ok(residual.add(&drop_path.forward(&dropped, rng)?)?)
                }
                _ => Ok(self.bias_dropout_add.forward(x, bias, residual, rng)?),
            }
        })
    }
}
