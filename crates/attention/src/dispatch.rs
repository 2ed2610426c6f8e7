//! Runtime selection between the reference and fast attention paths.
//!
//! Capability is decided once at construction: the fast path is a candidate
//! only when the fast-attention toggle is on, the softmax runs in fp32, the
//! mask kind is causal and query-key layer scaling is off. Each call then
//! re-checks the inputs and falls back to the reference path for that call
//! alone when an explicit mask is supplied, the dtype is not half precision,
//! the device is unsupported or the kernel cannot apply the requested dropout.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use candle_core::Tensor;
use layers::random::{DEFAULT_STREAM, MODEL_PARALLEL_STREAM};
use layers::{ProcessGroup, RngStateTracker, TensorParallel};

use crate::checkpoint::{checkpoint, CheckpointFn, CheckpointTape};
use crate::core::{qkv_dims, AttentionError, AttnMaskType, Config, CoreAttention, DropoutState};
use crate::fast::{default_kernel, FastAttention, FlashKernel};
use crate::reference::ReferenceAttention;

/// Capability state fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// The fast path is used whenever a call stays inside its envelope.
    PrefersFast,
    /// Every call runs the reference path.
    FastUnavailable,
}

/// Dot-product attention over one tensor-parallel head partition.
pub struct DotProductAttention {
    config: Config,
    tp: TensorParallel,
    heads_per_partition: usize,
    reference: Arc<ReferenceAttention>,
    fast: Option<Arc<FastAttention>>,
    tracker: Arc<RngStateTracker>,
    training: AtomicBool,
}

impl Clone for DotProductAttention {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            tp: self.tp.clone(),
            heads_per_partition: self.heads_per_partition,
            reference: self.reference.clone(),
            fast: self.fast.clone(),
            tracker: self.tracker.clone(),
            training: AtomicBool::new(self.is_training()),
        }
    }
}

impl fmt::Debug for DotProductAttention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DotProductAttention")
            .field("capability", &self.capability())
            .field("heads_per_partition", &self.heads_per_partition)
            .field("kernel", &self.fast_kernel_name())
            .field("training", &self.is_training())
            .finish()
    }
}

impl DotProductAttention {
    /// Builds the dispatcher with the default fast kernel.
    pub fn new(config: Config, tp: TensorParallel, tracker: Arc<RngStateTracker>) -> Result<Self, AttentionError> {
        Self::with_kernel(config, tp, tracker, default_kernel())
    }

    /// Builds the dispatcher around a specific fast kernel.
    ///
    /// Fails when the head count does not divide across the partition or when
    /// the fast path is selected but the kernel's runtime is missing.
    pub fn with_kernel(
        config: Config,
        tp: TensorParallel,
        tracker: Arc<RngStateTracker>,
        kernel: Arc<dyn FlashKernel>,
    ) -> Result<Self, AttentionError> {
        let config = config.resolve()?;
        let heads_per_partition = tp.partition("num_attention_heads", config.num_attention_heads)?;
        let fast_candidate = config.use_fast_attention
            && config.attention_softmax_in_fp32
            && config.attn_mask_type == AttnMaskType::Causal
            && !config.apply_query_key_layer_scaling;
        let fast = if fast_candidate {
            Some(Arc::new(FastAttention::new(&config, kernel)?))
        } else {
            None
        };
        let dispatcher = Self {
            reference: Arc::new(ReferenceAttention::new(&config)),
            fast,
            config,
            tp,
            heads_per_partition,
            tracker,
            training: AtomicBool::new(true),
        };
        log::info!(
            "attention::dispatch capability={:?} kernel={} heads_per_partition={} mask={}",
            dispatcher.capability(),
            dispatcher.fast_kernel_name().unwrap_or("none"),
            heads_per_partition,
            dispatcher.config.attn_mask_type
        );
        Ok(dispatcher)
    }

    pub fn capability(&self) -> Capability {
        match self.fast {
            Some(_) => Capability::PrefersFast,
            None => Capability::FastUnavailable,
        }
    }

    pub fn prefers_fast(&self) -> bool {
        self.capability() == Capability::PrefersFast
    }

    pub fn fast_kernel_name(&self) -> Option<&'static str> {
        self.fast.as_ref().map(|fast| fast.kernel_name())
    }

    /// The resolved configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn heads_per_partition(&self) -> usize {
        self.heads_per_partition
    }

    pub fn rng_tracker(&self) -> &Arc<RngStateTracker> {
        &self.tracker
    }

    pub fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::Relaxed);
    }

    pub fn is_training(&self) -> bool {
        self.training.load(Ordering::Relaxed)
    }

    /// Swaps the process group; its world size must match the partition count.
    pub fn set_tensor_parallel_group(&mut self, group: Option<Arc<dyn ProcessGroup>>) -> Result<(), AttentionError> {
        Ok(self.tp.set_group(group)?)
    }

    /// Stream that attention dropout draws from.
    pub fn rng_stream(&self) -> &'static str {
        if self.tp.sequence_parallel() {
            DEFAULT_STREAM
        } else {
            MODEL_PARALLEL_STREAM
        }
    }

    fn dropout_probability(&self) -> f32 {
        if self.is_training() {
            self.config.attention_dropout
        } else {
            0.0
        }
    }

    /// Picks the path for one call.
    fn select(&self, query: &Tensor, mask: Option<&Tensor>, probability: f32) -> Arc<dyn CoreAttention> {
        if let Some(fast) = &self.fast {
            if fast.accepts(query.dtype(), query.device(), mask, probability) {
                return fast.clone();
            }
            log::debug!(
                "attention::dispatch fallback to reference (dtype={:?}, mask={}, dropout={probability})",
                query.dtype(),
                mask.is_some()
            );
        }
        self.reference.clone()
    }

    /// Attention context `[sq, b, np * hn]` for `[s, b, np, hn]` inputs.
    ///
    /// With a `tape`, the call is recorded for recomputation during
    /// [`CheckpointTape::backward`] instead of keeping its intermediates.
    pub fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        mask: Option<&Tensor>,
        tape: Option<&CheckpointTape>,
    ) -> Result<Tensor, AttentionError> {
        let (_, _, _, np, _) = qkv_dims(query, key, value)?;
        if np != self.heads_per_partition {
            return Err(AttentionError::InvalidShape {
                context: format!(
                    "expected {} heads per partition, got {np}",
                    self.heads_per_partition
                ),
            });
        }
        let probability = self.dropout_probability();
        let path = self.select(query, mask, probability);
        let stream = self.rng_stream();

        match tape {
            None => run(path.as_ref(), &self.tracker, stream, query, key, value, mask, probability),
            Some(tape) => {
                log::trace!("attention::dispatch checkpointing {} path", path.name());
                let tracker = self.tracker.clone();
                let mask = mask.cloned();
                let func: CheckpointFn = Arc::new(move |inputs: &[Tensor]| -> Result<Tensor, AttentionError> {
                    let [q, k, v] = inputs else {
                        return Err(AttentionError::InvalidShape {
                            context: format!("checkpointed attention expects 3 inputs, got {}", inputs.len()),
                        });
                    };
                    run(path.as_ref(), &tracker, stream, q, k, v, mask.as_ref(), probability)
                });
                checkpoint(
                    tape,
                    self.tracker.clone(),
                    func,
                    vec![query.clone(), key.clone(), value.clone()],
                )
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run(
    path: &dyn CoreAttention,
    tracker: &RngStateTracker,
    stream: &str,
    query: &Tensor,
    key: &Tensor,
    value: &Tensor,
    mask: Option<&Tensor>,
    probability: f32,
) -> Result<Tensor, AttentionError> {
    tracker.fork(stream, |rng| {
        path.forward(query, key, value, mask, DropoutState { probability, rng })
    })
}
