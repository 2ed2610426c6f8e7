//! Inference session state for incremental decoding.
//!
//! [`InferenceParams`] owns one key and one value buffer per layer, each
//! shaped `[max_sequence_len, max_batch_size, heads, head_dim]`. Buffers are
//! allocated on first use with the dtype and device of the first key written,
//! and never resized. Every call writes the new slice at the session's
//! sequence/batch offsets and reads back the cumulative prefix.
//!
//! The session is single-writer: callers serialise calls per layer.

use std::collections::HashMap;

use candle_core::Tensor;

use crate::core::AttentionError;

/// Key/value buffers for one layer.
#[derive(Debug, Clone)]
struct LayerMemory {
    key: Tensor,
    value: Tensor,
}

/// Caller-owned state of one incremental decoding session.
#[derive(Debug, Clone)]
pub struct InferenceParams {
    pub max_sequence_len: usize,
    pub max_batch_size: usize,
    pub sequence_len_offset: usize,
    pub batch_size_offset: usize,
    key_value_memory: HashMap<usize, LayerMemory>,
}

impl InferenceParams {
    pub fn new(max_batch_size: usize, max_sequence_len: usize) -> Self {
        Self {
            max_sequence_len,
            max_batch_size,
            sequence_len_offset: 0,
            batch_size_offset: 0,
            key_value_memory: HashMap::new(),
        }
    }

    /// Whether buffers exist for `layer_number`.
    pub fn has_layer(&self, layer_number: usize) -> bool {
        self.key_value_memory.contains_key(&layer_number)
    }

    pub fn num_layers(&self) -> usize {
        self.key_value_memory.len()
    }

    /// Cached key and value buffers of a layer.
    pub fn buffers(&self, layer_number: usize) -> Option<(&Tensor, &Tensor)> {
        self.key_value_memory
            .get(&layer_number)
            .map(|memory| (&memory.key, &memory.value))
    }

    /// Moves the write position forward after a decoding step.
    pub fn advance(&mut self, tokens: usize) {
        self.sequence_len_offset += tokens;
    }

    /// Rewinds both offsets for a new prompt; buffers are kept.
    pub fn reset(&mut self) {
        self.sequence_len_offset = 0;
        self.batch_size_offset = 0;
    }

    /// Writes `key`/`value` (`[s, b, np, hn]`) at the current offsets and
    /// returns the cached prefix `[0..offset + s, batch_offset..batch_offset + b]`.
    ///
    /// Bounds are checked before anything is allocated or written.
    pub fn update(
        &mut self,
        layer_number: usize,
        key: &Tensor,
        value: &Tensor,
    ) -> Result<(Tensor, Tensor), AttentionError> {
        let (s, b, np, hn) = key.dims4().map_err(|_| AttentionError::InvalidShape {
            context: format!("cached key must be [s, b, np, hn], got {:?}", key.dims()),
        })?;
        if value.dims() != key.dims() || value.dtype() != key.dtype() {
            return Err(AttentionError::InvalidShape {
                context: format!(
                    "cached value {:?} does not match key {:?}",
                    value.dims(),
                    key.dims()
                ),
            });
        }
        let batch_end = self.batch_size_offset + b;
        if batch_end > self.max_batch_size {
            return Err(AttentionError::CacheOverflow {
                axis: "batch",
                end: batch_end,
                capacity: self.max_batch_size,
            });
        }
        let sequence_end = self.sequence_len_offset + s;
        if sequence_end > self.max_sequence_len {
            return Err(AttentionError::CacheOverflow {
                axis: "sequence",
                end: sequence_end,
                capacity: self.max_sequence_len,
            });
        }
        let memory = match self.key_value_memory.get(&layer_number) {
            Some(memory) => {
                let (_, _, cached_np, cached_hn) = memory.key.dims4()?;
                if (cached_np, cached_hn) != (np, hn) || memory.key.dtype() != key.dtype() {
                    return Err(AttentionError::InvalidShape {
                        context: format!(
                            "layer {layer_number} cache holds [.., .., {cached_np}, {cached_hn}] {:?}, got {:?} {:?}",
                            memory.key.dtype(),
                            key.dims(),
                            key.dtype()
                        ),
                    });
                }
                if !memory.key.device().same_device(key.device()) {
                    return Err(AttentionError::InvalidShape {
                        context: format!(
                            "layer {layer_number} cache lives on {:?}, got a key on {:?}",
                            memory.key.device(),
                            key.device()
                        ),
                    });
                }
                memory.clone()
            }
            None => {
                let shape = (self.max_sequence_len, self.max_batch_size, np, hn);
                log::info!(
                    "kv_cache allocate layer={layer_number} shape={shape:?} dtype={:?}",
                    key.dtype()
                );
                LayerMemory {
                    key: Tensor::zeros(shape, key.dtype(), key.device())?,
                    value: Tensor::zeros(shape, key.dtype(), key.device())?,
                }
            }
        };

        let ranges = [
            self.sequence_len_offset..sequence_end,
            self.batch_size_offset..batch_end,
            0..np,
            0..hn,
        ];
        let written = LayerMemory {
            key: memory.key.slice_assign(&ranges, &key.contiguous()?)?,
            value: memory.value.slice_assign(&ranges, &value.contiguous()?)?,
        };
        let prefix = |t: &Tensor| -> candle_core::Result<Tensor> {
            t.narrow(0, 0, sequence_end)?
                .narrow(1, self.batch_size_offset, b)?
                .contiguous()
        };
        let cached = (prefix(&written.key)?, prefix(&written.value)?);
        log::trace!(
            "kv_cache layer={layer_number} wrote {s} token(s) at {} (batch {}..{batch_end}), prefix {sequence_end}",
            self.sequence_len_offset,
            self.batch_size_offset
        );
        self.key_value_memory.insert(layer_number, written);
        Ok(cached)
    }
}
