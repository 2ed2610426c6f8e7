//! Dot-product attention for the fused transformer layer.
//!
//! Inputs follow the `[seq, batch, heads_per_partition, head_dim]` layout and
//! the context comes back as `[seq, batch, heads_per_partition * head_dim]`.
//! Two implementations share the [`CoreAttention`] interface:
//!
//! * [`ReferenceAttention`] materialises the score matrix, accepts any mask
//!   and float dtype, and is always available.
//! * [`FastAttention`] packs the batch into variable-length sequences and hands
//!   them to a [`FlashKernel`]; it only accepts causal, unmasked, half-precision
//!   calls on a device the kernel supports.
//!
//! [`DotProductAttention`] picks between them, optionally recording the call on
//! a [`CheckpointTape`] for recompute-on-backward. [`InferenceParams`] holds the
//! per-layer key/value buffers of an incremental decoding session.
//!
//! Masks are `U8` tensors where a nonzero entry suppresses a key.

pub mod checkpoint;
pub mod core;
pub mod dispatch;
pub mod fast;
pub mod kv_cache;
pub mod masks;
pub mod reference;

pub use checkpoint::{checkpoint, CheckpointFn, CheckpointTape};
pub use core::{AttentionError, AttnMaskType, Config, CoreAttention, DropoutState};
pub use dispatch::{Capability, DotProductAttention};
pub use fast::{BlockwiseKernel, FastAttention, FlashKernel};
pub use kv_cache::InferenceParams;
pub use reference::ReferenceAttention;
