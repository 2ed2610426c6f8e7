//! Error types emitted by attention implementations.

use layers::LayerError;

/// Attention-specific error category.
///
/// Every variant except [`AttentionError::Backend`] is a contract violation
/// raised before any state is touched.
#[derive(Debug)]
pub enum AttentionError {
    /// The supplied tensor shapes do not align with the documented contract.
    InvalidShape { context: String },
    /// The kernel does not support the requested data type.
    UnsupportedDType { requested: String },
    /// Unknown attention mask kind.
    UnsupportedMaskType { requested: String },
    /// The fast path was invoked outside its supported envelope.
    FastPathPrecondition { reason: String },
    /// The fast-attention kernel is compiled out or cannot run on this host.
    MissingKernel { kernel: &'static str, reason: String },
    /// A KV-cache write would land outside the pre-allocated buffers.
    CacheOverflow {
        axis: &'static str,
        end: usize,
        capacity: usize,
    },
    /// Inconsistent attention configuration.
    InvalidConfig { message: String },
    /// A backend-specific failure propagated to the caller.
    Backend { message: String },
}

impl std::fmt::Display for AttentionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttentionError::InvalidShape { context } => {
                write!(f, "invalid tensor shape: {context}")
            }
            AttentionError::UnsupportedDType { requested } => {
                write!(f, "unsupported dtype {requested}")
            }
            AttentionError::UnsupportedMaskType { requested } => {
                write!(f, "mask type `{requested}` is not supported")
            }
            AttentionError::FastPathPrecondition { reason } => {
                write!(f, "fast attention precondition violated: {reason}")
            }
            AttentionError::MissingKernel { kernel, reason } => {
                write!(f, "attention kernel `{kernel}` is unavailable: {reason}")
            }
            AttentionError::CacheOverflow {
                axis,
                end,
                capacity,
            } => write!(
                f,
                "kv cache {axis} overflow: write ends at {end} but only {capacity} slots are allocated"
            ),
            AttentionError::InvalidConfig { message } => {
                write!(f, "invalid attention configuration: {message}")
            }
            AttentionError::Backend { message } => f.write_str(message),
        }
    }
}

impl std::error::Error for AttentionError {}

impl From<candle_core::Error> for AttentionError {
    fn from(err: candle_core::Error) -> Self {
        AttentionError::Backend {
            message: err.to_string(),
        }
    }
}

impl From<LayerError> for AttentionError {
    fn from(err: LayerError) -> Self {
        match err {
            LayerError::Candle(inner) => inner.into(),
            other => AttentionError::InvalidConfig {
                message: other.to_string(),
            },
        }
    }
}
