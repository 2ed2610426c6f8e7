//! Transformer layer assembled from the `layers` and `attention` crates.
//!
//! [`TransformerLayer`] runs self-attention, an optional cross-attention block
//! and a LayerNorm MLP, joining each to the residual stream with a
//! bias-dropout-add. Activations are `(seq, batch, hidden)`.

pub mod block;
pub mod config;
pub mod multi_head;

use attention::AttentionError;
use layers::LayerError;
use thiserror::Error;

pub use block::TransformerLayer;
pub use config::{AttnType, FeatureToggles, LayerType, Precision, TransformerLayerConfig};
pub use multi_head::{AttentionOutput, ForwardOptions, MultiHeadAttention, MultiHeadAttentionOptions};

/// Errors raised while building or running a transformer layer.
#[derive(Debug, Error)]
pub enum TransformerError {
    #[error(transparent)]
    Attention(#[from] AttentionError),
    #[error(transparent)]
    Layer(#[from] LayerError),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
    #[error("layer type `{0}` is not supported")]
    UnsupportedLayerType(String),
    #[error("attention type `{0}` is not supported")]
    UnsupportedAttentionType(String),
    #[error("gradient accumulation fusion requires a single fused QKV parameter")]
    FusedWgradRequiresFusedQkv,
    #[error("inference KV caching requires a layer number")]
    MissingLayerNumber,
    #[error("invalid attention mask: {0}")]
    InvalidMask(String),
    #[error("{sublayer} did not return its LayerNorm output for the residual")]
    MissingLayerNormOutput { sublayer: &'static str },
    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ConfigFormat(String),
}

impl From<serde_json::Error> for TransformerError {
    fn from(err: serde_json::Error) -> Self {
        TransformerError::ConfigFormat(err.to_string())
    }
}

impl From<toml::de::Error> for TransformerError {
    fn from(err: toml::de::Error) -> Self {
        TransformerError::ConfigFormat(err.to_string())
    }
}
