//! Layer configuration loaded from TOML or JSON.
//!
//! Every field except the three sizes has a default, so a minimal file only
//! names `hidden_size`, `ffn_hidden_size` and `num_attention_heads`.

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use attention::{AttnMaskType, Config as AttentionConfig};
use candle_core::DType;
use layers::linear::{LinearInit, DEFAULT_INIT_STD};
use serde::{Deserialize, Deserializer};

use crate::TransformerError;

/// Whether a layer carries a cross-attention block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LayerType {
    #[default]
    Encoder,
    /// Adds cross-attention over an encoder output after self-attention.
    Decoder,
}

impl FromStr for LayerType {
    type Err = TransformerError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "encoder" => Ok(LayerType::Encoder),
            "decoder" => Ok(LayerType::Decoder),
            other => Err(TransformerError::UnsupportedLayerType(other.to_string())),
        }
    }
}

/// Source of the keys and values of an attention block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttnType {
    #[default]
    SelfAttention,
    Cross,
}

impl FromStr for AttnType {
    type Err = TransformerError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "self" => Ok(AttnType::SelfAttention),
            "cross" => Ok(AttnType::Cross),
            other => Err(TransformerError::UnsupportedAttentionType(other.to_string())),
        }
    }
}

impl fmt::Display for AttnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttnType::SelfAttention => f.write_str("self"),
            AttnType::Cross => f.write_str("cross"),
        }
    }
}

/// Parameter storage precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precision {
    #[default]
    Fp32,
    Fp16,
    Bf16,
}

impl Precision {
    pub fn dtype(self) -> DType {
        match self {
            Precision::Fp32 => DType::F32,
            Precision::Fp16 => DType::F16,
            Precision::Bf16 => DType::BF16,
        }
    }
}

impl FromStr for Precision {
    type Err = TransformerError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "fp32" | "f32" | "float32" => Ok(Precision::Fp32),
            "fp16" | "f16" | "float16" | "half" => Ok(Precision::Fp16),
            "bf16" | "bfloat16" => Ok(Precision::Bf16),
            other => Err(TransformerError::ConfigFormat(format!(
                "unsupported params_dtype '{other}'"
            ))),
        }
    }
}

/// Process-wide kernel toggles, resolved once outside the layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct FeatureToggles {
    #[serde(default = "default_true")]
    pub fast_attention: bool,
    #[serde(default = "default_true")]
    pub bias_dropout_fusion: bool,
}

impl Default for FeatureToggles {
    fn default() -> Self {
        Self {
            fast_attention: true,
            bias_dropout_fusion: true,
        }
    }
}

/// Hyper-parameters of one [`TransformerLayer`](crate::TransformerLayer).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TransformerLayerConfig {
    pub hidden_size: usize,
    pub ffn_hidden_size: usize,
    pub num_attention_heads: usize,
    /// Per-head dimension; `hidden_size / num_attention_heads` when unset.
    #[serde(default)]
    pub kv_channels: Option<usize>,
    #[serde(default = "default_epsilon")]
    pub layernorm_epsilon: f64,
    #[serde(default = "default_dropout")]
    pub hidden_dropout: f32,
    #[serde(default = "default_dropout")]
    pub attention_dropout: f32,
    /// Std of QKV and FC1 weights.
    #[serde(default = "default_init_std")]
    pub init_method_std: f64,
    /// Std of the attention output projection and FC2 weights.
    #[serde(default = "default_init_std")]
    pub output_layer_init_method_std: f64,
    /// 1-based index of the layer in its stack; also the KV-cache key.
    #[serde(default)]
    pub layer_number: Option<usize>,
    #[serde(default, deserialize_with = "from_name")]
    pub self_attn_mask_type: AttnMaskType,
    #[serde(default = "default_tp_size")]
    pub tp_size: usize,
    #[serde(default, deserialize_with = "from_name")]
    pub params_dtype: Precision,
    #[serde(default)]
    pub fuse_wgrad_accumulation: bool,
    #[serde(default)]
    pub apply_query_key_layer_scaling: bool,
    #[serde(default = "default_true")]
    pub attention_softmax_in_fp32: bool,
    #[serde(default)]
    pub sequence_parallel: bool,
    /// Take residuals from the LayerNorm output instead of its input.
    #[serde(default)]
    pub apply_residual_connection_post_layernorm: bool,
    /// Normalise after the final residual add instead of before QKV.
    #[serde(default)]
    pub output_layernorm: bool,
    #[serde(default, deserialize_with = "from_name")]
    pub layer_type: LayerType,
    #[serde(default)]
    pub drop_path_rate: f32,
    /// Column-parallel QKV/FC1 and row-parallel projection/FC2.
    #[serde(default)]
    pub set_parallel_mode: bool,
    #[serde(default)]
    pub fuse_qkv_params: bool,
    #[serde(default)]
    pub zero_centered_gamma: bool,
    #[serde(default)]
    pub features: FeatureToggles,
}

impl TransformerLayerConfig {
    pub fn new(hidden_size: usize, ffn_hidden_size: usize, num_attention_heads: usize) -> Self {
        Self {
            hidden_size,
            ffn_hidden_size,
            num_attention_heads,
            kv_channels: None,
            layernorm_epsilon: default_epsilon(),
            hidden_dropout: default_dropout(),
            attention_dropout: default_dropout(),
            init_method_std: default_init_std(),
            output_layer_init_method_std: default_init_std(),
            layer_number: None,
            self_attn_mask_type: AttnMaskType::Causal,
            tp_size: default_tp_size(),
            params_dtype: Precision::Fp32,
            fuse_wgrad_accumulation: false,
            apply_query_key_layer_scaling: false,
            attention_softmax_in_fp32: true,
            sequence_parallel: false,
            apply_residual_connection_post_layernorm: false,
            output_layernorm: false,
            layer_type: LayerType::Encoder,
            drop_path_rate: 0.0,
            set_parallel_mode: false,
            fuse_qkv_params: false,
            zero_centered_gamma: false,
            features: FeatureToggles::default(),
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TransformerError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config: TransformerLayerConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TransformerError::ConfigFormat(format!(
                    "unsupported configuration extension '{other}'"
                )));
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Per-head dimension.
    pub fn head_dim(&self) -> usize {
        self.kv_channels
            .unwrap_or(self.hidden_size / self.num_attention_heads.max(1))
    }

    /// Width of the concatenated attention heads.
    pub fn projection_size(&self) -> usize {
        self.head_dim() * self.num_attention_heads
    }

    pub fn params_dtype(&self) -> DType {
        self.params_dtype.dtype()
    }

    pub fn init(&self) -> LinearInit {
        LinearInit::Normal {
            std: self.init_method_std,
        }
    }

    pub fn output_init(&self) -> LinearInit {
        LinearInit::Normal {
            std: self.output_layer_init_method_std,
        }
    }

    /// Attention settings for one block of this layer.
    pub fn attention_config(&self, mask_type: AttnMaskType) -> AttentionConfig {
        AttentionConfig {
            num_attention_heads: self.num_attention_heads,
            kv_channels: self.head_dim(),
            attention_dropout: self.attention_dropout,
            attn_mask_type: mask_type,
            layer_number: self.layer_number,
            apply_query_key_layer_scaling: self.apply_query_key_layer_scaling,
            attention_softmax_in_fp32: self.attention_softmax_in_fp32,
            use_fast_attention: self.features.fast_attention,
        }
    }

    /// Checks value ranges. Tensor-parallel divisibility is checked when the
    /// layer is built.
    pub fn validate(&self) -> Result<(), TransformerError> {
        let mut errors = Vec::new();

        if self.hidden_size == 0 {
            errors.push("hidden_size must be greater than 0".to_string());
        }
        if self.ffn_hidden_size == 0 {
            errors.push("ffn_hidden_size must be greater than 0".to_string());
        }
        if self.num_attention_heads == 0 {
            errors.push("num_attention_heads must be greater than 0".to_string());
        } else if self.kv_channels.is_none() && self.hidden_size % self.num_attention_heads != 0 {
            errors.push(format!(
                "hidden_size ({}) must be divisible by num_attention_heads ({}) unless kv_channels is set",
                self.hidden_size, self.num_attention_heads
            ));
        }
        if self.kv_channels == Some(0) {
            errors.push("kv_channels must be greater than 0".to_string());
        }
        for (name, p) in [
            ("hidden_dropout", self.hidden_dropout),
            ("attention_dropout", self.attention_dropout),
            ("drop_path_rate", self.drop_path_rate),
        ] {
            if !(0.0..1.0).contains(&p) {
                errors.push(format!("{name} must be in [0, 1), got {p}"));
            }
        }
        if self.layernorm_epsilon <= 0.0 {
            errors.push("layernorm_epsilon must be greater than 0".to_string());
        }
        if self.init_method_std < 0.0 || self.output_layer_init_method_std < 0.0 {
            errors.push("init std must be >= 0".to_string());
        }
        if self.tp_size == 0 {
            errors.push("tp_size must be greater than 0".to_string());
        }
        if self.tp_size > 1 && !self.set_parallel_mode {
            errors.push("tp_size > 1 requires set_parallel_mode".to_string());
        }
        if self.layer_number == Some(0) {
            log::warn!("layer_number 0 will be clamped to 1");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(TransformerError::Validation(errors))
        }
    }
}

fn from_name<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    T::Err: fmt::Display,
{
    let name = String::deserialize(deserializer)?;
    name.parse().map_err(serde::de::Error::custom)
}

fn default_true() -> bool {
    true
}

fn default_epsilon() -> f64 {
    1e-5
}

fn default_dropout() -> f32 {
    0.1
}

fn default_init_std() -> f64 {
    DEFAULT_INIT_STD
}

fn default_tp_size() -> usize {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_parse_or_fail_as_contract_violations() {
        assert_eq!("decoder".parse::<LayerType>().ok(), Some(LayerType::Decoder));
        assert!(matches!(
            "prefix-lm".parse::<LayerType>(),
            Err(TransformerError::UnsupportedLayerType(name)) if name == "prefix-lm"
        ));
        assert!(matches!(
            "local".parse::<AttnType>(),
            Err(TransformerError::UnsupportedAttentionType(_))
        ));
        assert_eq!("bfloat16".parse::<Precision>().ok(), Some(Precision::Bf16));
    }

    #[test]
    fn kv_channels_override_sets_projection_size() {
        let mut config = TransformerLayerConfig::new(64, 256, 4);
        assert_eq!(config.head_dim(), 16);
        config.kv_channels = Some(8);
        assert_eq!(config.projection_size(), 32);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_collects_every_violation() {
        let mut config = TransformerLayerConfig::new(10, 0, 4);
        config.hidden_dropout = 1.5;
        config.tp_size = 2;
        match config.validate() {
            Err(TransformerError::Validation(errors)) => assert_eq!(errors.len(), 4),
            other => panic!("expected validation errors, got {other:?}"),
        }
    }
}
