//! Configuration options shared by all attention implementations.
//!
//! [`Config`] is resolved once when a dispatcher is built: a missing layer
//! number disables query-key layer scaling, and layer scaling forces an fp32
//! softmax.

use std::fmt;
use std::str::FromStr;

use super::errors::AttentionError;

/// Which positions a self-attention block may not attend to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttnMaskType {
    /// Future positions are hidden; explicit masks are OR-ed on top.
    #[default]
    Causal,
    /// Only the caller's explicit mask applies.
    Padding,
}

impl AttnMaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttnMaskType::Causal => "causal",
            AttnMaskType::Padding => "padding",
        }
    }
}

impl fmt::Display for AttnMaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttnMaskType {
    type Err = AttentionError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "causal" => Ok(AttnMaskType::Causal),
            "padding" => Ok(AttnMaskType::Padding),
            other => Err(AttentionError::UnsupportedMaskType {
                requested: other.to_string(),
            }),
        }
    }
}

/// Configuration driving dot-product attention.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Global head count, before tensor-parallel partitioning.
    pub num_attention_heads: usize,
    /// Per-head dimension.
    pub kv_channels: usize,
    /// Dropout applied to attention probabilities while training.
    pub attention_dropout: f32,
    pub attn_mask_type: AttnMaskType,
    /// 1-based position of the owning layer.
    pub layer_number: Option<usize>,
    pub apply_query_key_layer_scaling: bool,
    pub attention_softmax_in_fp32: bool,
    /// Process-wide toggle for the fast kernel path.
    pub use_fast_attention: bool,
}

impl Config {
    pub fn new(num_attention_heads: usize, kv_channels: usize) -> Self {
        Self {
            num_attention_heads,
            kv_channels,
            attention_dropout: 0.0,
            attn_mask_type: AttnMaskType::Causal,
            layer_number: None,
            apply_query_key_layer_scaling: false,
            attention_softmax_in_fp32: true,
            use_fast_attention: true,
        }
    }

    /// Applies the layer-number rules and validates the numeric ranges.
    pub fn resolve(mut self) -> Result<Self, AttentionError> {
        if self.num_attention_heads == 0 || self.kv_channels == 0 {
            return Err(AttentionError::InvalidConfig {
                message: "head count and kv_channels must be non-zero".into(),
            });
        }
        if !(0.0..1.0).contains(&self.attention_dropout) {
            return Err(AttentionError::InvalidConfig {
                message: format!(
                    "attention dropout must be in [0, 1), got {}",
                    self.attention_dropout
                ),
            });
        }
        match self.layer_number {
            None => self.apply_query_key_layer_scaling = false,
            Some(n) => self.layer_number = Some(n.max(1)),
        }
        if self.apply_query_key_layer_scaling {
            self.attention_softmax_in_fp32 = true;
        }
        Ok(self)
    }

    /// Layer-scaling coefficient, if enabled.
    pub fn layer_scale(&self) -> Option<f64> {
        match (self.apply_query_key_layer_scaling, self.layer_number) {
            (true, Some(n)) => Some(n as f64),
            _ => None,
        }
    }

    /// Divisor applied to `QK^T`.
    pub fn norm_factor(&self) -> f64 {
        (self.kv_channels as f64).sqrt() * self.layer_scale().unwrap_or(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_layer_number_disables_scaling() -> Result<(), AttentionError> {
        let mut config = Config::new(4, 16);
        config.apply_query_key_layer_scaling = true;
        let resolved = config.resolve()?;
        assert!(!resolved.apply_query_key_layer_scaling);
        assert_eq!(resolved.norm_factor(), 4.0);
        Ok(())
    }

    #[test]
    fn layer_scaling_forces_fp32_softmax() -> Result<(), AttentionError> {
        let mut config = Config::new(4, 16);
        config.apply_query_key_layer_scaling = true;
        config.attention_softmax_in_fp32 = false;
        config.layer_number = Some(0);
        let resolved = config.resolve()?;
        assert!(resolved.attention_softmax_in_fp32);
        assert_eq!(resolved.layer_number, Some(1));
        assert_eq!(resolved.layer_scale(), Some(1.0));
        Ok(())
    }

    #[test]
    fn mask_type_parsing_rejects_unknown_names() {
        assert_eq!("causal".parse::<AttnMaskType>().ok(), Some(AttnMaskType::Causal));
        assert!(matches!(
            "sliding".parse::<AttnMaskType>(),
            Err(AttentionError::UnsupportedMaskType { .. })
        ));
    }
}
