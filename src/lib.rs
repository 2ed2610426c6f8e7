//! Transformer layer with dispatched attention kernels, fused
//! bias-dropout-add and KV caching on candle.
//!
//! The building blocks live in the `layers`, `attention` and `model` crates;
//! this crate re-exports them and owns the process-level concerns the layer
//! itself never touches: device selection and the environment toggles.

pub use attention;
pub use layers;
pub use model;

pub use attention::{AttnMaskType, CheckpointTape, DotProductAttention, InferenceParams};
pub use model::{FeatureToggles, ForwardOptions, LayerType, TransformerError, TransformerLayer, TransformerLayerConfig};

use std::sync::OnceLock;

use anyhow::Result;
use candle_core::Device;

/// Disables the fast attention kernel when set to `0`.
pub const FAST_ATTENTION_ENV: &str = "FT_FAST_ATTN";
/// Disables the fused bias-dropout-add kernels when set to `0`.
pub const BIAS_DROPOUT_FUSION_ENV: &str = "FT_BIAS_DROPOUT_FUSION";

/// Feature toggles read from the environment on first use. Later changes to
/// the environment are not observed.
pub fn toggles_from_env() -> FeatureToggles {
    static TOGGLES: OnceLock<FeatureToggles> = OnceLock::new();
    *TOGGLES.get_or_init(|| {
        let toggles = FeatureToggles {
            fast_attention: flag_enabled(std::env::var(FAST_ATTENTION_ENV).ok().as_deref()),
            bias_dropout_fusion: flag_enabled(std::env::var(BIAS_DROPOUT_FUSION_ENV).ok().as_deref()),
        };
        log::debug!("feature toggles from environment: {toggles:?}");
        toggles
    })
}

/// Unset means enabled; only `"0"` turns a feature off.
pub fn flag_enabled(value: Option<&str>) -> bool {
    value.map(|v| v.trim() != "0").unwrap_or(true)
}

/// Picks CUDA, then Metal, then the CPU. `CANDLE_FORCE_CPU` skips detection.
pub fn setup_device() -> Result<Device> {
    if std::env::var("CANDLE_FORCE_CPU").is_ok() {
        log::info!("CANDLE_FORCE_CPU set, using CPU backend");
        return Ok(Device::Cpu);
    }
    match Device::cuda_if_available(0) {
        Ok(device) if device.is_cuda() => {
            log::info!("CUDA device selected: {device:?}");
            return Ok(device);
        }
        Ok(_) => {}
        Err(err) => log::warn!("CUDA probe failed: {err}"),
    }
    if candle_core::utils::metal_is_available() {
        match Device::new_metal(0) {
            Ok(device) => {
                log::info!("Metal device selected: {device:?}");
                return Ok(device);
            }
            Err(err) => log::warn!("Metal probe failed: {err}"),
        }
    }
    log::info!("using CPU backend");
    Ok(Device::Cpu)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_zero_disables_a_flag() {
        assert!(flag_enabled(None));
        assert!(flag_enabled(Some("1")));
        assert!(flag_enabled(Some("yes")));
        assert!(!flag_enabled(Some("0")));
        assert!(!flag_enabled(Some(" 0 ")));
    }

    #[test]
    fn forced_cpu_skips_device_detection() -> Result<()> {
        std::env::set_var("CANDLE_FORCE_CPU", "1");
        assert!(setup_device()?.is_cpu());
        Ok(())
    }

    #[test]
    fn env_toggles_are_resolved_once() {
        let first = toggles_from_env();
        std::env::set_var(FAST_ATTENTION_ENV, if first.fast_attention { "0" } else { "1" });
        assert_eq!(toggles_from_env(), first);
    }
}
