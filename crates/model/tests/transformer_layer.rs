use std::io::Write;
use std::sync::Arc;

use anyhow::Result;
use attention::masks::padding_mask_from_lengths;
use attention::{AttnMaskType, CheckpointTape, InferenceParams};
use candle_core::{DType, Device, Tensor, Var};
use layers::{LayerError, RngStateTracker};
use static_assertions::assert_impl_all;
use model::{ForwardOptions, LayerType, Precision, TransformerError, TransformerLayer, TransformerLayerConfig};

assert_impl_all!(TransformerLayer: Send, Sync, Clone);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn base_config() -> TransformerLayerConfig {
    let mut config = TransformerLayerConfig::new(32, 64, 4);
    config.layer_number = Some(1);
    config
}

fn build(config: TransformerLayerConfig, seed: u64) -> Result<TransformerLayer, TransformerError> {
    TransformerLayer::new(config, None, Arc::new(RngStateTracker::new(seed)), &Device::Cpu)
}

fn allclose(a: &Tensor, b: &Tensor, tol: f32) -> Result<()> {
    assert_eq!(a.dims(), b.dims());
    let max = a
        .to_dtype(DType::F32)?
        .sub(&b.to_dtype(DType::F32)?)?
        .abs()?
        .max_all()?
        .to_vec0::<f32>()?;
    assert!(max <= tol, "max diff {max} exceeded tolerance {tol}");
    Ok(())
}

#[test]
fn incremental_decode_matches_full_sequence() -> Result<()> {
    init_logging();
    let layer = build(base_config(), 0)?;
    layer.set_training(false);
    let (seq, batch) = (6, 2);
    let hidden = Tensor::randn(0f32, 1.0, (seq, batch, 32), &Device::Cpu)?;

    let full = layer.forward(&hidden, None, None, None, ForwardOptions::default(), None)?;

    let mut session = InferenceParams::new(batch, seq);
    // Prefill two tokens, then decode one at a time.
    let mut pieces = vec![layer.forward(
        &hidden.narrow(0, 0, 2)?,
        None,
        None,
        None,
        ForwardOptions::default(),
        Some(&mut session),
    )?];
    session.advance(2);
    for t in 2..seq {
        pieces.push(layer.forward(
            &hidden.narrow(0, t, 1)?,
            None,
            None,
            None,
            ForwardOptions::default(),
            Some(&mut session),
        )?);
        session.advance(1);
    }
    let incremental = Tensor::cat(&pieces, 0)?;
    allclose(&full, &incremental, 1e-5)?;

    let extra = hidden.narrow(0, 0, 1)?;
    let overflow = layer.forward(&extra, None, None, None, ForwardOptions::default(), Some(&mut session));
    assert!(matches!(
        overflow,
        Err(TransformerError::Attention(attention::AttentionError::CacheOverflow { .. }))
    ));
    Ok(())
}

#[test]
fn checkpointed_layer_matches_plain_values_and_gradients() -> Result<()> {
    init_logging();
    let mut config = base_config();
    config.attention_dropout = 0.2;
    config.hidden_dropout = 0.1;
    let layer = build(config, 5)?;
    let tracker = layer.self_attention().core_attention().rng_tracker().clone();
    let hidden = Var::randn(0f32, 1.0, (5, 2, 32), &Device::Cpu)?;
    let probe = Tensor::randn(0f32, 1.0, (5, 2, 32), &Device::Cpu)?;

    let start = tracker.snapshot()?;
    let plain = layer.forward(hidden.as_tensor(), None, None, None, ForwardOptions::default(), None)?;
    let plain_grads = plain.mul(&probe)?.sum_all()?.backward()?;
    let plain_grad = plain_grads
        .get(hidden.as_tensor())
        .ok_or_else(|| anyhow::anyhow!("missing plain gradient"))?;

    tracker.restore(&start)?;
    let tape = CheckpointTape::new();
    let options = ForwardOptions {
        is_first_microbatch: None,
        checkpoint: Some(&tape),
    };
    let recorded = layer.forward(hidden.as_tensor(), None, None, None, options, None)?;
    allclose(&recorded, &plain, 0.0)?;
    assert_eq!(tape.len(), 1);

    let loss = recorded.mul(&probe)?.sum_all()?;
    let grads = tape.backward(&loss, &[hidden.as_tensor()])?;
    let grad = grads[0]
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("missing checkpointed gradient"))?;
    allclose(grad, plain_grad, 1e-5)?;
    Ok(())
}

#[test]
fn decoder_cross_attention_ignores_masked_encoder_positions() -> Result<()> {
    init_logging();
    let mut config = base_config();
    config.layer_type = LayerType::Decoder;
    let layer = build(config, 1)?;
    layer.set_training(false);
    assert!(layer.inter_attention().is_some());

    let device = Device::Cpu;
    let hidden = Tensor::randn(0f32, 1.0, (3, 2, 32), &device)?;
    let encoder = Tensor::randn(0f32, 1.0, (5, 2, 32), &device)?;
    // Sample 0 sees 5 encoder positions, sample 1 only the first 2.
    let mask = padding_mask_from_lengths(&device, &[5, 2], 3, 5)?;
    let out = layer.forward(&hidden, None, Some(&encoder), Some(&mask), ForwardOptions::default(), None)?;
    assert_eq!(out.dims(), &[3, 2, 32]);

    let noise = Tensor::randn(0f32, 1.0, (3, 1, 32), &device)?;
    let perturbed = Tensor::cat(
        &[
            encoder.narrow(0, 0, 2)?,
            Tensor::cat(&[encoder.narrow(0, 2, 3)?.narrow(1, 0, 1)?, noise], 1)?,
        ],
        0,
    )?;
    let again = layer.forward(&hidden, None, Some(&perturbed), Some(&mask), ForwardOptions::default(), None)?;
    allclose(&out.narrow(1, 1, 1)?, &again.narrow(1, 1, 1)?, 1e-5)?;
    Ok(())
}

#[test]
fn partition_count_must_divide_heads_and_hidden() -> Result<()> {
    let mut heads = TransformerLayerConfig::new(12, 24, 4);
    heads.tp_size = 3;
    heads.set_parallel_mode = true;
    assert!(matches!(
        build(heads, 0),
        Err(TransformerError::Layer(LayerError::Partition {
            what: "num_attention_heads",
            ..
        }))
    ));

    let mut hidden = TransformerLayerConfig::new(32, 64, 4);
    hidden.tp_size = 3;
    hidden.set_parallel_mode = true;
    assert!(matches!(
        build(hidden, 0),
        Err(TransformerError::Layer(LayerError::Partition { what: "hidden_size", .. }))
    ));

    let mut split = TransformerLayerConfig::new(32, 64, 4);
    split.tp_size = 2;
    split.set_parallel_mode = true;
    let layer = build(split, 0)?;
    assert_eq!(layer.self_attention().heads_per_partition(), 2);
    let out = layer.forward(
        &Tensor::randn(0f32, 1.0, (3, 1, 32), &Device::Cpu)?,
        None,
        None,
        None,
        ForwardOptions::default(),
        None,
    )?;
    assert_eq!(out.dims(), &[3, 1, 32]);
    Ok(())
}

#[test]
fn padding_self_attention_and_half_precision_parameters() -> Result<()> {
    init_logging();
    let mut config = base_config();
    config.self_attn_mask_type = AttnMaskType::Padding;
    config.params_dtype = Precision::Bf16;
    config.zero_centered_gamma = true;
    config.fuse_qkv_params = true;
    assert_eq!("BFloat16".parse::<Precision>()?, Precision::Bf16);
    assert!("int8".parse::<Precision>().is_err());
    let layer = build(config, 2)?;
    layer.set_training(false);
    assert!(!layer.self_attention().core_attention().prefers_fast());

    let hidden = Tensor::randn(0f32, 1.0, (4, 2, 32), &Device::Cpu)?.to_dtype(DType::BF16)?;
    let mask = padding_mask_from_lengths(&Device::Cpu, &[4, 3], 4, 4)?;
    let out = layer.forward(&hidden, Some(&mask), None, None, ForwardOptions::default(), None)?;
    assert_eq!(out.dtype(), DType::BF16);
    assert_eq!(out.dims(), &[4, 2, 32]);
    Ok(())
}

#[test]
fn config_loads_from_toml_and_json() -> Result<()> {
    let dir = tempfile::tempdir()?;

    let toml_path = dir.path().join("layer.toml");
    let mut file = std::fs::File::create(&toml_path)?;
    writeln!(
        file,
        "hidden_size = 64\nffn_hidden_size = 256\nnum_attention_heads = 8\nlayer_type = \"decoder\"\nparams_dtype = \"bf16\"\n\n[features]\nfast_attention = false"
    )?;
    let config = TransformerLayerConfig::from_path(&toml_path)?;
    assert_eq!(config.layer_type, LayerType::Decoder);
    assert_eq!(config.params_dtype, Precision::Bf16);
    assert_eq!(config.hidden_dropout, 0.1);
    assert_eq!(config.self_attn_mask_type, AttnMaskType::Causal);
    assert!(!config.features.fast_attention);
    assert!(config.features.bias_dropout_fusion);

    let json_path = dir.path().join("layer.json");
    std::fs::write(
        &json_path,
        r#"{"hidden_size": 16, "ffn_hidden_size": 32, "num_attention_heads": 2, "self_attn_mask_type": "padding", "kv_channels": 4}"#,
    )?;
    let config = TransformerLayerConfig::from_path(&json_path)?;
    assert_eq!(config.self_attn_mask_type, AttnMaskType::Padding);
    assert_eq!(config.projection_size(), 8);

    let bad_path = dir.path().join("bad.toml");
    std::fs::write(
        &bad_path,
        "hidden_size = 16\nffn_hidden_size = 32\nnum_attention_heads = 2\nlayer_type = \"prefix\"",
    )?;
    assert!(matches!(
        TransformerLayerConfig::from_path(&bad_path),
        Err(TransformerError::ConfigFormat(_))
    ));

    let invalid_path = dir.path().join("invalid.json");
    std::fs::write(
        &invalid_path,
        r#"{"hidden_size": 16, "ffn_hidden_size": 32, "num_attention_heads": 2, "hidden_dropout": 1.0}"#,
    )?;
    assert!(matches!(
        TransformerLayerConfig::from_path(&invalid_path),
        Err(TransformerError::Validation(_))
    ));
    Ok(())
}

#[test]
fn wgrad_fusion_requires_fused_qkv() {
    let mut config = base_config();
    config.fuse_wgrad_accumulation = true;
    assert!(matches!(build(config, 0), Err(TransformerError::FusedWgradRequiresFusedQkv)));
}
