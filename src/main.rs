use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use candle_core::Tensor;
use clap::Parser;
use fused_transformer::{
    setup_device, toggles_from_env, CheckpointTape, ForwardOptions, InferenceParams, TransformerLayer,
    TransformerLayerConfig,
};
use layers::RngStateTracker;

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a single transformer layer over random activations", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "PATH", help = "Layer config (TOML or JSON)")]
    config: Option<PathBuf>,

    #[arg(long, default_value_t = 16, help = "Sequence length")]
    seq: usize,

    #[arg(long, default_value_t = 2, help = "Batch size")]
    batch: usize,

    #[arg(long, default_value_t = 1234, help = "Seed for the dropout random state")]
    seed: u64,

    #[arg(long, default_value_t = 4, help = "Prompt tokens fed before decoding one at a time")]
    prefill: usize,

    #[arg(long, help = "Also run a checkpointed training step")]
    checkpoint: bool,
}

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("fused-transformer failed: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => TransformerLayerConfig::from_path(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => TransformerLayerConfig::new(256, 1024, 8),
    };
    config.layer_number.get_or_insert(1);
    let env = toggles_from_env();
    config.features.fast_attention &= env.fast_attention;
    config.features.bias_dropout_fusion &= env.bias_dropout_fusion;
    config.validate()?;

    let device = setup_device()?;
    let tracker = Arc::new(RngStateTracker::new(args.seed));
    let layer = TransformerLayer::new(config.clone(), None, tracker, &device)?;
    let dtype = config.params_dtype();
    let hidden = Tensor::randn(0f32, 1.0, (args.seq, args.batch, config.hidden_size), &device)?.to_dtype(dtype)?;

    if args.checkpoint {
        let input = candle_core::Var::from_tensor(&hidden)?;
        let tape = CheckpointTape::new();
        let started = Instant::now();
        let options = ForwardOptions {
            is_first_microbatch: Some(true),
            checkpoint: Some(&tape),
        };
        let output = layer.forward(input.as_tensor(), None, None, None, options, None)?;
        let loss = output.to_dtype(candle_core::DType::F32)?.sqr()?.mean_all()?;
        let grads = tape.backward(&loss, &[input.as_tensor()])?;
        log::info!(
            "checkpointed step: loss={:.5} input grad present={} in {:?}",
            loss.to_vec0::<f32>()?,
            grads[0].is_some(),
            started.elapsed()
        );
    }

    layer.set_training(false);
    let started = Instant::now();
    let full = layer.forward(&hidden, None, None, None, ForwardOptions::default(), None)?;
    log::info!("full forward {:?} -> {:?} in {:?}", hidden.dims(), full.dims(), started.elapsed());

    let prefill = args.prefill.clamp(1, args.seq);
    let mut session = InferenceParams::new(args.batch, args.seq);
    let started = Instant::now();
    let mut pieces = vec![layer.forward(
        &hidden.narrow(0, 0, prefill)?,
        None,
        None,
        None,
        ForwardOptions::default(),
        Some(&mut session),
    )?];
    session.advance(prefill);
    for step in prefill..args.seq {
        pieces.push(layer.forward(
            &hidden.narrow(0, step, 1)?,
            None,
            None,
            None,
            ForwardOptions::default(),
            Some(&mut session),
        )?);
        session.advance(1);
    }
    let incremental = Tensor::cat(&pieces, 0)?;
    let drift = full
        .to_dtype(candle_core::DType::F32)?
        .sub(&incremental.to_dtype(candle_core::DType::F32)?)?
        .abs()?
        .max_all()?
        .to_vec0::<f32>()?;
    log::info!(
        "incremental decode: {} prefill + {} steps in {:?}, max drift vs full forward {drift:.2e}",
        prefill,
        args.seq - prefill,
        started.elapsed()
    );
    println!("output {:?}, incremental drift {drift:.2e}", full.dims());
    Ok(())
}
