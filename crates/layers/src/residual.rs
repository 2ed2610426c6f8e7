//! Residual connections: bias-dropout-add and stochastic depth.
//!
//! Both helpers operate on `(seq, batch, hidden)` activations and draw their
//! randomness from a caller-supplied [`Lcg64`] so the caller decides which
//! tracker stream is consumed. Everything is computed in the residual's dtype.

use std::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
};

use candle_core::{Error, Result, Tensor};

use crate::{
    dtypes::cast_tensor,
    random::{self, Lcg64},
};

/// Which implementation of `residual + dropout(x + bias)` is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BiasDropoutAddKind {
    /// Single fused expression with dropout active.
    FusedTrain,
    /// Single fused expression, dropout compiled out.
    FusedInference,
    /// Separate bias add, dropout and residual add.
    Unfused,
}

/// `residual + dropout(x + bias)` with a fused and a composed implementation.
///
/// The fused/unfused choice is fixed at construction; the train/inference
/// variant of the fused path follows [`BiasDropoutAdd::set_training`].
pub struct BiasDropoutAdd {
    probability: f32,
    fused: bool,
    training: AtomicBool,
}

impl Clone for BiasDropoutAdd {
    fn clone(&self) -> Self {
        Self {
            probability: self.probability,
            fused: self.fused,
            training: AtomicBool::new(self.training.load(Ordering::Relaxed)),
        }
    }
}

impl fmt::Debug for BiasDropoutAdd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BiasDropoutAdd")
            .field("probability", &self.probability)
            .field("kind", &self.kind())
            .finish()
    }
}

impl BiasDropoutAdd {
    pub fn new(probability: f32, fused: bool) -> Result<Self> {
        check_probability("hidden dropout", probability)?;
        Ok(Self {
            probability,
            fused,
            training: AtomicBool::new(true),
        })
    }

    pub fn kind(&self) -> BiasDropoutAddKind {
        match (self.fused, self.training.load(Ordering::Relaxed)) {
            (true, true) => BiasDropoutAddKind::FusedTrain,
            (true, false) => BiasDropoutAddKind::FusedInference,
            (false, _) => BiasDropoutAddKind::Unfused,
        }
    }

    pub fn probability(&self) -> f32 {
        self.probability
    }

    pub fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::Relaxed);
    }

    pub fn is_training(&self) -> bool {
        self.training.load(Ordering::Relaxed)
    }

    pub fn forward(&self, x: &Tensor, bias: Option<&Tensor>, residual: &Tensor, rng: &mut Lcg64) -> Result<Tensor> {
        if x.dims() != residual.dims() {
            return Err(Error::Msg(format!(
                "bias-dropout-add: branch {:?} and residual {:?} differ",
                x.dims(),
                residual.dims()
            )));
        }
        let dtype = residual.dtype();
        let x = cast_tensor(x, dtype)?;
        let biased = match bias {
            Some(bias) => x.broadcast_add(&cast_tensor(bias, dtype)?)?,
            None => x,
        };
        match self.kind() {
            BiasDropoutAddKind::FusedTrain => fused_bias_dropout_add(&biased, residual, self.probability, rng),
            BiasDropoutAddKind::FusedInference => biased.add(residual),
            BiasDropoutAddKind::Unfused => {
                let p = if self.is_training() { self.probability } else { 0.0 };
                random::dropout(&biased, p, rng)?.add(residual)
            }
        }
    }
}

fn fused_bias_dropout_add(biased: &Tensor, residual: &Tensor, probability: f32, rng: &mut Lcg64) -> Result<Tensor> {
    if probability == 0.0 {
        return biased.add(residual);
    }
    let keep = 1.0 - probability;
    let mask = Tensor::from_vec(rng.keep_mask(biased.elem_count(), keep), biased.dims(), biased.device())?
        .affine(1.0 / keep as f64, 0.0)?
        .to_dtype(biased.dtype())?;
    biased.mul(&mask)?.add(residual)
}

/// Per-sample drop of a whole residual branch.
///
/// In training each sample along the batch axis keeps the branch with
/// probability `1 - p`, rescaled by `1 / (1 - p)`. Evaluation mode or `p == 0`
/// is the identity.
pub struct StochasticDepth {
    probability: f32,
    training: AtomicBool,
}

impl Clone for StochasticDepth {
    fn clone(&self) -> Self {
        Self {
            probability: self.probability,
            training: AtomicBool::new(self.training.load(Ordering::Relaxed)),
        }
    }
}

impl fmt::Debug for StochasticDepth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StochasticDepth")
            .field("probability", &self.probability)
            .finish()
    }
}

/// Batch axis of `(seq, batch, hidden)`.
const SAMPLE_AXIS: usize = 1;

impl StochasticDepth {
    pub fn new(probability: f32) -> Result<Self> {
        check_probability("drop path", probability)?;
        Ok(Self {
            probability,
            training: AtomicBool::new(true),
        })
    }

    /// Whether the branch can ever be dropped.
    pub fn is_active(&self) -> bool {
        self.probability > 0.0
    }

    pub fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::Relaxed);
    }

    pub fn forward(&self, x: &Tensor, rng: &mut Lcg64) -> Result<Tensor> {
        if self.probability == 0.0 || !self.training.load(Ordering::Relaxed) {
            return Ok(x.clone());
        }
        if x.rank() <= SAMPLE_AXIS {
            return Err(Error::Msg(format!(
                "drop path expects (seq, batch, ...) input, got {:?}",
                x.dims()
            )));
        }
        let mask = random::per_index_mask(x.dims(), SAMPLE_AXIS, 1.0 - self.probability, x.dtype(), x.device(), rng)?;
        x.broadcast_mul(&mask)
    }
}

fn check_probability(what: &str, probability: f32) -> Result<()> {
    if (0.0..1.0).contains(&probability) {
        Ok(())
    } else {
        Err(Error::Msg(format!("{what} probability must be in [0, 1), got {probability}")))
    }
}
