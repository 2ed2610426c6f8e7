//! Deterministic random streams for dropout.
//!
//! Every dropout site in a layer draws from a named stream owned by a
//! [`RngStateTracker`]. Streams can be snapshotted and restored, which is what
//! lets checkpointed recomputation replay exactly the same dropout masks as
//! the first forward pass.

use std::collections::HashMap;
use std::sync::Mutex;

use candle_core::{DType, Error, Result, Tensor};

/// Stream used when no model-parallel isolation is requested.
pub const DEFAULT_STREAM: &str = "default";

/// Stream used for dropout inside tensor-parallel regions.
pub const MODEL_PARALLEL_STREAM: &str = "model-parallel-rng";

/// Offset mixed into the model-parallel seed so it never aliases the default stream.
const MODEL_PARALLEL_SEED_OFFSET: u64 = 2718;

/// Simple 64-bit linear congruential generator for deterministic dropout masks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lcg64 {
    state: u64,
}

impl Lcg64 {
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    pub fn next_u64(&mut self) -> u64 {
        // Parameters from Numerical Recipes.
        self.state = self
            .state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.state
    }

    /// Uniform sample in `[0, 1)`.
    pub fn next_f32(&mut self) -> f32 {
        const SCALE: f64 = 1.0 / ((1u64 << 53) as f64);
        let bits = self.next_u64() >> 11;
        (bits as f64 * SCALE) as f32
    }

    /// Bernoulli keep-mask with `count` entries, each `1.0` with probability `keep`.
    pub fn keep_mask(&mut self, count: usize, keep: f32) -> Vec<f32> {
        (0..count)
            .map(|_| if self.next_f32() < keep { 1.0 } else { 0.0 })
            .collect()
    }
}

/// Captured state of every stream in a tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RngSnapshot {
    streams: HashMap<String, Lcg64>,
}

/// Named random streams with scoped access.
#[derive(Debug)]
pub struct RngStateTracker {
    streams: Mutex<HashMap<String, Lcg64>>,
}

impl RngStateTracker {
    /// Creates a tracker with the default and model-parallel streams seeded from `seed`.
    pub fn new(seed: u64) -> Self {
        let mut streams = HashMap::new();
        streams.insert(DEFAULT_STREAM.to_string(), Lcg64::new(seed));
        streams.insert(
            MODEL_PARALLEL_STREAM.to_string(),
            Lcg64::new(seed.wrapping_add(MODEL_PARALLEL_SEED_OFFSET)),
        );
        Self {
            streams: Mutex::new(streams),
        }
    }

    /// Registers an additional stream. Re-registering a name is an error.
    pub fn add(&self, name: &str, seed: u64) -> Result<()> {
        let mut streams = self.lock()?;
        if streams.contains_key(name) {
            return Err(Error::Msg(format!("rng stream `{name}` already exists")));
        }
        streams.insert(name.to_string(), Lcg64::new(seed));
        Ok(())
    }

    /// Runs `f` with exclusive access to the named stream.
    ///
    /// The generator is taken out of the map for the duration of the call so
    /// `f` may itself fork other streams.
    pub fn fork<T, E, F>(&self, name: &str, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut Lcg64) -> std::result::Result<T, E>,
        E: From<Error>,
    {
        let mut generator = self
            .lock()?
            .remove(name)
            .ok_or_else(|| Error::Msg(format!("rng stream `{name}` is not registered")))?;
        let result = f(&mut generator);
        self.lock()?.insert(name.to_string(), generator);
        result
    }

    /// Captures the current state of all streams.
    pub fn snapshot(&self) -> Result<RngSnapshot> {
        Ok(RngSnapshot {
            streams: self.lock()?.clone(),
        })
    }

    /// Overwrites all streams with a previously captured snapshot.
    pub fn restore(&self, snapshot: &RngSnapshot) -> Result<()> {
        *self.lock()? = snapshot.streams.clone();
        Ok(())
    }

    /// Runs `f` as if the tracker were still at `snapshot`, then puts the
    /// current state back.
    pub fn replay<T, E, F>(&self, snapshot: &RngSnapshot, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce() -> std::result::Result<T, E>,
        E: From<Error>,
    {
        let current = self.snapshot()?;
        self.restore(snapshot)?;
        let result = f();
        self.restore(&current)?;
        result
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Lcg64>>> {
        self.streams
            .lock()
            .map_err(|_| Error::Msg("rng tracker mutex poisoned".into()))
    }
}

/// Inverted dropout over every element of `tensor`.
///
/// `probability` must be in `[0, 1)`; zero returns the input untouched without
/// consuming random draws.
pub fn dropout(tensor: &Tensor, probability: f32, rng: &mut Lcg64) -> Result<Tensor> {
    if !(0.0..1.0).contains(&probability) {
        return Err(Error::Msg(format!(
            "dropout probability must be in [0, 1), got {probability}"
        )));
    }
    if probability == 0.0 {
        return Ok(tensor.clone());
    }
    let keep = 1.0 - probability;
    let mask = rng.keep_mask(tensor.elem_count(), keep);
    let mask = Tensor::from_vec(mask, tensor.dims(), tensor.device())?
        .affine(1.0 / keep as f64, 0.0)?
        .to_dtype(tensor.dtype())?;
    tensor.mul(&mask)
}

/// Keep-mask with one decision per index along `dim`, broadcastable against a
/// tensor of `dims`. Entries are `0` or `1 / keep`.
pub fn per_index_mask(
    dims: &[usize],
    dim: usize,
    keep: f32,
    dtype: DType,
    device: &candle_core::Device,
    rng: &mut Lcg64,
) -> Result<Tensor> {
    let mut shape = vec![1usize; dims.len()];
    shape[dim] = dims[dim];
    let mask = rng.keep_mask(dims[dim], keep);
    Tensor::from_vec(mask, shape, device)?
        .affine(1.0 / keep as f64, 0.0)?
        .to_dtype(dtype)
}
