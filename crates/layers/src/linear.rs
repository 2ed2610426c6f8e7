//! Dense and tensor-parallel affine projections.
//!
//! Projections consume activations shaped `(seq, batch, in_dim)` and return
//! `(seq, batch, out_dim)`. Weights are stored `(out_dim, in_dim)` and matmuls
//! run in [`MixedPrecision::compute`] before casting back to the parameter
//! dtype. [`ParallelLinear`] adds the column/row partitioning used inside a
//! transformer layer and can keep its parameters split into named chunks
//! (for example separate query/key/value weights) that are concatenated at
//! apply time, which is numerically the same as one fused weight.

use candle_core::{DType, Device, Error, Result, Tensor};

use crate::{
    checks,
    dtypes::MixedPrecision,
    parallel::{ParallelMode, ProcessGroup, TensorParallel},
    projection::{Projection, ProjectionOutput},
    LayerError,
};

/// Standard deviation used for projection weights unless overridden.
pub const DEFAULT_INIT_STD: f64 = 0.023;

/// Weight initialisation policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LinearInit {
    /// Zero-mean normal with the given standard deviation.
    Normal { std: f64 },
    /// All zeros; handy for tests that need an identity residual branch.
    Zeros,
}

impl Default for LinearInit {
    fn default() -> Self {
        LinearInit::Normal {
            std: DEFAULT_INIT_STD,
        }
    }
}

impl LinearInit {
    fn sample(&self, shape: (usize, usize), device: &Device, dtype: DType) -> Result<Tensor> {
        let weight = match self {
            LinearInit::Normal { std } => Tensor::randn(0f32, *std as f32, shape, device)?,
            LinearInit::Zeros => Tensor::zeros(shape, DType::F32, device)?,
        };
        weight.to_dtype(dtype)
    }
}

/// Affine projection over the last axis with an optional bias.
#[derive(Debug, Clone)]
pub struct Linear {
    weight: Tensor,
    bias: Option<Tensor>,
}

impl Linear {
    /// Wraps existing parameters. `weight` is `(out_dim, in_dim)`.
    pub fn new(weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        checks::expect_rank("linear.weight", &weight, 2)?;
        checks::expect_dtype_in("linear.weight", &weight, &[DType::F16, DType::BF16, DType::F32])?;
        if let Some(bias) = &bias {
            checks::expect_shape("linear.bias", bias, &[weight.dims()[0]])?;
            checks::expect_same_dtype("linear.bias", bias, "linear.weight", &weight)?;
        }
        Ok(Self { weight, bias })
    }

    /// Samples a weight from `init`; biases start at zero.
    pub fn with_init(
        input_dim: usize,
        output_dim: usize,
        bias: bool,
        init: LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let weight = init.sample((output_dim, input_dim), device, dtype)?;
        let bias = if bias {
            Some(Tensor::zeros(output_dim, dtype, device)?)
        } else {
            None
        };
        Self::new(weight, bias)
    }

    pub fn input_dim(&self) -> usize {
        self.weight.dims()[1]
    }

    pub fn output_dim(&self) -> usize {
        self.weight.dims()[0]
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    /// `hidden @ weight^T` without the bias.
    pub fn matmul(&self, hidden: &Tensor) -> Result<Tensor> {
        project(hidden, &self.weight)
    }

    /// Full affine projection.
    pub fn forward(&self, hidden: &Tensor) -> Result<Tensor> {
        let output = self.matmul(hidden)?;
        match &self.bias {
            Some(bias) => output.broadcast_add(&bias.to_dtype(output.dtype())?),
            None => Ok(output),
        }
    }
}

/// Matmul over the last axis of an arbitrary-rank input, promoted to the
/// compute dtype implied by `weight`.
pub(crate) fn project(hidden: &Tensor, weight: &Tensor) -> Result<Tensor> {
    let (out_dim, in_dim) = weight.dims2()?;
    let dims = hidden.dims();
    match dims.last() {
        Some(last) if *last == in_dim => {}
        _ => {
            return Err(Error::Msg(format!(
                "linear: expected last dim {in_dim}, got shape {dims:?}"
            )))
        }
    }
    let policy = MixedPrecision::for_storage(weight.dtype());
    let rows: usize = dims[..dims.len() - 1].iter().product();
    let flat = policy.promote(hidden)?.reshape((rows, in_dim))?;
    let weight_t = policy.promote(weight)?.t()?;
    let mut out_dims = dims[..dims.len() - 1].to_vec();
    out_dims.push(out_dim);
    let output = flat.matmul(&weight_t)?.reshape(out_dims)?;
    policy.demote(&output)
}

/// Static description of a [`ParallelLinear`]. Sizes are global, before
/// partitioning.
#[derive(Debug, Clone, PartialEq)]
pub struct ParallelLinearConfig {
    pub input_dim: usize,
    pub output_dim: usize,
    pub bias: bool,
    /// Hand the bias back unapplied instead of adding it.
    pub return_bias: bool,
    /// `None` keeps the projection replicated on every rank.
    pub mode: Option<ParallelMode>,
    /// Names of equally sized output chunks stored as separate parameters.
    /// Empty means a single fused weight.
    pub parameter_split: Vec<String>,
}

impl ParallelLinearConfig {
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: true,
            return_bias: false,
            mode: None,
            parameter_split: Vec::new(),
        }
    }

    pub fn with_mode(mut self, mode: Option<ParallelMode>) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_return_bias(mut self, return_bias: bool) -> Self {
        self.return_bias = return_bias;
        self
    }

    pub fn with_bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }

    pub fn with_parameter_split<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.parameter_split = names.into_iter().map(Into::into).collect();
        self
    }
}

/// Linear layer partitioned across a tensor-parallel group.
///
/// Column mode keeps `output_dim / world_size` output features locally and,
/// under sequence parallelism, gathers the sequence-sharded input first. Row
/// mode keeps `input_dim / world_size` input features and sums partial outputs
/// across the group (or reduce-scatters them along the sequence axis). The
/// row-mode bias is replicated and applied after the reduction.
#[derive(Debug, Clone)]
pub struct ParallelLinear {
    config: ParallelLinearConfig,
    tp: TensorParallel,
    local_in: usize,
    local_out: usize,
    chunks: Vec<(String, Linear)>,
}

impl ParallelLinear {
    /// Builds the local shard with weights drawn from `init`.
    pub fn new(
        config: ParallelLinearConfig,
        tp: TensorParallel,
        init: LinearInit,
        device: &Device,
        dtype: DType,
    ) -> std::result::Result<Self, LayerError> {
        let (local_in, local_out) = local_dims(&config, &tp)?;
        let names = chunk_names(&config);
        let chunk_out = crate::parallel::divide("linear output chunk", local_out, names.len())?;
        let chunks = names
            .into_iter()
            .map(|name| {
                Linear::with_init(local_in, chunk_out, config.bias, init, device, dtype).map(|linear| (name, linear))
            })
            .collect::<Result<Vec<_>>>()?;
        log::debug!(
            "parallel linear {}x{} (local {}x{}, mode {:?}, {} chunk(s))",
            config.input_dim,
            config.output_dim,
            local_in,
            local_out,
            config.mode,
            chunks.len()
        );
        Ok(Self {
            config,
            tp,
            local_in,
            local_out,
            chunks,
        })
    }

    /// Builds the local shard from explicit per-chunk parameters, in
    /// `parameter_split` order.
    pub fn from_parameters(
        config: ParallelLinearConfig,
        tp: TensorParallel,
        parameters: Vec<(Tensor, Option<Tensor>)>,
    ) -> std::result::Result<Self, LayerError> {
        let (local_in, local_out) = local_dims(&config, &tp)?;
        let names = chunk_names(&config);
        if names.len() != parameters.len() {
            return Err(LayerError::InvalidConfig(format!(
                "expected {} parameter chunk(s), got {}",
                names.len(),
                parameters.len()
            )));
        }
        let chunk_out = crate::parallel::divide("linear output chunk", local_out, names.len())?;
        let mut chunks = Vec::with_capacity(names.len());
        for (name, (weight, bias)) in names.into_iter().zip(parameters) {
            checks::expect_shape(&name, &weight, &[chunk_out, local_in])?;
            if bias.is_some() != config.bias {
                return Err(LayerError::InvalidConfig(format!(
                    "chunk `{name}` bias presence does not match the config"
                )));
            }
            chunks.push((name, Linear::new(weight, bias)?));
        }
        Ok(Self {
            config,
            tp,
            local_in,
            local_out,
            chunks,
        })
    }

    pub fn config(&self) -> &ParallelLinearConfig {
        &self.config
    }

    /// Named parameter chunks of this shard.
    pub fn chunks(&self) -> impl Iterator<Item = (&str, &Linear)> {
        self.chunks.iter().map(|(name, linear)| (name.as_str(), linear))
    }

    /// Local weight with every chunk concatenated along the output axis.
    pub fn weight(&self) -> Result<Tensor> {
        match self.chunks.as_slice() {
            [(_, only)] => Ok(only.weight().clone()),
            chunks => {
                let weights: Vec<&Tensor> = chunks.iter().map(|(_, l)| l.weight()).collect();
                Tensor::cat(&weights, 0)
            }
        }
    }

    /// Local bias with every chunk concatenated, if the layer has one.
    pub fn bias(&self) -> Result<Option<Tensor>> {
        if !self.config.bias {
            return Ok(None);
        }
        let biases: Vec<&Tensor> = self.chunks.iter().filter_map(|(_, l)| l.bias()).collect();
        match biases.as_slice() {
            [only] => Ok(Some((*only).clone())),
            many => Tensor::cat(many, 0).map(Some),
        }
    }

    pub fn set_tensor_parallel_group(
        &mut self,
        group: Option<std::sync::Arc<dyn ProcessGroup>>,
    ) -> std::result::Result<(), LayerError> {
        self.tp.set_group(group)
    }
}

impl Projection for ParallelLinear {
    fn apply(&self, input: &Tensor, _is_first_microbatch: Option<bool>) -> Result<ProjectionOutput> {
        let input = match self.config.mode {
            Some(ParallelMode::Column) if self.tp.sequence_parallel() => self.tp.all_gather(input, 0)?,
            _ => input.clone(),
        };
        let output = project(&input, &self.weight()?)?;
        let output = match self.config.mode {
            Some(ParallelMode::Row) if self.tp.sequence_parallel() => self.tp.reduce_scatter(&output, 0)?,
            Some(ParallelMode::Row) => self.tp.all_reduce(&output)?,
            _ => output,
        };
        let bias = self.bias()?;
        match bias {
            Some(bias) if self.config.return_bias => Ok(ProjectionOutput {
                output,
                bias: Some(bias),
                norm_output: None,
            }),
            Some(bias) => {
                let output = output.broadcast_add(&bias.to_dtype(output.dtype())?)?;
                Ok(ProjectionOutput::new(output))
            }
            None => Ok(ProjectionOutput::new(output)),
        }
    }

    fn input_dim(&self) -> usize {
        self.local_in
    }

    fn output_dim(&self) -> usize {
        self.local_out
    }
}

fn local_dims(config: &ParallelLinearConfig, tp: &TensorParallel) -> std::result::Result<(usize, usize), LayerError> {
    match config.mode {
        Some(ParallelMode::Column) => Ok((config.input_dim, tp.partition("linear output features", config.output_dim)?)),
        Some(ParallelMode::Row) => Ok((tp.partition("linear input features", config.input_dim)?, config.output_dim)),
        None => Ok((config.input_dim, config.output_dim)),
    }
}

fn chunk_names(config: &ParallelLinearConfig) -> Vec<String> {
    if config.parameter_split.is_empty() {
        vec!["weight".to_string()]
    } else {
        config.parameter_split.clone()
    }
}
