//! Building blocks for transformer layers.
//!
//! This crate hosts the projection, normalisation, feed-forward and residual
//! components that the attention and model crates assemble, together with the
//! tensor-parallel partition helpers and the dropout random-state tracker.
//! Activations follow the `(seq, batch, hidden)` convention throughout.

pub mod checks;
pub mod dtypes;
pub mod linear;
pub mod mlp;
pub mod norm;
pub mod parallel;
pub mod projection;
pub mod random;
pub mod residual;

use thiserror::Error;

pub use parallel::{divide, ParallelMode, ProcessGroup, SingleProcessGroup, TensorParallel};
pub use projection::{Projection, ProjectionOutput};
pub use random::{Lcg64, RngSnapshot, RngStateTracker};

/// Errors raised while assembling layers from their configuration.
#[derive(Debug, Error)]
pub enum LayerError {
    /// A dimension cannot be split evenly across the tensor-parallel group.
    #[error("{what} ({value}) is not divisible by the partition count ({partitions})")]
    Partition {
        what: &'static str,
        value: usize,
        partitions: usize,
    },
    /// The layer configuration is inconsistent.
    #[error("invalid layer configuration: {0}")]
    InvalidConfig(String),
    /// A tensor operation failed while building parameters.
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}
