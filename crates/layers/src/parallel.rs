//! Tensor-parallel partition descriptors and the process-group contract.
//!
//! Collectives themselves live outside this workspace; layers only talk to a
//! [`ProcessGroup`] through its world size and the three collectives used by
//! column/row parallel projections. [`SingleProcessGroup`] is the identity
//! implementation used when the layer is not partitioned.

use std::fmt;
use std::sync::Arc;

use candle_core::{Result, Tensor};

use crate::LayerError;

/// Handle to the tensor-parallel process group.
pub trait ProcessGroup: Send + Sync + fmt::Debug {
    /// Number of processes sharing the partitioned dimensions.
    fn world_size(&self) -> usize;

    /// Rank of the calling process inside the group.
    fn rank(&self) -> usize;

    /// Sum-reduces `tensor` across the group.
    fn all_reduce(&self, tensor: &Tensor) -> Result<Tensor>;

    /// Concatenates the shards of every rank along `dim`.
    fn all_gather(&self, tensor: &Tensor, dim: usize) -> Result<Tensor>;

    /// Sum-reduces across the group and keeps this rank's shard along `dim`.
    fn reduce_scatter(&self, tensor: &Tensor, dim: usize) -> Result<Tensor>;
}

/// Group of one: every collective is the identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcessGroup;

impl ProcessGroup for SingleProcessGroup {
    fn world_size(&self) -> usize {
        1
    }

    fn rank(&self) -> usize {
        0
    }

    fn all_reduce(&self, tensor: &Tensor) -> Result<Tensor> {
        Ok(tensor.clone())
    }

    fn all_gather(&self, tensor: &Tensor, _dim: usize) -> Result<Tensor> {
        Ok(tensor.clone())
    }

    fn reduce_scatter(&self, tensor: &Tensor, _dim: usize) -> Result<Tensor> {
        Ok(tensor.clone())
    }
}

/// How a projection's weight is split across the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParallelMode {
    /// Output features are partitioned; inputs are replicated.
    Column,
    /// Input features are partitioned; outputs are reduced across the group.
    Row,
}

/// Partition descriptor shared by every sub-module of a layer.
#[derive(Debug, Clone)]
pub struct TensorParallel {
    group: Option<Arc<dyn ProcessGroup>>,
    size: usize,
    sequence_parallel: bool,
}

impl TensorParallel {
    /// Builds a descriptor. When `group` is supplied its world size wins over
    /// `size`. Sequence parallelism is only active when more than one process
    /// shares the layer.
    pub fn new(group: Option<Arc<dyn ProcessGroup>>, size: usize, sequence_parallel: bool) -> Self {
        let size = group.as_ref().map(|g| g.world_size()).unwrap_or(size).max(1);
        Self {
            group,
            size,
            sequence_parallel: sequence_parallel && size > 1,
        }
    }

    /// Unpartitioned layer.
    pub fn single() -> Self {
        Self::new(None, 1, false)
    }

    pub fn world_size(&self) -> usize {
        self.size
    }

    pub fn sequence_parallel(&self) -> bool {
        self.sequence_parallel
    }

    pub fn group(&self) -> Option<&Arc<dyn ProcessGroup>> {
        self.group.as_ref()
    }

    /// Splits `value` evenly across the partitions.
    pub fn partition(&self, what: &'static str, value: usize) -> std::result::Result<usize, LayerError> {
        divide(what, value, self.size)
    }

    /// Replaces the group handle. The new group must keep the partition count
    /// the layer was built with.
    pub fn set_group(&mut self, group: Option<Arc<dyn ProcessGroup>>) -> std::result::Result<(), LayerError> {
        let incoming = group.as_ref().map(|g| g.world_size()).unwrap_or(self.size);
        if incoming != self.size {
            return Err(LayerError::InvalidConfig(format!(
                "process group world size {incoming} differs from the partition count {} the layer was built with",
                self.size
            )));
        }
        self.group = group;
        Ok(())
    }

    pub fn all_reduce(&self, tensor: &Tensor) -> Result<Tensor> {
        match &self.group {
            Some(group) if self.size > 1 => group.all_reduce(tensor),
            _ => Ok(tensor.clone()),
        }
    }

    pub fn all_gather(&self, tensor: &Tensor, dim: usize) -> Result<Tensor> {
        match &self.group {
            Some(group) if self.size > 1 => group.all_gather(tensor, dim),
            _ => Ok(tensor.clone()),
        }
    }

    pub fn reduce_scatter(&self, tensor: &Tensor, dim: usize) -> Result<Tensor> {
        match &self.group {
            Some(group) if self.size > 1 => group.reduce_scatter(tensor, dim),
            _ => Ok(tensor.clone()),
        }
    }
}

impl Default for TensorParallel {
    fn default() -> Self {
        Self::single()
    }
}

/// Exact integer division; a remainder is a partition contract violation.
pub fn divide(what: &'static str, value: usize, partitions: usize) -> std::result::Result<usize, LayerError> {
    if partitions == 0 || value % partitions != 0 {
        return Err(LayerError::Partition {
            what,
            value,
            partitions,
        });
    }
    Ok(value / partitions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct FixedGroup(usize);

    impl ProcessGroup for FixedGroup {
        fn world_size(&self) -> usize {
            self.0
        }
        fn rank(&self) -> usize {
            0
        }
        fn all_reduce(&self, tensor: &Tensor) -> Result<Tensor> {
            Ok(tensor.clone())
        }
        fn all_gather(&self, tensor: &Tensor, _dim: usize) -> Result<Tensor> {
            Ok(tensor.clone())
        }
        fn reduce_scatter(&self, tensor: &Tensor, _dim: usize) -> Result<Tensor> {
            Ok(tensor.clone())
        }
    }

    #[test]
    fn divide_rejects_remainders() {
        assert_eq!(divide("heads", 8, 4).unwrap(), 2);
        assert!(matches!(
            divide("heads", 6, 4),
            Err(LayerError::Partition { value: 6, partitions: 4, .. })
        ));
    }

    #[test]
    fn group_world_size_overrides_size() {
        let tp = TensorParallel::new(Some(Arc::new(FixedGroup(4))), 1, true);
        assert_eq!(tp.world_size(), 4);
        assert!(tp.sequence_parallel());
    }

    #[test]
    fn sequence_parallel_requires_multiple_ranks() {
        let tp = TensorParallel::new(None, 1, true);
        assert!(!tp.sequence_parallel());
    }

    #[test]
    fn set_group_keeps_partition_count() {
        let mut tp = TensorParallel::new(None, 2, false);
        assert!(tp.set_group(Some(Arc::new(FixedGroup(4)))).is_err());
        assert!(tp.set_group(Some(Arc::new(FixedGroup(2)))).is_ok());
    }
}
