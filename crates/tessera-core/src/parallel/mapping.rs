//! Parallel topology descriptors.

use crate::error::{Result, TesseraError};
use candle_core::Tensor;
use serde::{Deserialize, Serialize};

/// Position of this process in the parallel topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    /// Total number of ranks.
    pub world_size: usize,
    /// Global rank of this process.
    pub rank: usize,
    /// Tensor-parallel group size.
    pub tp_size: usize,
    /// Rank within the tensor-parallel group.
    pub tp_rank: usize,
    /// Devices per node (used to derive the local device ordinal).
    pub gpus_per_node: usize,
}

impl Mapping {
    /// Single-process, single-device topology.
    pub fn single() -> Self {
        Self {
            world_size: 1,
            rank: 0,
            tp_size: 1,
            tp_rank: 0,
            gpus_per_node: 8,
        }
    }

    /// Pure tensor-parallel topology of `tp_size` ranks.
    pub fn tensor_parallel(tp_size: usize, tp_rank: usize) -> Self {
        Self {
            world_size: tp_size,
            rank: tp_rank,
            tp_size,
            tp_rank,
            gpus_per_node: 8,
        }
    }

    /// Device ordinal on the local node.
    pub fn local_rank(&self) -> usize {
        self.rank % self.gpus_per_node.max(1)
    }

    /// Check the topology is self-consistent.
    pub fn validate(&self) -> Result<()> {
        if self.tp_size == 0 || self.world_size == 0 {
            return Err(TesseraError::Config(
                "tp_size and world_size must be non-zero".to_string(),
            ));
        }
        if self.tp_rank >= self.tp_size {
            return Err(TesseraError::Config(format!(
                "tp_rank {} out of range for tp_size {}",
                self.tp_rank, self.tp_size
            )));
        }
        if self.rank >= self.world_size || self.world_size % self.tp_size != 0 {
            return Err(TesseraError::Config(format!(
                "rank {} / world_size {} inconsistent with tp_size {}",
                self.rank, self.world_size, self.tp_size
            )));
        }
        Ok(())
    }
}

impl Default for Mapping {
    fn default() -> Self {
        Self::single()
    }
}

/// How a weight matrix `[out_features, in_features]` is split across ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TensorParallelMode {
    /// Split the output dimension (weight dim 0).
    Column,
    /// Split the input dimension (weight dim 1).
    Row,
}

/// Sharding descriptor consumed by embedding and projection modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParallelConfig {
    /// Rank within the tensor-parallel group.
    pub tensor_parallel_rank: usize,
    /// Tensor-parallel group size.
    pub tensor_parallel_size: usize,
    /// Sharding mode.
    pub tensor_parallel_mode: TensorParallelMode,
    /// Gather rank-local outputs into the full tensor.
    pub gather_output: bool,
    /// Devices per node.
    pub gpus_per_node: usize,
}

impl ParallelConfig {
    /// Column-parallel descriptor for the given mapping.
    pub fn column(mapping: &Mapping) -> Self {
        Self::with_mode(mapping, TensorParallelMode::Column)
    }

    /// Row-parallel descriptor for the given mapping.
    pub fn row(mapping: &Mapping) -> Self {
        Self::with_mode(mapping, TensorParallelMode::Row)
    }

    fn with_mode(mapping: &Mapping, mode: TensorParallelMode) -> Self {
        Self {
            tensor_parallel_rank: mapping.tp_rank,
            tensor_parallel_size: mapping.tp_size,
            tensor_parallel_mode: mode,
            gather_output: false,
            gpus_per_node: mapping.gpus_per_node,
        }
    }

    /// Set whether outputs are gathered across ranks.
    pub fn with_gather_output(mut self, gather: bool) -> Self {
        self.gather_output = gather;
        self
    }

    /// True when more than one rank participates.
    pub fn is_parallel(&self) -> bool {
        self.tensor_parallel_size > 1
    }

    /// Shard for a `[out_features, in_features]` weight.
    pub fn shard_for_weight(&self) -> Shard {
        let dim = match self.tensor_parallel_mode {
            TensorParallelMode::Column => 0,
            TensorParallelMode::Row => 1,
        };
        self.split(dim)
    }

    /// Shard for a `[out_features]` bias.
    ///
    /// Row-parallel biases are replicated and added after the reduction.
    pub fn shard_for_bias(&self) -> Shard {
        match self.tensor_parallel_mode {
            TensorParallelMode::Column => self.split(0),
            TensorParallelMode::Row => Shard::Full,
        }
    }

    fn split(&self, dim: usize) -> Shard {
        if self.is_parallel() {
            Shard::Split {
                dim,
                rank: self.tensor_parallel_rank,
                world_size: self.tensor_parallel_size,
            }
        } else {
            Shard::Full
        }
    }
}

/// Portion of a parameter held by this rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shard {
    /// The whole tensor.
    Full,
    /// An equal slice along `dim`.
    Split {
        /// Dimension being split.
        dim: usize,
        /// Slice index.
        rank: usize,
        /// Number of slices.
        world_size: usize,
    },
}

impl Shard {
    /// Shape of the local slice for a parameter of `full_shape`.
    pub fn local_shape(&self, full_shape: &[usize]) -> Result<Vec<usize>> {
        let mut shape = full_shape.to_vec();
        if let Shard::Split {
            dim, world_size, ..
        } = *self
        {
            let size = *shape.get(dim).ok_or_else(|| {
                TesseraError::ShapeMismatch(format!(
                    "cannot split dim {} of shape {:?}",
                    dim, full_shape
                ))
            })?;
            if size % world_size != 0 {
                return Err(TesseraError::ShapeMismatch(format!(
                    "dim {} of shape {:?} is not divisible by {}",
                    dim, full_shape, world_size
                )));
            }
            shape[dim] = size / world_size;
        }
        Ok(shape)
    }

    /// Cut the local slice out of a full tensor.
    pub fn narrow(&self, tensor: &Tensor) -> Result<Tensor> {
        match *self {
            Shard::Full => Ok(tensor.clone()),
            Shard::Split { dim, rank, .. } => {
                let local = self.local_shape(tensor.dims())?;
                let len = local[dim];
                Ok(tensor.narrow(dim, rank * len, len)?.contiguous()?)
            }
        }
    }
}
