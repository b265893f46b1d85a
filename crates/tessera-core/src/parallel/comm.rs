//! Collective communication seam.

use crate::error::Result;
use candle_core::Tensor;

/// Collective operations across a tensor-parallel group.
///
/// Transport (NCCL, MPI, shared memory) belongs to the host runtime; models
/// only call through this trait.
pub trait Communicator: Send + Sync {
    /// Rank of this process within the group.
    fn rank(&self) -> usize;

    /// Number of ranks in the group.
    fn world_size(&self) -> usize;

    /// Element-wise sum across all ranks.
    fn all_reduce(&self, tensor: &Tensor) -> Result<Tensor>;

    /// Concatenate every rank's tensor along `dim`, in rank order.
    fn all_gather(&self, tensor: &Tensor, dim: usize) -> Result<Tensor>;
}

/// Identity communicator for a group of one.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProcessGroup;

impl Communicator for SingleProcessGroup {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce(&self, tensor: &Tensor) -> Result<Tensor> {
        Ok(tensor.clone())
    }

    fn all_gather(&self, tensor: &Tensor, _dim: usize) -> Result<Tensor> {
        Ok(tensor.clone())
    }
}
