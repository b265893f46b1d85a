//! Tensor-parallel topology and collective communication.
//!
//! Provides:
//! - [`Mapping`] - Where this process sits in the parallel topology
//! - [`ParallelConfig`] - Sharding descriptor consumed by embedding and projection modules
//! - [`Communicator`] - Collective operations, supplied by the host runtime

mod comm;
mod mapping;

pub use comm::{Communicator, SingleProcessGroup};
pub use mapping::{Mapping, ParallelConfig, Shard, TensorParallelMode};
