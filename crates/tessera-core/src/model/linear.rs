//! Tensor-parallel linear projection.
//!
//! Weights follow the `[out_features, in_features]` convention, so the
//! projection is `x @ W^T (+ b)`.

use super::{WeightInit, WeightSource};
use crate::error::{Result, TesseraError};
use crate::parallel::{Communicator, ParallelConfig, TensorParallelMode};
use candle_core::Tensor;
use std::sync::Arc;

/// Linear projection sharded according to a [`ParallelConfig`].
#[derive(Clone)]
pub struct ParallelLinear {
    /// Local weight slice.
    weight: Tensor,
    /// Local bias slice (full bias for row-parallel).
    bias: Option<Tensor>,
    /// Unsharded input features.
    in_features: usize,
    /// Unsharded output features.
    out_features: usize,
    parallel: ParallelConfig,
    comm: Arc<dyn Communicator>,
}

impl ParallelLinear {
    /// Load `{prefix}.weight` (and `{prefix}.bias`) from a weight source.
    pub fn load(
        weights: &dyn WeightSource,
        prefix: &str,
        in_features: usize,
        out_features: usize,
        bias: bool,
        parallel: ParallelConfig,
        comm: Arc<dyn Communicator>,
    ) -> Result<Self> {
        let weight = weights.get(
            &format!("{}.weight", prefix),
            &[out_features, in_features],
            parallel.shard_for_weight(),
            WeightInit::PROJECTION,
        )?;
        let bias = if bias {
            Some(weights.get(
                &format!("{}.bias", prefix),
                &[out_features],
                parallel.shard_for_bias(),
                WeightInit::Zeros,
            )?)
        } else {
            None
        };
        Self::from_weights(weight, bias, in_features, out_features, parallel, comm)
    }

    /// Wrap already-sharded tensors.
    pub fn from_weights(
        weight: Tensor,
        bias: Option<Tensor>,
        in_features: usize,
        out_features: usize,
        parallel: ParallelConfig,
        comm: Arc<dyn Communicator>,
    ) -> Result<Self> {
        if parallel.tensor_parallel_size != comm.world_size() {
            return Err(TesseraError::Config(format!(
                "parallel config expects {} ranks, communicator has {}",
                parallel.tensor_parallel_size,
                comm.world_size()
            )));
        }
        let expected = parallel
            .shard_for_weight()
            .local_shape(&[out_features, in_features])?;
        if weight.dims() != expected.as_slice() {
            return Err(TesseraError::ShapeMismatch(format!(
                "linear weight: expected {:?}, got {:?}",
                expected,
                weight.dims()
            )));
        }
        Ok(Self {
            weight,
            bias,
            in_features,
            out_features,
            parallel,
            comm,
        })
    }

    /// Rank-local projection without any communication.
    ///
    /// Column-parallel: this rank's slice of the output features, bias added.
    /// Row-parallel: a partial sum over this rank's input features, bias not
    /// yet added.
    pub fn forward_local(&self, x: &Tensor) -> Result<Tensor> {
        let out = matmul_last(x, &self.weight)?;
        match (self.parallel.tensor_parallel_mode, &self.bias) {
            (TensorParallelMode::Column, Some(bias)) => Ok(out.broadcast_add(bias)?),
            _ => Ok(out),
        }
    }

    /// Full projection for this rank.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let local = self.forward_local(x)?;
        match self.parallel.tensor_parallel_mode {
            TensorParallelMode::Column => {
                if self.parallel.gather_output && self.parallel.is_parallel() {
                    self.comm.all_gather(&local, local.rank() - 1)
                } else {
                    Ok(local)
                }
            }
            TensorParallelMode::Row => {
                let reduced = if self.parallel.is_parallel() {
                    self.comm.all_reduce(&local)?
                } else {
                    local
                };
                match &self.bias {
                    Some(bias) => Ok(reduced.broadcast_add(bias)?),
                    None => Ok(reduced),
                }
            }
        }
    }

    /// Local weight slice.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Local bias slice.
    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    /// Unsharded input features.
    pub fn in_features(&self) -> usize {
        self.in_features
    }

    /// Unsharded output features.
    pub fn out_features(&self) -> usize {
        self.out_features
    }

    /// Sharding descriptor.
    pub fn parallel_config(&self) -> &ParallelConfig {
        &self.parallel
    }
}

impl std::fmt::Debug for ParallelLinear {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelLinear")
            .field("in_features", &self.in_features)
            .field("out_features", &self.out_features)
            .field("local_shape", &self.weight.dims())
            .field("bias", &self.bias.is_some())
            .field("parallel", &self.parallel)
            .finish()
    }
}

/// `x @ weight^T` over the last dimension of `x`, any leading shape.
pub(crate) fn matmul_last(x: &Tensor, weight: &Tensor) -> Result<Tensor> {
    let dims = x.dims();
    let in_features = dims[dims.len() - 1];
    let rows = x.elem_count() / in_features;

    let out = x.reshape((rows, in_features))?.matmul(&weight.t()?)?;

    let mut out_dims = dims.to_vec();
    out_dims[dims.len() - 1] = weight.dim(0)?;
    Ok(out.reshape(out_dims)?)
}
