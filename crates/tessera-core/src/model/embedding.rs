//! Tensor-parallel token embedding.

use super::{WeightInit, WeightSource};
use crate::error::{Result, TesseraError};
use crate::parallel::{Communicator, ParallelConfig, TensorParallelMode};
use candle_core::{DType, Tensor};
use std::sync::Arc;

/// Token embedding table `[num_embeddings, embedding_dim]`.
///
/// Column mode shards the vocabulary: ids outside this rank's range embed
/// to zero and the partial lookups are summed across ranks. Row mode shards
/// the embedding dimension and gathers it back when `gather_output` is set.
#[derive(Clone)]
pub struct Embedding {
    /// Local table slice.
    weight: Tensor,
    num_embeddings: usize,
    embedding_dim: usize,
    /// First vocabulary id held by this rank.
    vocab_start: usize,
    /// One past the last vocabulary id held by this rank.
    vocab_end: usize,
    parallel: ParallelConfig,
    comm: Arc<dyn Communicator>,
}

impl Embedding {
    /// Load `{prefix}.weight` from a weight source.
    pub fn load(
        weights: &dyn WeightSource,
        prefix: &str,
        num_embeddings: usize,
        embedding_dim: usize,
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
        let weight = weights.get(
            &format!("{}.weight", prefix),
            &[num_embeddings, embedding_dim],
            parallel.shard_for_weight(),
            WeightInit::PROJECTION,
        )?;

        let (vocab_start, vocab_end) = match parallel.tensor_parallel_mode {
            TensorParallelMode::Column => {
                let per_rank = weight.dim(0)?;
                let start = parallel.tensor_parallel_rank * per_rank;
                (start, start + per_rank)
            }
            TensorParallelMode::Row => (0, num_embeddings),
        };

        Ok(Self {
            weight,
            num_embeddings,
            embedding_dim,
            vocab_start,
            vocab_end,
            parallel,
            comm,
        })
    }

    /// Look up token ids `[batch, seq_len]` → `[batch, seq_len, embedding_dim]`.
    ///
    /// Ids may be u8, u32 or i64; any id outside `0..num_embeddings` is a
    /// validation error on every rank.
    pub fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let (batch, seq_len) = input_ids.dims2()?;
        let local_dim = self.weight.dim(1)?;
        let ids = self.token_ids(input_ids)?;

        if !self.parallel.is_parallel() {
            let flat = Tensor::from_vec(ids, batch * seq_len, self.weight.device())?;
            let out = self.weight.index_select(&flat, 0)?;
            return Ok(out.reshape((batch, seq_len, local_dim))?);
        }

        match self.parallel.tensor_parallel_mode {
            TensorParallelMode::Column => {
                let (local_ids, mask) = self.localize(&ids)?;
                let out = self
                    .weight
                    .index_select(&local_ids, 0)?
                    .broadcast_mul(&mask)?
                    .reshape((batch, seq_len, local_dim))?;
                self.comm.all_reduce(&out)
            }
            TensorParallelMode::Row => {
                let flat = Tensor::from_vec(ids, batch * seq_len, self.weight.device())?;
                let out = self
                    .weight
                    .index_select(&flat, 0)?
                    .reshape((batch, seq_len, local_dim))?;
                if self.parallel.gather_output {
                    self.comm.all_gather(&out, 2)
                } else {
                    Ok(out)
                }
            }
        }
    }

    /// Flattened ids, checked against the full vocabulary.
    fn token_ids(&self, input_ids: &Tensor) -> Result<Vec<u32>> {
        let ids: Vec<i64> = match input_ids.dtype() {
            DType::U8 | DType::U32 | DType::I64 => {
                input_ids.flatten_all()?.to_dtype(DType::I64)?.to_vec1()?
            }
            other => {
                return Err(TesseraError::Validation(format!(
                    "token ids must be an integer tensor, got {:?}",
                    other
                )))
            }
        };
        ids.into_iter()
            .map(|id| match u32::try_from(id) {
                Ok(id) if (id as usize) < self.num_embeddings => Ok(id),
                _ => Err(TesseraError::Validation(format!(
                    "token id {} outside vocabulary of {}",
                    id, self.num_embeddings
                ))),
            })
            .collect()
    }

    /// Map global ids to this rank's rows plus a `[n, 1]` keep-mask.
    fn localize(&self, ids: &[u32]) -> Result<(Tensor, Tensor)> {
        let (local, keep): (Vec<u32>, Vec<f32>) = ids
            .iter()
            .map(|&id| {
                let id = id as usize;
                if (self.vocab_start..self.vocab_end).contains(&id) {
                    ((id - self.vocab_start) as u32, 1.0)
                } else {
                    (0, 0.0)
                }
            })
            .unzip();

        let device = self.weight.device();
        let n = local.len();
        let local = Tensor::from_vec(local, n, device)?;
        let keep = Tensor::from_vec(keep, (n, 1), device)?.to_dtype(self.weight.dtype())?;
        Ok((local, keep))
    }

    /// Local table slice.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Unsharded vocabulary size.
    pub fn num_embeddings(&self) -> usize {
        self.num_embeddings
    }

    /// Unsharded embedding dimension.
    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    /// Vocabulary range held by this rank.
    pub fn vocab_range(&self) -> std::ops::Range<usize> {
        self.vocab_start..self.vocab_end
    }

    /// Sharding descriptor.
    pub fn parallel_config(&self) -> &ParallelConfig {
        &self.parallel
    }

    /// Dtype of the table.
    pub fn dtype(&self) -> DType {
        self.weight.dtype()
    }
}

impl std::fmt::Debug for Embedding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Embedding")
            .field("num_embeddings", &self.num_embeddings)
            .field("embedding_dim", &self.embedding_dim)
            .field("vocab_range", &self.vocab_range())
            .field("parallel", &self.parallel)
            .finish()
    }
}
