//! Per-step attention metadata.

use crate::error::{Result, TesseraError};
use candle_core::{Device, Tensor};

/// Batching and caching context for one forward step.
///
/// Built by the host for every step and passed through the model to the
/// attention backend untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttentionMetadata {
    /// Cache key of each batch row.
    seq_ids: Vec<u64>,
    /// Tokens already in the cache for each batch row.
    past_seen_tokens: Vec<usize>,
    /// Read and extend the backend's KV cache.
    use_cache: bool,
}

impl AttentionMetadata {
    /// Uncached context pass over `batch_size` fresh sequences.
    pub fn context(batch_size: usize) -> Self {
        Self {
            seq_ids: (0..batch_size as u64).collect(),
            past_seen_tokens: vec![0; batch_size],
            use_cache: false,
        }
    }

    /// Cached step for the given sequences.
    pub fn new(seq_ids: Vec<u64>, past_seen_tokens: Vec<usize>) -> Result<Self> {
        if seq_ids.len() != past_seen_tokens.len() {
            return Err(TesseraError::Attention(format!(
                "{} sequence ids but {} past lengths",
                seq_ids.len(),
                past_seen_tokens.len()
            )));
        }
        Ok(Self {
            seq_ids,
            past_seen_tokens,
            use_cache: true,
        })
    }

    /// Enable or disable KV caching.
    pub fn with_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    /// Metadata for the next step after `num_tokens` more tokens per row.
    pub fn advanced(&self, num_tokens: usize) -> Self {
        Self {
            seq_ids: self.seq_ids.clone(),
            past_seen_tokens: self
                .past_seen_tokens
                .iter()
                .map(|past| past + num_tokens)
                .collect(),
            use_cache: self.use_cache,
        }
    }

    /// Default positions `past + i` for a step of `seq_len` tokens: [batch, seq_len].
    pub fn position_ids(&self, seq_len: usize, device: &Device) -> Result<Tensor> {
        let data: Vec<u32> = self
            .past_seen_tokens
            .iter()
            .flat_map(|&past| (past..past + seq_len).map(|p| p as u32))
            .collect();
        Ok(Tensor::from_vec(data, (self.batch_size(), seq_len), device)?)
    }

    /// Cache key of each batch row.
    pub fn seq_ids(&self) -> &[u64] {
        &self.seq_ids
    }

    /// Tokens already cached for each batch row.
    pub fn past_seen_tokens(&self) -> &[usize] {
        &self.past_seen_tokens
    }

    /// Whether the backend cache is used.
    pub fn use_cache(&self) -> bool {
        self.use_cache
    }

    /// Number of batch rows.
    pub fn batch_size(&self) -> usize {
        self.seq_ids.len()
    }

    /// True when no row has cached context.
    pub fn is_context(&self) -> bool {
        self.past_seen_tokens.iter().all(|&p| p == 0)
    }
}
