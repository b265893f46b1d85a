//! Attention backend trait and reference implementation.
//!
//! This module provides:
//! - [`AttentionBackend`] - Trait for attention computation backends
//! - [`ReferenceBackend`] - CPU reference implementation for testing
//! - [`AttentionConfig`] - Per-layer attention shape and options

use super::{AttentionMetadata, SequenceCache};
use crate::error::{Result, TesseraError};
use crate::model::{PositionalEmbeddingParams, RopeParams, RotaryEmbedding};
use candle_core::{DType, Device, Tensor, D};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Configuration for attention computation.
#[derive(Debug, Clone, PartialEq)]
pub struct AttentionConfig {
    /// Number of query heads held by this rank.
    pub num_heads: usize,
    /// Number of KV heads held by this rank (for GQA).
    pub num_kv_heads: usize,
    /// Head dimension.
    pub head_dim: usize,
    /// Softmax scale (1/sqrt(head_dim) by default).
    pub scale: f32,
    /// Rotary applied inside the backend. `None` means q/k arrive rotated.
    pub pos_embd: Option<PositionalEmbeddingParams>,
}

impl AttentionConfig {
    /// Create a new attention config.
    pub fn new(num_heads: usize, num_kv_heads: usize, head_dim: usize) -> Self {
        Self {
            num_heads,
            num_kv_heads,
            head_dim,
            scale: 1.0 / (head_dim as f32).sqrt(),
            pos_embd: None,
        }
    }

    /// Ask the backend to apply rotary itself.
    pub fn with_pos_embd(mut self, params: PositionalEmbeddingParams) -> Self {
        self.pos_embd = Some(params);
        self
    }

    /// Number of query heads per KV head (for GQA).
    pub fn num_queries_per_kv(&self) -> usize {
        self.num_heads / self.num_kv_heads
    }
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self::new(8, 8, 64) // 8 heads, 64 dim
    }
}

/// Backend for attention computation.
///
/// Receives head-split projections and returns the attention context for
/// every query position. Implementations own any KV cache; the model never
/// touches cached state directly.
pub trait AttentionBackend: Send + Sync {
    /// Compute causal attention for one layer.
    ///
    /// # Arguments
    ///
    /// * `layer_idx` - Decoder layer index, used as the cache slot
    /// * `query` - [batch, num_heads, seq_len, head_dim]
    /// * `key` / `value` - [batch, num_kv_heads, seq_len, head_dim]
    /// * `position_ids` - [batch, seq_len], used when rotary is fused
    ///
    /// Returns [batch, num_heads, seq_len, head_dim].
    #[allow(clippy::too_many_arguments)]
    fn forward(
        &self,
        layer_idx: usize,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        position_ids: &Tensor,
        metadata: &AttentionMetadata,
        config: &AttentionConfig,
    ) -> Result<Tensor>;
}

/// Reference CPU implementation for testing.
///
/// This implementation stores KV cache in memory, one [`SequenceCache`] per
/// sequence id, and performs standard scaled dot-product attention in f32.
/// It's not optimized for performance but is useful for correctness testing.
///
/// # Example
///
/// ```rust,ignore
/// use tessera_core::attention::{AttentionBackend, AttentionConfig, AttentionMetadata, ReferenceBackend};
///
/// let backend = ReferenceBackend::new();
/// let config = AttentionConfig::new(8, 8, 64);
/// let metadata = AttentionMetadata::context(1);
///
/// let output = backend.forward(0, &query, &key, &value, &position_ids, &metadata, &config)?;
/// ```
#[derive(Debug, Default)]
pub struct ReferenceBackend {
    /// In-memory KV cache storage: seq_id -> per-layer caches
    kv_cache: RwLock<HashMap<u64, SequenceCache>>,
    /// Rotary tables for fused positional embedding, rebuilt when params change.
    rotary: RwLock<Option<(RopeParams, RotaryEmbedding)>>,
}

impl ReferenceBackend {
    /// Create a new reference backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear the KV cache.
    pub fn clear_cache(&self) {
        self.kv_cache.write().clear();
    }

    /// Drop every cached layer of a sequence.
    pub fn release(&self, seq_id: u64) -> bool {
        self.kv_cache.write().remove(&seq_id).is_some()
    }

    /// Tokens cached for a sequence at a layer.
    pub fn cached_len(&self, seq_id: u64, layer_idx: usize) -> usize {
        self.kv_cache
            .read()
            .get(&seq_id)
            .map(|cache| cache.seq_len(layer_idx))
            .unwrap_or(0)
    }

    /// Number of sequences with cached state.
    pub fn num_sequences(&self) -> usize {
        self.kv_cache.read().len()
    }

    fn rotary(&self, params: &PositionalEmbeddingParams, device: &Device) -> Result<RotaryEmbedding> {
        if let Some((cached, rope)) = self.rotary.read().as_ref() {
            if *cached == params.rope {
                return Ok(rope.clone());
            }
        }
        let rope = RotaryEmbedding::from_params(&params.rope, device)?;
        *self.rotary.write() = Some((params.rope, rope.clone()));
        Ok(rope)
    }

    /// Append one row's KV to its cache and return the full history.
    fn extend_cache(
        &self,
        seq_id: u64,
        layer_idx: usize,
        past: usize,
        key: &Tensor,
        value: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let mut caches = self.kv_cache.write();
        let layer = caches.entry(seq_id).or_default().layer_mut(layer_idx);

        // A fresh context pass reuses the slot
        if past == 0 {
            layer.clear();
        }
        if layer.seq_len() != past {
            return Err(TesseraError::Attention(format!(
                "sequence {} layer {}: cache holds {} tokens, metadata reports {}",
                seq_id,
                layer_idx,
                layer.seq_len(),
                past
            )));
        }
        layer.append(key, value)
    }

    /// Create causal mask `[q_len, kv_len]` where query `i` sits at `offset + i`.
    fn create_causal_mask(q_len: usize, kv_len: usize, offset: usize, device: &Device) -> Result<Tensor> {
        let mask: Vec<f32> = (0..q_len)
            .flat_map(|i| {
                (0..kv_len).map(move |j| if j > offset + i { f32::NEG_INFINITY } else { 0.0 })
            })
            .collect();
        Ok(Tensor::from_vec(mask, (q_len, kv_len), device)?)
    }

    /// Scaled dot-product attention for a single batch row.
    fn attend(query: &Tensor, key: &Tensor, value: &Tensor, config: &AttentionConfig) -> Result<Tensor> {
        let q_len = query.dim(2)?;
        let kv_len = key.dim(2)?;
        if kv_len < q_len {
            return Err(TesseraError::Attention(format!(
                "{} queries against {} keys",
                q_len, kv_len
            )));
        }
        let dtype = query.dtype();

        let query = query.to_dtype(DType::F32)?.contiguous()?;
        let key = repeat_kv(&key.to_dtype(DType::F32)?, config.num_queries_per_kv())?;
        let value = repeat_kv(&value.to_dtype(DType::F32)?, config.num_queries_per_kv())?;

        // Q @ K^T -> [1, num_heads, q_len, kv_len]
        let scores = (query.matmul(&key.t()?.contiguous()?)? * config.scale as f64)?;
        let mask = Self::create_causal_mask(q_len, kv_len, kv_len - q_len, query.device())?;
        let scores = scores.broadcast_add(&mask)?;

        let probs = candle_nn::ops::softmax(&scores, D::Minus1)?;
        Ok(probs.matmul(&value)?.to_dtype(dtype)?)
    }
}

/// Repeat KV heads so each query head has its own copy:
/// [b, kv_heads, s, d] -> [b, kv_heads * n_rep, s, d]
fn repeat_kv(x: &Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x.contiguous()?);
    }
    let (b, kv_heads, s, d) = x.dims4()?;
    Ok(Tensor::cat(&vec![x; n_rep], 2)?.reshape((b, kv_heads * n_rep, s, d))?)
}

impl AttentionBackend for ReferenceBackend {
    fn forward(
        &self,
        layer_idx: usize,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        position_ids: &Tensor,
        metadata: &AttentionMetadata,
        config: &AttentionConfig,
    ) -> Result<Tensor> {
        let (batch, num_heads, seq_len, head_dim) = query.dims4()?;
        let (_, num_kv_heads, _, _) = key.dims4()?;
        if num_heads != config.num_heads
            || num_kv_heads != config.num_kv_heads
            || head_dim != config.head_dim
        {
            return Err(TesseraError::ShapeMismatch(format!(
                "attention expects {}q/{}kv heads of {}, got {:?} and {:?}",
                config.num_heads,
                config.num_kv_heads,
                config.head_dim,
                query.dims(),
                key.dims()
            )));
        }
        if batch != metadata.batch_size() {
            return Err(TesseraError::Attention(format!(
                "batch of {} rows with metadata for {}",
                batch,
                metadata.batch_size()
            )));
        }

        let (query, key) = match &config.pos_embd {
            Some(params) => self
                .rotary(params, query.device())?
                .apply(query, key, position_ids)?,
            None => (query.clone(), key.clone()),
        };

        tracing::trace!(layer_idx, batch, seq_len, cached = metadata.use_cache(), "attention");

        let mut outputs = Vec::with_capacity(batch);
        for row in 0..batch {
            let q = query.narrow(0, row, 1)?;
            let k = key.narrow(0, row, 1)?;
            let v = value.narrow(0, row, 1)?;

            let (k, v) = if metadata.use_cache() {
                self.extend_cache(
                    metadata.seq_ids()[row],
                    layer_idx,
                    metadata.past_seen_tokens()[row],
                    &k,
                    &v,
                )?
            } else {
                (k, v)
            };
            outputs.push(Self::attend(&q, &k, &v, config)?);
        }

        Ok(Tensor::cat(&outputs, 0)?)
    }
}
